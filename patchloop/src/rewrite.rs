//! `patchloop rewrite`: replay the file writes of the last saved response.
//!
//! No provider is contacted and no command runs, so replaying twice leaves the tree in the
//! same state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::core::parser::parse_response;
use crate::core::types::Directive;
use crate::io::applier::write_file;
use crate::io::paths::AgentPaths;
use crate::io::provider::completion_content;

/// Re-apply every file write in `.patchloop/lastresponse.json`. Returns the paths written.
pub fn replay_last_response(root: &Path) -> Result<Vec<String>> {
    let paths = AgentPaths::new(root);
    let raw = fs::read_to_string(&paths.last_response_path)
        .with_context(|| format!("read {}", paths.last_response_path.display()))?;
    if raw.trim().is_empty() {
        bail!("{} is empty", paths.last_response_path.display());
    }
    let content = match completion_content(&raw) {
        Ok(content) => content,
        Err(reason) => {
            warn!(%reason, "saved response is not a chat completion, using raw text");
            raw
        }
    };

    let parsed = parse_response(&content);
    let mut written = Vec::new();
    for directive in &parsed.directives {
        if let Directive::FileWrite { path, content } = directive {
            write_file(root, path, content)?;
            written.push(path.clone());
        }
    }
    info!(files = written.len(), "replayed last response");
    Ok(written)
}
