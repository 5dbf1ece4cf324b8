//! Best-effort persistence of run artifacts.
//!
//! Artifacts are diagnostics for humans and for `rewrite`. A failed write is logged and
//! otherwise ignored; it never changes the outcome of a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use tracing::warn;

use crate::core::types::ChatMessage;
use crate::io::paths::AgentPaths;

/// Render messages the way they are stored in `lastprompt.txt`.
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut buf = String::new();
    for message in messages {
        buf.push_str(&format!("=== {} ===\n", message.role.as_str()));
        buf.push_str(&message.content);
        if !message.content.ends_with('\n') {
            buf.push('\n');
        }
    }
    buf
}

pub fn save_prompt(paths: &AgentPaths, messages: &[ChatMessage]) {
    if let Err(err) = write_text(&paths.last_prompt_path, &render_prompt(messages)) {
        warn!(err = %format!("{err:#}"), "failed to persist prompt");
    }
}

/// Persist a raw provider response body.
pub fn save_response(paths: &AgentPaths, raw: &str) {
    if let Err(err) = write_text(&paths.last_response_path, raw) {
        warn!(err = %format!("{err:#}"), "failed to persist response");
    }
}

/// Persist the payload of a failed provider call.
pub fn save_failure(paths: &AgentPaths, provider: &str, payload: &str) {
    let contents = format!("[{}] {provider}\n{payload}\n", timestamp());
    if let Err(err) = write_text(&paths.last_failure_path, &contents) {
        warn!(err = %format!("{err:#}"), "failed to persist failure payload");
    }
}

/// Append `[ts] Error in <tool> (<phase>): <error>` to NOTES.txt.
pub fn append_note(paths: &AgentPaths, tool: &str, phase: &str, error: &str) {
    let line = format!("[{}] Error in {tool} ({phase}): {error}\n", timestamp());
    if let Err(err) = append_text(&paths.notes_path, &line) {
        warn!(err = %format!("{err:#}"), "failed to append note");
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create artifact dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn append_text(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}
