//! Chat message rendering for a dispatch.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::types::{ChatMessage, ProviderKind};
use crate::io::context::ContextBundle;
use crate::io::paths::AgentPaths;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Renders the system prompt (grammar, rules, context) and the user instruction.
pub struct PromptBuilder {
    env: Environment<'static>,
    rules: Option<String>,
    escalation: Vec<&'static str>,
}

impl PromptBuilder {
    pub fn new(rules: Option<String>, escalation: &[ProviderKind]) -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self {
            env,
            rules: rules
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
            escalation: escalation.iter().map(|p| p.as_str()).collect(),
        }
    }

    /// Load project rules from `.cursor/rules` (a file, or a directory of rule files).
    pub fn from_root(paths: &AgentPaths, escalation: &[ProviderKind]) -> Result<Self> {
        let rules = read_rules(&paths.rules_path)?;
        debug!(has_rules = rules.is_some(), "prompt builder ready");
        Ok(Self::new(rules, escalation))
    }

    pub fn build_messages(
        &self,
        instruction: &str,
        bundle: &ContextBundle,
    ) -> Result<Vec<ChatMessage>> {
        let template = self.env.get_template("system")?;
        let system = template
            .render(context! {
                rules => self.rules.as_deref(),
                escalation => &self.escalation,
                context => bundle.render(),
            })
            .context("render system prompt")?;
        Ok(vec![
            ChatMessage::system(system),
            ChatMessage::user(format!(
                "<userInstruction>{}</userInstruction>\n",
                instruction.trim()
            )),
        ])
    }
}

fn read_rules(path: &Path) -> Result<Option<String>> {
    if path.is_file() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read rules {}", path.display()))?;
        return Ok(Some(contents));
    }
    if !path.is_dir() {
        return Ok(None);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("read dir {}", path.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", path.display()))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    let mut buf = String::new();
    for file in files {
        let contents =
            fs::read_to_string(&file).with_context(|| format!("read rules {}", file.display()))?;
        buf.push_str(contents.trim_end());
        buf.push_str("\n\n");
    }
    Ok(Some(buf))
}
