//! Admission rules for model-requested shell commands.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

static SHAPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w").expect("shape regex should be valid"));

/// Outcome of checking one command against the batch and the denylist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    Run,
    /// Identical command already executed in this response batch.
    Duplicate,
    /// Does not start with a word character.
    InvalidShape,
    /// Matches a denylist pattern.
    Denied { pattern: String },
}

/// Compiled denylist plus the minimal shape check.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    denylist: Vec<Regex>,
}

impl CommandFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let denylist = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref())
                    .with_context(|| format!("compile denylist pattern '{}'", p.as_ref()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { denylist })
    }

    /// Decide whether `command` may run, given the commands already executed in this batch.
    ///
    /// Checks run in a fixed order: duplicate, shape, denylist.
    pub fn check(&self, command: &str, executed: &HashSet<String>) -> CommandDecision {
        if executed.contains(command) {
            return CommandDecision::Duplicate;
        }
        if !SHAPE_RE.is_match(command) {
            return CommandDecision::InvalidShape;
        }
        if let Some(re) = self.denylist.iter().find(|re| re.is_match(command)) {
            return CommandDecision::Denied {
                pattern: re.as_str().to_string(),
            };
        }
        CommandDecision::Run
    }
}
