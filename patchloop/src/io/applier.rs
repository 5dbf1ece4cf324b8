//! Action applier: executes parsed directives against the working tree.
//!
//! Directive-level failures never escape this module. They become history entries and
//! NOTES.txt lines, and the rest of the batch still runs.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::commands::{CommandDecision, CommandFilter};
use crate::core::types::{Directive, ParsedResponse};
use crate::io::artifacts;
use crate::io::paths::AgentPaths;
use crate::io::process::{CommandResult, CommandRunner};

/// What happened while applying one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Relative paths written, in order.
    pub files_written: Vec<String>,
    /// Commands that actually ran, in order.
    pub executed: Vec<CommandResult>,
    /// Commands that were not run, with the reason.
    pub skipped: Vec<(String, CommandDecision)>,
    /// History entries for the attempt state, oldest first.
    pub history: Vec<String>,
    /// TextNote contents, in order.
    pub notes: Vec<String>,
    /// Rejected or failed file writes, as `path: reason`.
    pub write_failures: Vec<String>,
    /// True if any executed command failed. Write failures do not count.
    pub batch_failed: bool,
    pub complete_seen: bool,
}

pub struct ActionApplier<'a, R: CommandRunner> {
    paths: &'a AgentPaths,
    runner: &'a R,
    filter: &'a CommandFilter,
}

impl<'a, R: CommandRunner> ActionApplier<'a, R> {
    pub fn new(paths: &'a AgentPaths, runner: &'a R, filter: &'a CommandFilter) -> Self {
        Self {
            paths,
            runner,
            filter,
        }
    }

    /// Apply directives strictly in response order.
    #[instrument(skip_all, fields(directives = parsed.directives.len()))]
    pub fn apply(&self, parsed: &ParsedResponse) -> ApplyReport {
        let mut report = ApplyReport {
            complete_seen: parsed.complete,
            ..ApplyReport::default()
        };
        let mut executed = HashSet::new();

        for directive in &parsed.directives {
            match directive {
                Directive::FileWrite { path, content } => {
                    self.apply_write(path, content, &mut report);
                }
                Directive::CliCommand { command } => {
                    self.apply_command(command, &mut executed, &mut report);
                }
                Directive::TextNote { content } => report.notes.push(content.clone()),
                Directive::CompleteSignal | Directive::UpgradeSignal { .. } => {}
            }
        }

        info!(
            files = report.files_written.len(),
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            write_failures = report.write_failures.len(),
            batch_failed = report.batch_failed,
            "directives applied"
        );
        report
    }

    fn apply_write(&self, path: &str, content: &str, report: &mut ApplyReport) {
        match write_file(self.paths.root(), path, content) {
            Ok(written) => {
                debug!(path = %written.display(), bytes = content.len(), "wrote file");
                report.files_written.push(path.to_string());
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(path, err = %message, "file write failed");
                artifacts::append_note(self.paths, "file", "apply", &message);
                report.history.push(format!("write {path} failed: {message}"));
                report.write_failures.push(format!("{path}: {message}"));
            }
        }
    }

    fn apply_command(
        &self,
        command: &str,
        executed: &mut HashSet<String>,
        report: &mut ApplyReport,
    ) {
        let decision = self.filter.check(command, executed);
        if decision != CommandDecision::Run {
            let why = match &decision {
                CommandDecision::Duplicate => "already ran in this response".to_string(),
                CommandDecision::InvalidShape => "invalid command shape".to_string(),
                CommandDecision::Denied { pattern } => format!("matches denylist '{pattern}'"),
                CommandDecision::Run => String::new(),
            };
            info!(command, reason = %why, "skipping command");
            report.history.push(format!("$ {command}\nskipped: {why}"));
            report.skipped.push((command.to_string(), decision));
            return;
        }

        executed.insert(command.to_string());
        let result = match self.runner.run(command, self.paths.root()) {
            Ok(result) => result,
            Err(err) => {
                warn!(command, err = %format!("{err:#}"), "command failed to run");
                CommandResult::spawn_failure(command, &err)
            }
        };
        if !result.success() {
            report.batch_failed = true;
            let summary = format!(
                "`{command}` failed (exit {:?}{}): {}",
                result.exit_code,
                if result.timed_out { ", timed out" } else { "" },
                result.stderr.trim()
            );
            artifacts::append_note(self.paths, "cli", "apply", &summary);
        }
        report.history.push(result.history_entry());
        report.executed.push(result);
    }
}

/// Resolve `rel` under `root`, rejecting absolute paths and parent traversal.
pub fn resolve_inside(root: &Path, rel: &str) -> Result<PathBuf> {
    let candidate = Path::new(rel.trim());
    if candidate.as_os_str().is_empty() {
        return Err(anyhow!("empty file path"));
    }
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("path '{rel}' escapes the working directory"));
            }
        }
    }
    if resolved == root {
        return Err(anyhow!("path '{rel}' does not name a file"));
    }
    Ok(resolved)
}

/// Overwrite `rel` under `root`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) -> Result<PathBuf> {
    let path = resolve_inside(root, rel)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
