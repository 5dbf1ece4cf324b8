//! Git adapter for change-status context.
//!
//! The agent never commits; it only reads branch, status and diff stats so the model can see
//! what earlier attempts changed. Every git call is bounded by the command timeout and stops
//! when the run is cancelled.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::io::process::{CancelToken, CommandOutput, own_process_group, run_command_with_timeout};

/// Captured bytes per git stream; the context budget trims further.
const GIT_OUTPUT_LIMIT: usize = 1_000_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration, cancel: CancelToken) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
            cancel,
        }
    }

    /// Return the current branch name, or `HEAD (detached)`.
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Ok("HEAD (detached)".to_string());
        }
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn diff_stat(&self) -> Result<String> {
        let out = self.run_capture(&["diff", "--stat"])?;
        Ok(out.trim_end().to_string())
    }

    /// Branch, status and diff stat rendered for the context bundle.
    #[instrument(skip_all)]
    pub fn change_summary(&self) -> Result<String> {
        let branch = self.current_branch()?;
        let entries = self.status_porcelain()?;
        let stat = self.diff_stat()?;
        debug!(branch = %branch, changed = entries.len(), "collected git status");

        let mut buf = format!("branch: {branch}\n");
        if entries.is_empty() {
            buf.push_str("status: clean\n");
        } else {
            buf.push_str("status:\n");
            for entry in &entries {
                buf.push_str(&format!("{} {}\n", entry.code, entry.path));
            }
        }
        if !stat.is_empty() {
            buf.push_str("diff --stat:\n");
            buf.push_str(&stat);
            buf.push('\n');
        }
        Ok(buf)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let line = args.join(" ");
        if self.cancel.is_cancelled() {
            bail!("run cancelled before git {line} started");
        }
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        own_process_group(&mut cmd);
        let output = run_command_with_timeout(cmd, self.timeout, GIT_OUTPUT_LIMIT, &self.cancel)
            .with_context(|| format!("run git {line}"))?;
        if output.timed_out {
            bail!("git {line} timed out after {}s", self.timeout.as_secs());
        }
        if output.cancelled {
            bail!("git {line} cancelled");
        }
        Ok(output)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn short_line_is_rejected() {
        assert!(parse_status_line("M").is_err());
    }

    #[test]
    fn outside_a_repository_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let git = Git::new(
            temp.path().join("missing"),
            Duration::from_secs(10),
            CancelToken::new(),
        );
        assert!(git.change_summary().is_err());
    }

    #[test]
    fn cancelled_run_never_spawns_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel();
        let git = Git::new(temp.path(), Duration::from_secs(10), cancel);

        let err = git.change_summary().unwrap_err();
        assert!(format!("{err:#}").contains("run cancelled before git"));
    }
}
