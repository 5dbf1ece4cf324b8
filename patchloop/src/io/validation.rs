//! Validation gate: the fixed install/lint/test sequence.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::verdict::ValidationResult;
use crate::io::config::ValidationConfig;
use crate::io::process::{CommandResult, CommandRunner};

/// Captured output of one gate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub install: CommandResult,
    pub lint: CommandResult,
    pub test: CommandResult,
}

impl GateReport {
    pub fn render(&self) -> String {
        [
            self.install.render("Install"),
            self.lint.render("Lint"),
            self.test.render("Test"),
        ]
        .join("\n\n")
    }

    /// Combine the gate output with the facts from the applied batch.
    pub fn to_result(&self, cli_batch_failed: bool, complete_seen: bool) -> ValidationResult {
        ValidationResult {
            lint_output: self.lint.render("Lint"),
            test_output: self.test.render("Test"),
            cli_batch_failed,
            complete_seen,
        }
    }
}

/// Runs the configured commands through the same runner the applier uses.
pub struct ValidationGate<'a, R: CommandRunner> {
    runner: &'a R,
    commands: &'a ValidationConfig,
}

impl<'a, R: CommandRunner> ValidationGate<'a, R> {
    pub fn new(runner: &'a R, commands: &'a ValidationConfig) -> Self {
        Self { runner, commands }
    }

    /// Run install, lint and test in order. Every step runs even if an earlier one failed.
    #[instrument(skip_all)]
    pub fn run(&self, workdir: &Path) -> GateReport {
        let report = GateReport {
            install: self.step(&self.commands.install, workdir),
            lint: self.step(&self.commands.lint, workdir),
            test: self.step(&self.commands.test, workdir),
        };
        info!(
            install_ok = report.install.success(),
            lint_ok = report.lint.success(),
            test_ok = report.test.success(),
            "validation gate finished"
        );
        report
    }

    fn step(&self, command: &str, workdir: &Path) -> CommandResult {
        match self.runner.run(command, workdir) {
            Ok(result) => result,
            Err(err) => {
                warn!(command, err = %format!("{err:#}"), "gate command failed to run");
                CommandResult::spawn_failure(command, &err)
            }
        }
    }
}
