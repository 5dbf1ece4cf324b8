//! Context assembler: the per-attempt bundle sent to the model.
//!
//! Every sub-collection is independent. A failure becomes an `unavailable: <reason>` section
//! body and a warning; assembly itself never fails.

use std::env;
use std::path::Path;

use anyhow::{Result, anyhow};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, instrument, warn};

use crate::core::budget::{Section, apply_budget, render_sections};
use crate::core::state::AttemptState;
use crate::io::config::AgentConfig;
use crate::io::git::Git;
use crate::io::listing::{IgnoreRules, list_files};
use crate::io::paths::AgentPaths;
use crate::io::process::{CancelToken, CommandRunner};
use crate::io::validation::{GateReport, ValidationGate};

pub const FILES: &str = "files";
pub const VALIDATION: &str = "validation";
pub const ENVIRONMENT: &str = "environment";
pub const COMMAND_HISTORY: &str = "commandHistory";
pub const ATTEMPT_SUMMARIES: &str = "attemptSummaries";
pub const CHANGES: &str = "changes";
pub const PREVIOUS_FAILURE: &str = "previousFailure";

/// Sections removed first when the bundle is over budget.
const DROP_ORDER: &[&str] = &[CHANGES, COMMAND_HISTORY, VALIDATION, FILES];

/// Ordered named sections for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBundle {
    pub sections: Vec<Section>,
}

impl ContextBundle {
    pub fn section(&self, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.content.as_str())
    }

    /// Each section wrapped in a tag named after its key.
    pub fn render(&self) -> String {
        render_sections(&self.sections)
    }
}

pub struct ContextAssembler<'a, R: CommandRunner> {
    paths: &'a AgentPaths,
    config: &'a AgentConfig,
    runner: &'a R,
    cancel: CancelToken,
}

impl<'a, R: CommandRunner> ContextAssembler<'a, R> {
    pub fn new(
        paths: &'a AgentPaths,
        config: &'a AgentConfig,
        runner: &'a R,
        cancel: &CancelToken,
    ) -> Self {
        Self {
            paths,
            config,
            runner,
            cancel: cancel.clone(),
        }
    }

    /// Build the bundle for the current attempt.
    ///
    /// `current_gate` is the report of a gate run with no changes since; when absent the gate
    /// runs now.
    #[instrument(skip_all, fields(attempt = state.attempt_number))]
    pub fn assemble(
        &self,
        state: &AttemptState,
        previous_failure: Option<&str>,
        current_gate: Option<&GateReport>,
    ) -> ContextBundle {
        let root = self.paths.root();
        let files = or_placeholder(FILES, self.file_listing());
        let validation = match current_gate {
            Some(report) => report.render(),
            None => ValidationGate::new(self.runner, &self.config.validation)
                .run(root)
                .render(),
        };
        let git = Git::new(root, self.config.command_timeout(), self.cancel.clone());
        let changes = or_placeholder(CHANGES, git.change_summary());

        let mut sections = vec![
            Section::droppable(FILES, files),
            Section::droppable(VALIDATION, validation),
            Section::required(ENVIRONMENT, self.environment(state)),
            Section::droppable(COMMAND_HISTORY, render_history(state)),
            Section::required(ATTEMPT_SUMMARIES, render_summaries(&state.summary_buffer)),
            Section::droppable(CHANGES, changes),
            Section::required(
                PREVIOUS_FAILURE,
                previous_failure
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("None."),
            ),
        ];
        apply_budget(&mut sections, self.config.context_budget_bytes, DROP_ORDER);
        debug!(
            sections = sections.len(),
            bytes = sections.iter().map(|s| s.content.len()).sum::<usize>(),
            "context assembled"
        );
        ContextBundle { sections }
    }

    fn file_listing(&self) -> Result<String> {
        let rules = IgnoreRules::load(self.paths)?;
        let listing = list_files(self.paths.root(), &rules, self.config.max_file_bytes)?;
        Ok(listing.render())
    }

    fn environment(&self, state: &AttemptState) -> String {
        let mut facts = vec![
            format!("os: {} ({})", env::consts::OS, env::consts::ARCH),
            format!("cwd: {}", self.paths.root().display()),
            format!("shell: {}", env_or_unknown(&["SHELL", "COMSPEC"])),
            format!("terminal: {}", env_or_unknown(&["TERM"])),
            format!(
                "date: {}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            format!("attempt: {} of {}", state.attempt_number, state.max_attempts),
            format!("provider: {}", state.current_provider),
        ];
        for check in &self.config.context.checks {
            let value = match self.run_check(&check.command, self.paths.root()) {
                Ok(output) => output,
                Err(err) => {
                    let err = format!("{err:#}");
                    warn!(check = %check.label, %err, "environment check failed");
                    format!("unavailable: {err}")
                }
            };
            facts.push(format!("{}: {value}", check.label));
        }
        facts.join("\n")
    }

    fn run_check(&self, command: &str, workdir: &Path) -> Result<String> {
        let result = self.runner.run(command, workdir)?;
        if !result.success() {
            return Err(anyhow!(
                "'{command}' exited with {:?}: {}",
                result.exit_code,
                result.stderr.trim()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }
}

fn or_placeholder(section: &str, collected: Result<String>) -> String {
    match collected {
        Ok(content) => content,
        Err(err) => {
            warn!(section, err = %format!("{err:#}"), "context collection failed");
            format!("unavailable: {err:#}")
        }
    }
}

fn env_or_unknown(keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn render_history(state: &AttemptState) -> String {
    if state.command_history.is_empty() {
        return "No commands run in this attempt yet.".to_string();
    }
    state.history_recent_first().collect::<Vec<_>>().join("\n\n")
}

fn render_summaries(summaries: &[String]) -> String {
    if summaries.is_empty() {
        return "None.".to_string();
    }
    summaries
        .iter()
        .enumerate()
        .map(|(i, summary)| {
            format!(
                "<attemptSummary number=\"{}\">\n{}\n</attemptSummary>",
                i + 1,
                summary.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::ProviderKind;
    use crate::test_support::{ScriptedRunner, TestWorkspace};

    fn config() -> AgentConfig {
        AgentConfig::default()
    }

    fn assembler<'a>(
        ws: &'a TestWorkspace,
        cfg: &'a AgentConfig,
        runner: &'a ScriptedRunner,
    ) -> ContextAssembler<'a, ScriptedRunner> {
        ContextAssembler::new(&ws.paths, cfg, runner, &CancelToken::new())
    }

    #[test]
    fn bundle_has_every_section_in_order() {
        let ws = TestWorkspace::new();
        ws.write("src/app.js", "console.log('hi');\n");
        let runner = ScriptedRunner::new().on_success("node -v", "v20.11.0\n");
        let cfg = config();
        let state = AttemptState::new(3, ProviderKind::Mistral, 100);

        let bundle = assembler(&ws, &cfg, &runner).assemble(&state, None, None);
        let keys: Vec<_> = bundle.sections.iter().map(|s| s.key).collect();
        assert_eq!(
            keys,
            vec![
                FILES,
                VALIDATION,
                ENVIRONMENT,
                COMMAND_HISTORY,
                ATTEMPT_SUMMARIES,
                CHANGES,
                PREVIOUS_FAILURE
            ]
        );
        assert!(bundle.section(FILES).expect("files").contains("--- src/app.js ---"));
        let env = bundle.section(ENVIRONMENT).expect("env");
        assert!(env.contains("attempt: 1 of 3"));
        assert!(env.contains("nodeVersion: v20.11.0"));
        assert_eq!(bundle.section(PREVIOUS_FAILURE), Some("None."));
    }

    /// A temp dir is not a git repository, so the change section degrades to a placeholder
    /// instead of failing the whole bundle.
    #[test]
    fn failing_collection_becomes_placeholder() {
        let ws = TestWorkspace::new();
        let runner = ScriptedRunner::new().on_failure("npm -v", 127, "npm: not found");
        let cfg = config();
        let state = AttemptState::new(3, ProviderKind::Mistral, 100);

        let bundle = assembler(&ws, &cfg, &runner).assemble(&state, None, None);
        assert!(
            bundle
                .section(CHANGES)
                .expect("changes")
                .starts_with("unavailable: ")
        );
        assert!(
            bundle
                .section(ENVIRONMENT)
                .expect("env")
                .contains("npmVersion: unavailable: ")
        );
    }

    #[test]
    fn history_is_recent_first_and_summaries_are_wrapped() {
        let ws = TestWorkspace::new();
        let runner = ScriptedRunner::new();
        let cfg = config();
        let mut state = AttemptState::new(5, ProviderKind::Mistral, 100);
        state.begin_retry("first try".to_string());
        state.begin_retry("second try".to_string());
        state.record_command("$ mkdir src");
        state.record_command("$ npm i express");

        let bundle = assembler(&ws, &cfg, &runner).assemble(
            &state,
            Some("Lint warnings found"),
            None,
        );
        let history = bundle.section(COMMAND_HISTORY).expect("history");
        assert!(history.find("npm i express") < history.find("mkdir src"));
        let summaries = bundle.section(ATTEMPT_SUMMARIES).expect("summaries");
        assert_eq!(summaries.matches("<attemptSummary").count(), 2);
        assert!(summaries.starts_with("<attemptSummary number=\"1\">\nfirst try\n"));
        assert_eq!(bundle.section(PREVIOUS_FAILURE), Some("Lint warnings found"));
    }

    #[test]
    fn current_gate_report_is_reused() {
        let ws = TestWorkspace::new();
        let runner = ScriptedRunner::new();
        let cfg = config();
        let state = AttemptState::new(2, ProviderKind::Mistral, 100);
        let report = ValidationGate::new(&runner, &cfg.validation).run(ws.root());
        let before = runner.calls().len();

        assembler(&ws, &cfg, &runner).assemble(&state, None, Some(&report));
        let gate_calls = runner.calls()[before..]
            .iter()
            .filter(|c| c.starts_with("npm run") || *c == "npm install")
            .count();
        assert_eq!(gate_calls, 0);
    }

    #[test]
    fn over_budget_bundle_drops_changes_first() {
        let ws = TestWorkspace::new();
        fs::write(ws.root().join("big.txt"), "x".repeat(2_000)).expect("write");
        let runner = ScriptedRunner::new();
        let cfg = AgentConfig {
            context_budget_bytes: 1_500,
            ..config()
        };
        let state = AttemptState::new(2, ProviderKind::Mistral, 100);

        let bundle = assembler(&ws, &cfg, &runner).assemble(&state, None, None);
        assert!(bundle.section(CHANGES).is_none());
        assert!(bundle.section(ENVIRONMENT).is_some());
        assert!(bundle.render().len() <= 1_500);
    }

    #[test]
    fn dotenv_contents_never_reach_the_bundle() {
        let ws = TestWorkspace::new();
        ws.write(".env", "MISTRAL_API_KEY=sk-super-secret\n");
        ws.write("src/app.js", "console.log('hi');\n");
        let runner = ScriptedRunner::new();
        let cfg = config();
        let state = AttemptState::new(2, ProviderKind::Mistral, 100);

        let bundle = assembler(&ws, &cfg, &runner).assemble(&state, None, None);
        let files = bundle.section(FILES).expect("files");
        assert!(files.contains("--- src/app.js ---"));
        assert!(!bundle.render().contains("sk-super-secret"));
    }

    #[test]
    fn cancelled_run_leaves_changes_unavailable() {
        let ws = TestWorkspace::new();
        let runner = ScriptedRunner::new();
        let cfg = config();
        let state = AttemptState::new(2, ProviderKind::Mistral, 100);
        let cancel = CancelToken::new();
        cancel.cancel();

        let bundle = ContextAssembler::new(&ws.paths, &cfg, &runner, &cancel)
            .assemble(&state, None, None);
        let changes = bundle.section(CHANGES).expect("changes");
        assert!(changes.starts_with("unavailable: "), "{changes}");
        assert!(changes.contains("cancelled"));
    }
}
