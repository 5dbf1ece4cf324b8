//! Attempt controller for `patchloop <instruction>`.
//!
//! One explicit loop drives gather → dispatch → parse → (escalate) → apply → validate until
//! the verdict passes or the attempt budget runs out.

use std::path::Path;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::core::commands::CommandFilter;
use crate::core::parser::parse_response;
use crate::core::state::{AttemptState, Phase, Transition, attempt_summary, decide};
use crate::core::types::{ChatMessage, ParsedResponse, ProviderKind};
use crate::core::verdict::Verdict;
use crate::io::applier::ActionApplier;
use crate::io::artifacts;
use crate::io::config::AgentConfig;
use crate::io::context::ContextAssembler;
use crate::io::gateway::{DispatchOutcome, Gateway, GatewayError};
use crate::io::paths::AgentPaths;
use crate::io::process::{CancelToken, CommandRunner};
use crate::io::prompt::PromptBuilder;
use crate::io::provider::{ChatBackend, Credentials};
use crate::io::validation::{GateReport, ValidationGate};

/// Errors that end a run. Callers recover them with `downcast_ref`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("instruction is empty")]
    EmptyInstruction,
    #[error("{0}")]
    NoCredential(String),
    #[error("attempt {attempt}: {source}")]
    ProviderExhausted {
        attempt: u32,
        #[source]
        source: GatewayError,
    },
    #[error("no success after {attempts} attempt(s): {reason}")]
    MaxAttemptsReached { attempts: u32, reason: String },
    #[error("run cancelled during attempt {attempt} ({phase})")]
    Cancelled { attempt: u32, phase: Phase },
}

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub instruction: String,
    pub requested_provider: ProviderKind,
    pub config: AgentConfig,
    pub credentials: Credentials,
    pub cancel: CancelToken,
}

/// Per-attempt summary passed to the `on_attempt` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt: u32,
    /// Provider whose response was applied.
    pub provider: ProviderKind,
    /// Set when the controller escalated after an upgrade marker.
    pub escalated_to: Option<ProviderKind>,
    /// Command history length when the attempt began.
    pub history_at_start: usize,
    /// Summary buffer length when the attempt began.
    pub summaries_at_start: usize,
    pub files_written: usize,
    /// File writes rejected or failed; they do not fail the verdict.
    pub write_failures: usize,
    pub commands_run: usize,
    pub commands_skipped: usize,
    pub malformed_tags: usize,
    pub verdict: Verdict,
}

/// Successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub attempts: u32,
    pub provider: ProviderKind,
    pub summaries: Vec<String>,
}

/// Run attempts until the verdict passes, a provider chain is exhausted or the budget ends.
pub fn run_attempts<B: ChatBackend, R: CommandRunner, F: FnMut(&AttemptReport)>(
    root: &Path,
    backend: &B,
    runner: &R,
    settings: &RunSettings,
    mut on_attempt: F,
) -> Result<RunOutcome> {
    let instruction = settings.instruction.trim();
    if instruction.is_empty() {
        return Err(RunError::EmptyInstruction.into());
    }
    let config = &settings.config;
    let paths = AgentPaths::new(root);
    let provider = settings
        .credentials
        .resolve_start(settings.requested_provider)
        .map_err(|err| RunError::NoCredential(format!("{err:#}")))?;
    if provider != settings.requested_provider {
        warn!(requested = %settings.requested_provider, using = %provider, "requested provider has no credential");
    }

    let warning_pattern = config.lint_warning_regex()?;
    let filter = CommandFilter::new(&config.commands.denylist)?;
    let prompt = match PromptBuilder::from_root(&paths, &config.providers.escalation_order) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "project rules unavailable");
            PromptBuilder::new(None, &config.providers.escalation_order)
        }
    };
    let gateway = Gateway::new(backend, &settings.credentials, &config.providers, &paths);
    let assembler = ContextAssembler::new(&paths, config, runner, &settings.cancel);
    let applier = ActionApplier::new(&paths, runner, &filter);
    let gate = ValidationGate::new(runner, &config.validation);

    let mut state = AttemptState::new(config.max_attempts, provider, config.history_window);
    let mut previous_failure: Option<String> = None;
    let mut current_gate: Option<GateReport> = None;
    info!(provider = %provider, max_attempts = state.max_attempts, "run started");

    loop {
        let span = info_span!("attempt", n = state.attempt_number);
        let _guard = span.enter();
        let history_at_start = state.command_history.len();
        let summaries_at_start = state.summary_buffer.len();

        check_cancel(&settings.cancel, &state, Phase::GatherContext)?;
        let bundle = assembler.assemble(&state, previous_failure.as_deref(), current_gate.as_ref());
        let messages = prompt.build_messages(instruction, &bundle)?;

        check_cancel(&settings.cancel, &state, Phase::Dispatch)?;
        let outcome = match gateway.dispatch(&messages, state.current_provider) {
            Ok(outcome) => outcome,
            Err(err) => {
                artifacts::append_note(&paths, "provider", "dispatch", &err.to_string());
                return Err(RunError::ProviderExhausted {
                    attempt: state.attempt_number,
                    source: err,
                }
                .into());
            }
        };
        if outcome.substituted {
            info!(provider = %outcome.provider, "adopting upgraded provider");
            state.current_provider = outcome.provider;
        }

        let mut parsed = parse_response(&outcome.response.content);
        let mut answered_by = outcome.provider;
        let mut escalated_to = None;
        if parsed.upgrade && !outcome.substituted {
            check_cancel(&settings.cancel, &state, Phase::Escalate)?;
            if let Some(escalated) =
                escalate(&gateway, &config.providers.escalation_order, &messages, answered_by)
            {
                state.current_provider = escalated.provider;
                answered_by = escalated.provider;
                escalated_to = Some(escalated.provider);
                parsed = parse_response(&escalated.response.content);
            }
        }
        log_parse(&parsed);

        check_cancel(&settings.cancel, &state, Phase::Apply)?;
        let applied = applier.apply(&parsed);
        for entry in &applied.history {
            state.record_command(entry.clone());
        }

        check_cancel(&settings.cancel, &state, Phase::Validate)?;
        let report = gate.run(root);
        let verdict = report
            .to_result(applied.batch_failed, parsed.complete)
            .verdict(&warning_pattern);

        on_attempt(&AttemptReport {
            attempt: state.attempt_number,
            provider: answered_by,
            escalated_to,
            history_at_start,
            summaries_at_start,
            files_written: applied.files_written.len(),
            write_failures: applied.write_failures.len(),
            commands_run: applied.executed.len(),
            commands_skipped: applied.skipped.len(),
            malformed_tags: parsed.malformed.len(),
            verdict: verdict.clone(),
        });

        match decide(&state, &verdict) {
            Transition::Done => {
                info!(attempts = state.attempt_number, "instruction completed");
                return Ok(RunOutcome {
                    attempts: state.attempt_number,
                    provider: state.current_provider,
                    summaries: state.summary_buffer,
                });
            }
            Transition::Retry { reason } => {
                info!(reason = %reason, "attempt failed, retrying");
                artifacts::append_note(&paths, "validation", "validate", &reason);
                let notes: Vec<&str> = applied.notes.iter().map(String::as_str).collect();
                state.begin_retry(attempt_summary(&notes, &reason));
                previous_failure = Some(reason);
                current_gate = Some(report);
            }
            Transition::Terminated { reason } => {
                warn!(reason = %reason, "attempt budget exhausted");
                artifacts::append_note(&paths, "validation", "terminated", &reason);
                return Err(RunError::MaxAttemptsReached {
                    attempts: state.attempt_number,
                    reason,
                }
                .into());
            }
        }
    }
}

/// Try providers in escalation order, skipping those without a credential. The first success
/// wins.
fn escalate<B: ChatBackend>(
    gateway: &Gateway<'_, B>,
    order: &[ProviderKind],
    messages: &[ChatMessage],
    answered_by: ProviderKind,
) -> Option<DispatchOutcome> {
    for candidate in order.iter().copied() {
        if !gateway.has_credential(candidate) {
            continue;
        }
        match gateway.dispatch_to(messages, candidate) {
            Ok(outcome) => {
                info!(from = %answered_by, to = %candidate, "escalated");
                return Some(outcome);
            }
            Err(err) => warn!(provider = %candidate, err = %err, "escalation candidate failed"),
        }
    }
    warn!("no escalation candidate answered, applying original response");
    None
}

fn log_parse(parsed: &ParsedResponse) {
    info!(
        files = parsed.file_writes(),
        commands = parsed.commands(),
        complete = parsed.complete,
        malformed = parsed.malformed.len(),
        "response parsed"
    );
}

fn check_cancel(cancel: &CancelToken, state: &AttemptState, phase: Phase) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RunError::Cancelled {
            attempt: state.attempt_number,
            phase,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::ProvidersConfig;
    use crate::io::provider::FailureClass;
    use crate::test_support::{ScriptedBackend, ScriptedRunner, TestWorkspace};

    fn settings(max_attempts: u32, pairs: &[(&str, &str)]) -> RunSettings {
        RunSettings {
            instruction: "add a health endpoint".to_string(),
            requested_provider: ProviderKind::Mistral,
            config: AgentConfig {
                max_attempts,
                providers: ProvidersConfig {
                    rate_limit_backoff_ms: 0,
                    retry_backoff_ms: 0,
                    ..ProvidersConfig::default()
                },
                ..AgentConfig::default()
            },
            credentials: Credentials::from_pairs(pairs),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn empty_instruction_is_rejected_before_dispatch() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new();
        let runner = ScriptedRunner::new();
        let mut settings = settings(3, &[("MISTRAL_API_KEY", "m")]);
        settings.instruction = "   ".to_string();

        let err = run_attempts(ws.root(), &backend, &runner, &settings, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::EmptyInstruction)
        ));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn missing_credentials_fail_fast() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new();
        let runner = ScriptedRunner::new();
        let settings = settings(3, &[]);

        let err = run_attempts(ws.root(), &backend, &runner, &settings, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::NoCredential(_))
        ));
    }

    #[test]
    fn complete_response_with_clean_gate_is_done() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new().reply(
            ProviderKind::Mistral,
            "<text>Added route.</text><file path=\"src/health.js\">ok</file><complete></complete>",
        );
        let runner = ScriptedRunner::new();
        let settings = settings(3, &[("MISTRAL_API_KEY", "m")]);
        let mut reports = Vec::new();

        let outcome = run_attempts(ws.root(), &backend, &runner, &settings, |r| {
            reports.push(r.clone());
        })
        .expect("run");
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.summaries.is_empty());
        assert_eq!(ws.read("src/health.js"), "ok");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].verdict.is_pass());
    }

    #[test]
    fn exhausted_provider_chain_terminates_run() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new().fail(ProviderKind::Mistral, FailureClass::Other);
        let runner = ScriptedRunner::new();
        let settings = settings(3, &[("MISTRAL_API_KEY", "m")]);

        let err = run_attempts(ws.root(), &backend, &runner, &settings, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::ProviderExhausted { attempt: 1, .. })
        ));
        assert!(ws.read("NOTES.txt").contains("Error in provider (dispatch)"));
    }

    #[test]
    fn upgrade_marker_escalates_in_configured_order() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new()
            .reply(ProviderKind::Mistral, "<text>stuck</text><upgradeModel>")
            .fail(ProviderKind::OpenRouter, FailureClass::Other)
            .reply(ProviderKind::Groq, "<complete/>");
        let runner = ScriptedRunner::new();
        let settings = settings(
            3,
            &[
                ("MISTRAL_API_KEY", "m"),
                ("OPENROUTER_API_KEY", "o"),
                ("GROQ_API_KEY", "g"),
            ],
        );
        let mut reports = Vec::new();

        let outcome = run_attempts(ws.root(), &backend, &runner, &settings, |r| {
            reports.push(r.clone());
        })
        .expect("run");
        assert_eq!(outcome.provider, ProviderKind::Groq);
        assert_eq!(reports[0].escalated_to, Some(ProviderKind::Groq));
        // together has no key, openrouter fails three times, groq answers.
        assert_eq!(
            backend.calls(),
            vec![
                ProviderKind::Mistral,
                ProviderKind::OpenRouter,
                ProviderKind::OpenRouter,
                ProviderKind::OpenRouter,
                ProviderKind::Groq
            ]
        );
    }

    /// The provider that asked for the upgrade stays in the escalation order and can answer
    /// when every provider ahead of it fails.
    #[test]
    fn escalation_falls_through_to_the_answering_provider() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new()
            .reply(ProviderKind::Mistral, "<upgradeModel>")
            .reply(ProviderKind::Mistral, "<complete/>")
            .fail(ProviderKind::OpenRouter, FailureClass::Other)
            .fail(ProviderKind::Groq, FailureClass::Other);
        let runner = ScriptedRunner::new();
        let settings = settings(
            1,
            &[
                ("MISTRAL_API_KEY", "m"),
                ("OPENROUTER_API_KEY", "o"),
                ("GROQ_API_KEY", "g"),
            ],
        );
        let mut reports = Vec::new();

        let outcome = run_attempts(ws.root(), &backend, &runner, &settings, |r| {
            reports.push(r.clone());
        })
        .expect("run");
        assert_eq!(outcome.provider, ProviderKind::Mistral);
        assert_eq!(reports[0].escalated_to, Some(ProviderKind::Mistral));
        assert!(reports[0].verdict.is_pass());
        let calls = backend.calls();
        assert_eq!(calls.first(), Some(&ProviderKind::Mistral));
        assert_eq!(calls.last(), Some(&ProviderKind::Mistral));
        assert_eq!(calls.iter().filter(|p| **p == ProviderKind::Groq).count(), 3);
    }

    /// A named upgrade is honored inside the gateway and becomes the run's provider.
    #[test]
    fn named_upgrade_is_adopted_for_later_attempts() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new()
            .reply(ProviderKind::Mistral, "<upgradeModel provider=\"groq\">")
            .reply(ProviderKind::Groq, "<text>tried</text>")
            .reply(ProviderKind::Groq, "<complete/>");
        let runner = ScriptedRunner::new();
        let settings = settings(2, &[("MISTRAL_API_KEY", "m"), ("GROQ_API_KEY", "g")]);

        let outcome = run_attempts(ws.root(), &backend, &runner, &settings, |_| {}).expect("run");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.provider, ProviderKind::Groq);
        assert_eq!(
            backend.calls(),
            vec![ProviderKind::Mistral, ProviderKind::Groq, ProviderKind::Groq]
        );
    }

    #[test]
    fn cancelled_run_stops_before_dispatch() {
        let ws = TestWorkspace::new();
        let backend = ScriptedBackend::new().reply(ProviderKind::Mistral, "<complete/>");
        let runner = ScriptedRunner::new();
        let settings = settings(3, &[("MISTRAL_API_KEY", "m")]);
        settings.cancel.cancel();

        let err = run_attempts(ws.root(), &backend, &runner, &settings, |_| {}).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::Cancelled { attempt: 1, .. })
        ));
        assert!(backend.calls().is_empty());
    }
}
