//! Attempt bookkeeping and the retry/terminate decision.
//!
//! [`AttemptState`] replaces process-wide mutable globals: the controller owns one value per
//! run and lends it to the other components for the duration of a single call.

use std::fmt;

use crate::core::types::ProviderKind;
use crate::core::verdict::Verdict;

/// Cancellation checkpoints within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    GatherContext,
    Dispatch,
    Escalate,
    Apply,
    Validate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::GatherContext => "gather_context",
            Phase::Dispatch => "dispatch",
            Phase::Escalate => "escalate",
            Phase::Apply => "apply",
            Phase::Validate => "validate",
        };
        f.write_str(name)
    }
}

/// Mutable state of one run, owned by the attempt controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptState {
    /// 1-indexed, monotonic, never above `max_attempts`.
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// One entry per failed attempt, oldest first. Append-only.
    pub summary_buffer: Vec<String>,
    /// Commands and their output for the current attempt, oldest first.
    pub command_history: Vec<String>,
    /// Provider used for the next dispatch.
    pub current_provider: ProviderKind,
    history_window: usize,
}

impl AttemptState {
    pub fn new(max_attempts: u32, provider: ProviderKind, history_window: usize) -> Self {
        Self {
            attempt_number: 1,
            max_attempts: max_attempts.max(1),
            summary_buffer: Vec::new(),
            command_history: Vec::new(),
            current_provider: provider,
            history_window: history_window.max(1),
        }
    }

    /// Append a history entry, dropping the oldest entries beyond the window.
    pub fn record_command(&mut self, entry: impl Into<String>) {
        self.command_history.push(entry.into());
        if self.command_history.len() > self.history_window {
            let excess = self.command_history.len() - self.history_window;
            self.command_history.drain(..excess);
        }
    }

    /// Command history, most recent first.
    pub fn history_recent_first(&self) -> impl Iterator<Item = &str> {
        self.command_history.iter().rev().map(String::as_str)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_number < self.max_attempts
    }

    /// Move to the next attempt: bump the counter, keep the summary, drop the history.
    pub fn begin_retry(&mut self, summary: String) {
        debug_assert!(self.has_attempts_left());
        self.attempt_number = (self.attempt_number + 1).min(self.max_attempts);
        self.summary_buffer.push(summary);
        self.command_history.clear();
    }
}

/// What the controller does after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Done,
    Retry { reason: String },
    Terminated { reason: String },
}

/// Decide the next transition from the current state and the attempt verdict.
pub fn decide(state: &AttemptState, verdict: &Verdict) -> Transition {
    match verdict {
        Verdict::Pass => Transition::Done,
        Verdict::Fail { reason } if state.has_attempts_left() => Transition::Retry {
            reason: reason.clone(),
        },
        Verdict::Fail { reason } => Transition::Terminated {
            reason: reason.clone(),
        },
    }
}

/// Build the summary entry for a failed attempt from its notes and failure reason.
pub fn attempt_summary(notes: &[&str], reason: &str) -> String {
    let mut buf = String::new();
    let notes: Vec<&str> = notes
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if notes.is_empty() {
        buf.push_str("(no notes)");
    } else {
        buf.push_str(&notes.join("\n"));
    }
    buf.push_str("\nOutcome: ");
    buf.push_str(reason.trim());
    buf
}
