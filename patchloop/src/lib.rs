//! Autonomous, iterative code-modification agent.
//!
//! Given a natural-language instruction, the agent gathers a snapshot of the working tree,
//! asks a chat-completion provider for tagged directives, applies them, and runs the
//! project's lint and test commands. Failed attempts are summarized and fed into the next
//! attempt until the verdict passes or the attempt budget runs out.
//!
//! - **[`core`]**: Pure logic (response parsing, command filtering, verdicts, attempt state,
//!   context budgeting). No I/O.
//! - **[`io`]**: Side effects (filesystem, subprocesses, git, provider HTTP).
//!
//! [`controller`] drives one run and [`rewrite`] replays the last saved response.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod rewrite;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
