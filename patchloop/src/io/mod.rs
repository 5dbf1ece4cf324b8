//! Side-effecting components: filesystem, subprocesses, git and provider HTTP.

pub mod applier;
pub mod artifacts;
pub mod config;
pub mod context;
pub mod gateway;
pub mod git;
pub mod listing;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod provider;
pub mod validation;
