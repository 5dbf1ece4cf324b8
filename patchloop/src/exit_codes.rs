//! Stable exit codes for the `patchloop` CLI.

/// The verdict passed, or `rewrite` replayed the last response.
pub const OK: i32 = 0;
/// Invalid input or configuration, missing credentials, or any other error.
pub const INVALID: i32 = 1;
/// Every attempt failed validation.
pub const MAX_ATTEMPTS: i32 = 2;
/// A provider chain was exhausted.
pub const PROVIDER_EXHAUSTED: i32 = 3;
/// Interrupted by SIGINT or SIGTERM.
pub const CANCELLED: i32 = 130;
