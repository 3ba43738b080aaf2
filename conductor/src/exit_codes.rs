//! Stable exit codes for conductor CLI commands.

/// Command succeeded, or the project completed.
pub const OK: i32 = 0;
/// Command failed due to invalid config, arguments, or other errors.
pub const INVALID: i32 = 1;
/// `conductor run` finished with the project in the `failed` status.
pub const PROJECT_FAILED: i32 = 2;
