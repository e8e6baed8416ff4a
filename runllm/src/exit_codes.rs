//! Stable exit codes for `runllm` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// The program run (or check) failed; an error payload was printed.
pub const RUN_FAILED: i32 = 1;
/// Invalid usage, unreadable input, or bad config.
pub const INVALID: i32 = 2;
