//! Stable exit codes for the taskloop CLI.

/// Task completed through `attempt_completion`, or a container command succeeded.
pub const OK: i32 = 0;
/// Unrecoverable failure: no tool in a reply, completion error, bad config, container error.
pub const FAILED: i32 = 1;
/// `max_turns` reached without completion.
pub const TURN_LIMIT: i32 = 2;
/// Stopped by SIGINT.
pub const INTERRUPTED: i32 = 130;
