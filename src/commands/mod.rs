pub mod dump_command;
pub mod options;
pub mod record_command;
pub mod replay_command;

/// Exit codes of the retrace binary itself. `record` mirrors the
/// tracee's own exit status instead.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Distinct code for an unreadable or damaged trace; scripts key on it.
pub const EXIT_TRACE_CORRUPT: i32 = 3;
