/// Prefix written in place of discarded older output.
pub const TRUNCATION_MARKER: &str = "... [Truncated for Performance] ...\n";

/// Appended when a job is stopped on request.
pub const STOPPED_MARKER: &str = "\n[stopped by user]\n";

/// Appended when a job or a client session hits its wall-clock ceiling.
pub const TIMEOUT_MARKER: &str = "\n[timed out]\n";

/// Appended once when a job's server-side output buffer is full.
pub const OUTPUT_LIMIT_MARKER: &str = "\n[output limit reached, further output discarded]\n";

/// Appended when the worker owning a job vanished without a result.
pub const RUNNER_LOST_MARKER: &str = "\n[runner exited without reporting a result]\n";
