// Scheduler constants (no magic values)

/// Closed event streams kept for late subscribers
pub const DEFAULT_RETAINED_STREAMS: usize = 64;

/// Buffered queue-changed notifications per watcher before it lags
pub const DEFAULT_QUEUE_NOTIFY_CAPACITY: usize = 32;

/// Retired transactions kept in memory for lookups
pub const DEFAULT_RETIRED_CAPACITY: usize = 64;

/// Error code reported when the agent finishes unsuccessfully without
/// having raised an error first
pub const UNREPORTED_FAILURE_CODE: i32 = -1;
