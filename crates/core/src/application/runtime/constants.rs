// Runtime constants (no magic values)
use std::time::Duration;

/// Sleep after a failed tick before the worker loops again (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Upper bound on waiting for workers during stop (10s)
/// Teardown proceeds after this even if a worker is still busy
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts made to begin a queue transaction before giving up
pub const BEGIN_TRANSACTION_MAX_ATTEMPTS: u32 = 3;

/// Fixed delay between begin-transaction attempts (500ms)
pub const BEGIN_TRANSACTION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How often a store without change notification re-checks an empty queue (50ms)
pub const STORE_POLL_INTERVAL: Duration = Duration::from_millis(50);
