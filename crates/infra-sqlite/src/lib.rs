// Gateway Infrastructure - SQLite Adapter
// Implements: QueueStore, QueueHandle, QueueTransaction (lease based)

mod connection;
mod migration;
mod queue_store;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use queue_store::{SqliteQueueStore, SqliteQueueTransaction, CORRUPT_SUFFIX};

// Note: sqlx::Error conversion is handled by a helper function in queue_store
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for QueueError here)
