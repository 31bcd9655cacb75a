// SQLite QueueStore Implementation
//
// Dequeue leases a row to the transaction with an atomic UPDATE ... RETURNING,
// so no database write transaction stays open while a stage processes the
// message. Commit deletes the leased rows and inserts the buffered enqueues in
// one short sqlx transaction. Abort clears the lease.

use crate::{create_pool, run_migrations};
use async_trait::async_trait;
use gateway_core::application::runtime::constants::STORE_POLL_INTERVAL;
use gateway_core::domain::QueueMessage;
use gateway_core::port::{
    Dequeued, QueueError, QueueHandle, QueueStore, QueueTransaction, TimeProvider,
};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Suffix of the queue that receives rows whose body cannot be decoded
pub const CORRUPT_SUFFIX: &str = "Corrupt";

/// SQLite primary result codes that mean this process may not use the database
/// (PERM, READONLY, CANTOPEN, AUTH)
const PERMISSION_CODES: [i32; 4] = [3, 8, 14, 23];

fn is_permission_code(code: &str) -> bool {
    code.parse::<i32>()
        .map(|extended| PERMISSION_CODES.contains(&(extended & 0xff)))
        .unwrap_or(false)
}

// Helper to convert sqlx::Error to QueueError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> QueueError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) if is_permission_code(code.as_ref()) => QueueError::PermissionDenied(
                format!("{} ({})", db_err.message(), code.as_ref()),
            ),
            Some(code) if code.as_ref() == "5" => {
                QueueError::Store(format!("Database locked (SQLITE_BUSY): {}", db_err.message()))
            }
            Some(code) => QueueError::Store(format!(
                "Database error [{}]: {}",
                code.as_ref(),
                db_err.message()
            )),
            None => QueueError::Store(format!("Database error: {}", db_err.message())),
        },
        _ => QueueError::Store(err.to_string()),
    }
}

struct Shared {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    /// Prefix of every lease taken by this store instance
    owner: String,
    next_lease: AtomicU64,
    committed: Notify,
    poll_interval: Duration,
}

/// Queue store over a single SQLite database
#[derive(Clone)]
pub struct SqliteQueueStore {
    shared: Arc<Shared>,
}

impl SqliteQueueStore {
    /// Wrap an already migrated pool
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                time_provider,
                owner: uuid::Uuid::new_v4().to_string(),
                next_lease: AtomicU64::new(0),
                committed: Notify::new(),
                poll_interval: STORE_POLL_INTERVAL,
            }),
        }
    }

    /// Connect, migrate and release leases left behind by earlier processes
    pub async fn connect(
        database_url: &str,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, QueueError> {
        let store = Self::attach(database_url, time_provider).await?;
        store.recover_orphaned_leases().await?;
        Ok(store)
    }

    /// Connect and migrate without touching existing leases
    ///
    /// For producers that share the database with a running consumer process.
    pub async fn attach(
        database_url: &str,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, QueueError> {
        let pool = create_pool(database_url).await.map_err(map_sqlx_error)?;
        run_migrations(&pool).await.map_err(map_sqlx_error)?;
        Ok(Self::new(pool, time_provider))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.shared.pool
    }

    /// Make rows leased by any other store instance visible again
    ///
    /// Returns the number of recovered rows.
    pub async fn recover_orphaned_leases(&self) -> Result<u64, QueueError> {
        let pattern = format!("{}:%", self.shared.owner);
        let result = sqlx::query(
            "UPDATE messages SET lease = NULL WHERE lease IS NOT NULL AND lease NOT LIKE ?",
        )
        .bind(&pattern)
        .execute(&self.shared.pool)
        .await
        .map_err(map_sqlx_error)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "Released orphaned queue leases from a previous run");
        } else {
            info!("No orphaned queue leases found");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn open(&self, path: &str) -> Result<Arc<dyn QueueHandle>, QueueError> {
        if path.trim().is_empty() {
            return Err(QueueError::Store("queue path is empty".to_string()));
        }
        sqlx::query("INSERT OR IGNORE INTO queues (path, created_at) VALUES (?, ?)")
            .bind(path)
            .bind(self.shared.time_provider.now_millis())
            .execute(&self.shared.pool)
            .await
            .map_err(map_sqlx_error)?;

        debug!(queue = %path, "Queue opened");
        Ok(Arc::new(SqliteQueueHandle {
            path: path.to_string(),
            pool: self.shared.pool.clone(),
        }))
    }

    async fn begin_transaction(&self) -> Result<Box<dyn QueueTransaction>, QueueError> {
        // Probe the pool so an exhausted or broken pool surfaces as a begin failure
        drop(
            self.shared
                .pool
                .acquire()
                .await
                .map_err(|e| QueueError::BeginFailed(e.to_string()))?,
        );

        let seq = self.shared.next_lease.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(SqliteQueueTransaction {
            shared: Arc::clone(&self.shared),
            lease: format!("{}:{}", self.shared.owner, seq),
            leased: 0,
            pending: Vec::new(),
            finished: false,
        }))
    }
}

struct SqliteQueueHandle {
    path: String,
    pool: SqlitePool,
}

#[async_trait]
impl QueueHandle for SqliteQueueHandle {
    fn path(&self) -> &str {
        &self.path
    }

    async fn len(&self) -> Result<u64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE queue = ? AND lease IS NULL")
                .bind(&self.path)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(count as u64)
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM messages WHERE queue = ? AND lease IS NULL")
            .bind(&self.path)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        info!(queue = %self.path, removed = result.rows_affected(), "Queue cleared");
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        // The pool is shared by every handle; nothing to release per queue
        debug!(queue = %self.path, "Queue handle closed");
        Ok(())
    }
}

pub struct SqliteQueueTransaction {
    shared: Arc<Shared>,
    lease: String,
    leased: usize,
    pending: Vec<(String, String)>,
    finished: bool,
}

impl SqliteQueueTransaction {
    /// Lease the oldest visible row of `queue`, if any
    async fn try_lease(&mut self, queue: &str) -> Result<Option<QueueMessage>, QueueError> {
        loop {
            let row: Option<(i64, String)> = sqlx::query_as(
                r#"
                UPDATE messages
                SET lease = ?
                WHERE id = (
                    SELECT id FROM messages
                    WHERE queue = ? AND lease IS NULL
                    ORDER BY id ASC
                    LIMIT 1
                )
                RETURNING id, body
                "#,
            )
            .bind(&self.lease)
            .bind(queue)
            .fetch_optional(&self.shared.pool)
            .await
            .map_err(map_sqlx_error)?;

            let Some((id, body)) = row else {
                return Ok(None);
            };

            match QueueMessage::from_json(&body) {
                Ok(message) => {
                    self.leased += 1;
                    return Ok(Some(message));
                }
                Err(e) => self.quarantine(queue, id, &e).await?,
            }
        }
    }

    /// Move an undecodable row aside so it cannot block its queue
    async fn quarantine(
        &self,
        queue: &str,
        id: i64,
        err: &serde_json::Error,
    ) -> Result<(), QueueError> {
        let corrupt_queue = format!("{}{}", queue, CORRUPT_SUFFIX);
        error!(
            queue = %queue,
            row_id = id,
            corrupt_queue = %corrupt_queue,
            error = %err,
            "Undecodable queue message, moving it aside"
        );
        sqlx::query("UPDATE messages SET queue = ?, lease = NULL WHERE id = ?")
            .bind(&corrupt_queue)
            .bind(id)
            .execute(&self.shared.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn release_leases(shared: &Shared, lease: &str) -> Result<u64, QueueError> {
        let result = sqlx::query("UPDATE messages SET lease = NULL WHERE lease = ?")
            .bind(lease)
            .execute(&shared.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() > 0 {
            shared.committed.notify_waiters();
        }
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueueTransaction for SqliteQueueTransaction {
    async fn enqueue(&mut self, queue: &str, message: &QueueMessage) -> Result<(), QueueError> {
        let body = message.to_json()?;
        self.pending.push((queue.to_string(), body));
        Ok(())
    }

    async fn dequeue(&mut self, queue: &str, timeout: Duration) -> Result<Dequeued, QueueError> {
        // None when the timeout is too large to represent: wait without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let shared = Arc::clone(&self.shared);
        loop {
            let committed = shared.committed.notified();
            tokio::pin!(committed);
            committed.as_mut().enable();

            if let Some(message) = self.try_lease(queue).await? {
                return Ok(Dequeued::Message(message));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Dequeued::Empty);
                    }
                    shared.poll_interval.min(deadline - now)
                }
                None => shared.poll_interval,
            };
            tokio::select! {
                _ = &mut committed => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), QueueError> {
        if self.leased == 0 && self.pending.is_empty() {
            self.finished = true;
            return Ok(());
        }

        let now = self.shared.time_provider.now_millis();
        let mut tx = self.shared.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM messages WHERE lease = ?")
            .bind(&self.lease)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        for (queue, body) in &self.pending {
            sqlx::query("INSERT INTO messages (queue, body, enqueued_at) VALUES (?, ?, ?)")
                .bind(queue)
                .bind(body)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        // On any failure the sqlx transaction rolls back and Drop releases the leases
        tx.commit().await.map_err(map_sqlx_error)?;
        self.finished = true;

        if !self.pending.is_empty() {
            self.shared.committed.notify_waiters();
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<(), QueueError> {
        self.finished = true;
        self.pending.clear();
        if self.leased == 0 {
            return Ok(());
        }
        Self::release_leases(&self.shared, &self.lease).await?;
        Ok(())
    }
}

impl Drop for SqliteQueueTransaction {
    fn drop(&mut self) {
        if self.finished || self.leased == 0 {
            return;
        }
        // Not committed: give the rows back in the background
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lease = %self.lease, "Transaction dropped outside a runtime, leases kept until restart");
            return;
        };
        let shared = Arc::clone(&self.shared);
        let lease = std::mem::take(&mut self.lease);
        runtime.spawn(async move {
            if let Err(e) = SqliteQueueTransaction::release_leases(&shared, &lease).await {
                warn!(lease = %lease, error = %e, "Failed to release leases of dropped transaction");
            }
        });
    }
}
