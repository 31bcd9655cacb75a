// Queue Store Port
// Durable FIFO queues addressed by path, with transactions spanning several queues

use crate::domain::QueueMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The store itself is unusable for this process
    #[error("Queue permission denied: {0}")]
    PermissionDenied(String),

    /// A transaction could not be started (usually transient)
    #[error("Failed to begin queue transaction: {0}")]
    BeginFailed(String),

    #[error("Message encoding error: {0}")]
    Encoding(String),

    #[error("Queue store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Encoding(err.to_string())
    }
}

/// Outcome of a dequeue: "no work" is a normal result, not an error
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Message(QueueMessage),
    Empty,
}

/// A unit of work over one or more queues.
///
/// A message dequeued inside a transaction is invisible to every other
/// transaction until this one aborts. Enqueues become visible on commit.
/// Dropping a transaction without committing behaves like an abort.
#[async_trait]
pub trait QueueTransaction: Send {
    /// Enqueue a message at the back of `queue`
    async fn enqueue(&mut self, queue: &str, message: &QueueMessage) -> Result<(), QueueError>;

    /// Take the next message of `queue`, waiting up to `timeout` for one to arrive
    async fn dequeue(&mut self, queue: &str, timeout: Duration) -> Result<Dequeued, QueueError>;

    /// Make every dequeue and enqueue of this transaction permanent
    async fn commit(self: Box<Self>) -> Result<(), QueueError>;

    /// Return dequeued messages to their queues and discard pending enqueues
    async fn abort(self: Box<Self>) -> Result<(), QueueError>;
}

/// Handle onto one opened queue
#[async_trait]
pub trait QueueHandle: Send + Sync {
    fn path(&self) -> &str;

    /// Number of committed messages currently visible on the queue
    async fn len(&self) -> Result<u64, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Remove every message from the queue (outside any transaction)
    async fn clear(&self) -> Result<(), QueueError>;

    /// Release the handle
    async fn close(&self) -> Result<(), QueueError>;

    async fn enqueue(
        &self,
        tx: &mut dyn QueueTransaction,
        message: &QueueMessage,
    ) -> Result<(), QueueError> {
        tx.enqueue(self.path(), message).await
    }

    async fn dequeue(
        &self,
        tx: &mut dyn QueueTransaction,
        timeout: Duration,
    ) -> Result<Dequeued, QueueError> {
        tx.dequeue(self.path(), timeout).await
    }
}

/// Queue store interface
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Open (creating if needed) the queue at `path`
    async fn open(&self, path: &str) -> Result<Arc<dyn QueueHandle>, QueueError>;

    /// Begin a transaction usable across every queue of this store
    async fn begin_transaction(&self) -> Result<Box<dyn QueueTransaction>, QueueError>;
}

/// Enqueue a single message in its own committed transaction
pub async fn enqueue_committed(
    store: &dyn QueueStore,
    queue: &str,
    message: &QueueMessage,
) -> Result<(), QueueError> {
    let mut tx = store.begin_transaction().await?;
    if let Err(e) = tx.enqueue(queue, message).await {
        let _ = tx.abort().await;
        return Err(e);
    }
    tx.commit().await
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard};
    use tokio::sync::Notify;
    use tokio::time::Instant;

    #[derive(Default)]
    struct State {
        queues: HashMap<String, VecDeque<QueueMessage>>,
        denied: HashSet<String>,
        begin_failures: u32,
        enqueue_failures: HashMap<String, u32>,
    }

    struct Inner {
        state: Mutex<State>,
        notify: Notify,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Inner {
        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    /// In-memory queue store with blocking dequeue and fault injection
    #[derive(Clone)]
    pub struct InMemoryQueueStore {
        inner: Arc<Inner>,
    }

    impl Default for InMemoryQueueStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryQueueStore {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Inner {
                    state: Mutex::new(State::default()),
                    notify: Notify::new(),
                    opened: AtomicUsize::new(0),
                    closed: AtomicUsize::new(0),
                }),
            }
        }

        /// Committed messages of `queue`, front first
        pub fn snapshot(&self, queue: &str) -> Vec<QueueMessage> {
            self.inner
                .state()
                .queues
                .get(queue)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default()
        }

        pub fn count(&self, queue: &str) -> usize {
            self.inner
                .state()
                .queues
                .get(queue)
                .map(VecDeque::len)
                .unwrap_or(0)
        }

        /// Every dequeue on `queue` fails with PermissionDenied
        pub fn deny_permission(&self, queue: &str) {
            self.inner.state().denied.insert(queue.to_string());
        }

        /// The next `n` begin_transaction calls fail with BeginFailed
        pub fn fail_next_begins(&self, n: u32) {
            self.inner.state().begin_failures = n;
        }

        /// The next `n` enqueues onto `queue` fail with a store error
        pub fn fail_next_enqueues(&self, queue: &str, n: u32) {
            self.inner
                .state()
                .enqueue_failures
                .insert(queue.to_string(), n);
        }

        pub fn opened_handles(&self) -> usize {
            self.inner.opened.load(Ordering::SeqCst)
        }

        pub fn closed_handles(&self) -> usize {
            self.inner.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueueStore for InMemoryQueueStore {
        async fn open(&self, path: &str) -> Result<Arc<dyn QueueHandle>, QueueError> {
            self.inner
                .state()
                .queues
                .entry(path.to_string())
                .or_default();
            self.inner.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(InMemoryQueueHandle {
                path: path.to_string(),
                inner: Arc::clone(&self.inner),
            }))
        }

        async fn begin_transaction(&self) -> Result<Box<dyn QueueTransaction>, QueueError> {
            {
                let mut state = self.inner.state();
                if state.begin_failures > 0 {
                    state.begin_failures -= 1;
                    return Err(QueueError::BeginFailed("injected failure".to_string()));
                }
            }
            Ok(Box::new(InMemoryTransaction {
                inner: Arc::clone(&self.inner),
                dequeued: Vec::new(),
                pending: Vec::new(),
                finished: false,
            }))
        }
    }

    struct InMemoryQueueHandle {
        path: String,
        inner: Arc<Inner>,
    }

    #[async_trait]
    impl QueueHandle for InMemoryQueueHandle {
        fn path(&self) -> &str {
            &self.path
        }

        async fn len(&self) -> Result<u64, QueueError> {
            Ok(self
                .inner
                .state()
                .queues
                .get(&self.path)
                .map(|q| q.len() as u64)
                .unwrap_or(0))
        }

        async fn clear(&self) -> Result<(), QueueError> {
            if let Some(queue) = self.inner.state().queues.get_mut(&self.path) {
                queue.clear();
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), QueueError> {
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct InMemoryTransaction {
        inner: Arc<Inner>,
        dequeued: Vec<(String, QueueMessage)>,
        pending: Vec<(String, QueueMessage)>,
        finished: bool,
    }

    impl InMemoryTransaction {
        fn restore(&mut self) {
            if self.dequeued.is_empty() {
                return;
            }
            let mut state = self.inner.state();
            // Put messages back at the front in their original order
            for (queue, message) in self.dequeued.drain(..).rev() {
                state.queues.entry(queue).or_default().push_front(message);
            }
            drop(state);
            self.inner.notify.notify_waiters();
        }
    }

    #[async_trait]
    impl QueueTransaction for InMemoryTransaction {
        async fn enqueue(&mut self, queue: &str, message: &QueueMessage) -> Result<(), QueueError> {
            let mut state = self.inner.state();
            if let Some(remaining) = state.enqueue_failures.get_mut(queue) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(QueueError::Store(format!("injected enqueue failure on {}", queue)));
                }
            }
            self.pending.push((queue.to_string(), message.clone()));
            Ok(())
        }

        async fn dequeue(&mut self, queue: &str, timeout: Duration) -> Result<Dequeued, QueueError> {
            let deadline = Instant::now().checked_add(timeout);
            loop {
                let notified = self.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = self.inner.state();
                    if state.denied.contains(queue) {
                        return Err(QueueError::PermissionDenied(format!(
                            "access to {} denied",
                            queue
                        )));
                    }
                    if let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                        self.dequeued.push((queue.to_string(), message.clone()));
                        return Ok(Dequeued::Message(message));
                    }
                }

                match deadline {
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Ok(Dequeued::Empty);
                        }
                    }
                    None => notified.await,
                }
            }
        }

        async fn commit(mut self: Box<Self>) -> Result<(), QueueError> {
            self.finished = true;
            self.dequeued.clear();
            let pending = std::mem::take(&mut self.pending);
            if pending.is_empty() {
                return Ok(());
            }
            {
                let mut state = self.inner.state();
                for (queue, message) in pending {
                    state.queues.entry(queue).or_default().push_back(message);
                }
            }
            self.inner.notify.notify_waiters();
            Ok(())
        }

        async fn abort(mut self: Box<Self>) -> Result<(), QueueError> {
            self.finished = true;
            self.pending.clear();
            self.restore();
            Ok(())
        }
    }

    impl Drop for InMemoryTransaction {
        fn drop(&mut self) {
            if !self.finished {
                self.restore();
            }
        }
    }

}
