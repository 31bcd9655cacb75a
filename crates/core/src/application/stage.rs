// Dequeue Stage - dequeue, process, commit or dispose

use crate::application::disposition::{Disposition, DispositionPolicy};
use crate::application::runtime::constants::{
    BEGIN_TRANSACTION_MAX_ATTEMPTS, BEGIN_TRANSACTION_RETRY_DELAY,
};
use crate::application::runtime::{Service, ServiceContext, ServiceRuntime, ShutdownToken};
use crate::domain::{dead_letter_path, QueueMessage, QueuePath, StageConfig};
use crate::error::{AppError, Result};
use crate::port::{Dequeued, QueueError, QueueStore, QueueTransaction, TimeProvider};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stage-specific processing plugged into a [`DequeueStage`]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message; an error triggers the disposition policy
    async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()>;

    /// Compensating action when an expired message is dropped
    async fn on_expired(&self, _message: &QueueMessage, _ctx: &mut ProcessContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// What a handler may touch while processing: the open transaction and the service
pub struct ProcessContext<'a> {
    tx: &'a mut dyn QueueTransaction,
    service: &'a ServiceContext,
}

impl<'a> ProcessContext<'a> {
    pub fn new(tx: &'a mut dyn QueueTransaction, service: &'a ServiceContext) -> Self {
        Self { tx, service }
    }

    pub fn service(&self) -> &ServiceContext {
        self.service
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        self.service.shutdown()
    }

    /// Err(Cancelled) once the stage is stopping
    pub fn ensure_running(&self) -> Result<()> {
        self.service.shutdown().ensure_running()
    }

    /// Enqueue inside the current transaction (visible on commit)
    pub async fn enqueue(&mut self, queue: &str, message: &QueueMessage) -> Result<()> {
        let handle = self.service.queue(queue).await?;
        handle.enqueue(&mut *self.tx, message).await?;
        Ok(())
    }

    /// Enqueue the next-stage item for the same correlation
    pub async fn forward<T: Serialize + Sync>(
        &mut self,
        queue: &str,
        parent: &QueueMessage,
        item: &T,
    ) -> Result<()> {
        let message = parent.derive(item)?;
        self.enqueue(queue, &message).await
    }
}

enum Outcome {
    Processed,
    Disposed(Disposition),
    Cancelled(AppError),
    DispositionFailed(AppError),
}

/// Generic queue-consuming stage with retry, dead-letter and expiry policy
pub struct DequeueStage {
    name: String,
    primary_path: QueuePath,
    dead_letter_path: QueuePath,
    config: StageConfig,
    handler: Arc<dyn MessageHandler>,
    policy: DispositionPolicy,
    time_provider: Arc<dyn TimeProvider>,
    last_dead_letter_move: AtomicI64,
}

impl DequeueStage {
    pub fn new(
        name: impl Into<String>,
        primary_path: impl Into<QueuePath>,
        config: StageConfig,
        handler: Arc<dyn MessageHandler>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let primary_path = primary_path.into();
        Self {
            name: name.into(),
            dead_letter_path: dead_letter_path(&primary_path),
            primary_path,
            policy: DispositionPolicy::new(Arc::clone(&time_provider), &config),
            last_dead_letter_move: AtomicI64::new(time_provider.now_millis()),
            config,
            handler,
            time_provider,
        }
    }

    pub fn primary_path(&self) -> &str {
        &self.primary_path
    }

    pub fn dead_letter_path(&self) -> &str {
        &self.dead_letter_path
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Wrap this stage in a runtime with the configured instance count
    pub fn into_runtime(self, store: Arc<dyn QueueStore>) -> ServiceRuntime {
        let instances = self.config.instances;
        ServiceRuntime::new(Arc::new(self), store, instances)
    }

    /// Claim the replay window; only one worker wins per window
    fn claim_dead_letter_replay(&self) -> bool {
        let now = self.time_provider.now_millis();
        let frequency_ms = self.config.dead_letter_move_frequency().as_millis() as i64;
        let last = self.last_dead_letter_move.load(Ordering::SeqCst);
        now - last >= frequency_ms
            && self
                .last_dead_letter_move
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Move every dead-lettered message back onto the primary queue, one transaction each
    pub async fn replay_dead_letters(&self, ctx: &ServiceContext) -> Result<usize> {
        let dead_letter = ctx.queue(&self.dead_letter_path).await?;
        let primary = ctx.queue(&self.primary_path).await?;
        let mut moved = 0;

        loop {
            ctx.shutdown().ensure_running()?;
            let mut tx = self.begin_transaction(ctx).await?;
            let message = match dead_letter.dequeue(tx.as_mut(), Duration::ZERO).await {
                Ok(Dequeued::Message(message)) => message,
                Ok(Dequeued::Empty) => {
                    abort_quietly(tx, &self.name).await;
                    break;
                }
                Err(QueueError::PermissionDenied(reason)) => {
                    abort_quietly(tx, &self.name).await;
                    return Err(self.permission_denied(ctx, &self.dead_letter_path, reason));
                }
                Err(e) => {
                    abort_quietly(tx, &self.name).await;
                    return Err(e.into());
                }
            };

            if let Err(e) = primary.enqueue(tx.as_mut(), &message).await {
                abort_quietly(tx, &self.name).await;
                return Err(e.into());
            }
            tx.commit().await?;
            moved += 1;
            debug!(
                stage = %self.name,
                correlation_id = %message.correlation_id,
                "Replayed dead-lettered message"
            );
        }

        if moved > 0 {
            info!(stage = %self.name, moved, "Dead-letter queue replayed onto primary");
        }
        Ok(moved)
    }

    /// Fatal for the stage: log, ask the owner to stop, hand back the error
    fn permission_denied(&self, ctx: &ServiceContext, queue: &str, reason: String) -> AppError {
        error!(
            stage = %self.name,
            queue = %queue,
            reason = %reason,
            "Queue permission denied, stopping stage"
        );
        ctx.request_stop();
        QueueError::PermissionDenied(reason).into()
    }

    /// Begin a transaction, retrying transient begin failures a bounded number of times
    async fn begin_transaction(&self, ctx: &ServiceContext) -> Result<Box<dyn QueueTransaction>> {
        let store = ctx.queue_store();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match store.begin_transaction().await {
                Ok(tx) => return Ok(tx),
                Err(QueueError::BeginFailed(reason)) if attempt < BEGIN_TRANSACTION_MAX_ATTEMPTS => {
                    warn!(
                        stage = %self.name,
                        attempt,
                        reason = %reason,
                        "Failed to begin queue transaction, retrying"
                    );
                    ctx.shutdown().sleep(BEGIN_TRANSACTION_RETRY_DELAY).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn dispose(
        &self,
        message: &QueueMessage,
        failure: &AppError,
        pctx: &mut ProcessContext<'_>,
    ) -> Result<Disposition> {
        let disposition = self.policy.decide(message);
        match disposition {
            Disposition::Drop => {
                warn!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    age_ms = message.age_millis(self.time_provider.now_millis()),
                    error = %failure,
                    "Message expired, dropping"
                );
                self.handler.on_expired(message, pctx).await?;
            }
            Disposition::Retry => {
                info!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    dequeue_count = message.dequeue_count,
                    error = %failure,
                    "Re-enqueueing message for retry"
                );
                pctx.enqueue(&self.primary_path, message).await?;
            }
            Disposition::DeadLetter => {
                warn!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    dequeue_count = message.dequeue_count,
                    error = %failure,
                    "Moving message to dead-letter queue"
                );
                pctx.enqueue(&self.dead_letter_path, message).await?;
            }
        }
        Ok(disposition)
    }
}

#[async_trait]
impl Service for DequeueStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&self, ctx: &ServiceContext) -> Result<()> {
        ctx.queue(&self.primary_path).await?;
        ctx.queue(&self.dead_letter_path).await?;
        self.last_dead_letter_move
            .store(self.time_provider.now_millis(), Ordering::SeqCst);
        Ok(())
    }

    async fn tick(&self, ctx: &ServiceContext) -> Result<()> {
        if self.claim_dead_letter_replay() {
            self.replay_dead_letters(ctx).await?;
        }

        let primary = ctx.queue(&self.primary_path).await?;
        let mut tx = self.begin_transaction(ctx).await?;

        let dequeued = ctx
            .shutdown()
            .cancellable(primary.dequeue(tx.as_mut(), self.config.dequeue_timeout()))
            .await;
        let mut message = match dequeued {
            Ok(Ok(Dequeued::Message(message))) => message,
            Ok(Ok(Dequeued::Empty)) => {
                abort_quietly(tx, &self.name).await;
                return Ok(());
            }
            Ok(Err(QueueError::PermissionDenied(reason))) => {
                abort_quietly(tx, &self.name).await;
                return Err(self.permission_denied(ctx, &self.primary_path, reason));
            }
            Ok(Err(e)) => {
                abort_quietly(tx, &self.name).await;
                return Err(e.into());
            }
            Err(cancelled) => {
                abort_quietly(tx, &self.name).await;
                return Err(cancelled);
            }
        };
        message.dequeue_count += 1;

        debug!(
            stage = %self.name,
            correlation_id = %message.correlation_id,
            dequeue_count = message.dequeue_count,
            "Processing message"
        );

        let outcome = {
            let mut pctx = ProcessContext::new(tx.as_mut(), ctx);
            match self.handler.handle(&message, &mut pctx).await {
                Ok(()) => Outcome::Processed,
                Err(e) if ctx.is_shutdown() => Outcome::Cancelled(e),
                Err(e) => {
                    error!(
                        stage = %self.name,
                        correlation_id = %message.correlation_id,
                        error = %e,
                        "Message processing failed"
                    );
                    match self.dispose(&message, &e, &mut pctx).await {
                        Ok(disposition) => Outcome::Disposed(disposition),
                        Err(dispose_err) => Outcome::DispositionFailed(dispose_err),
                    }
                }
            }
        };

        match outcome {
            Outcome::Processed => {
                tx.commit().await?;
                debug!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    "Message processed"
                );
                Ok(())
            }
            Outcome::Disposed(disposition) => {
                tx.commit().await?;
                debug!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    disposition = ?disposition,
                    "Failed message disposed"
                );
                Ok(())
            }
            Outcome::Cancelled(e) => {
                abort_quietly(tx, &self.name).await;
                Err(e)
            }
            Outcome::DispositionFailed(e) => {
                error!(
                    stage = %self.name,
                    correlation_id = %message.correlation_id,
                    error = %e,
                    "Failed to dispose message, leaving it on the queue"
                );
                abort_quietly(tx, &self.name).await;
                Err(e)
            }
        }
    }
}

async fn abort_quietly(tx: Box<dyn QueueTransaction>, stage: &str) {
    if let Err(e) = tx.abort().await {
        warn!(stage = %stage, error = %e, "Failed to abort queue transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::runtime::ServiceState;
    use crate::port::enqueue_committed;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use crate::port::time_provider::mocks::ManualTimeProvider;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio_test::assert_err;

    const PRIMARY: &str = "test_stage";
    const DEAD_LETTER: &str = "test_stageDeadLetter";
    const NEXT: &str = "test_next";
    const CLEANUP: &str = "test_cleanup";

    /// Forwards to NEXT unless told to fail; expiry enqueues a cleanup marker
    #[derive(Default)]
    struct ScriptedHandler {
        failures: AtomicUsize,
        calls: AtomicUsize,
        cleanup_fails: Mutex<bool>,
    }

    impl ScriptedHandler {
        fn failing(n: usize) -> Self {
            let handler = Self::default();
            handler.failures.store(n, Ordering::SeqCst);
            handler
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AppError::Internal("scripted failure".to_string()));
            }
            ctx.forward(NEXT, message, &json!({"done": true})).await
        }

        async fn on_expired(&self, message: &QueueMessage, ctx: &mut ProcessContext<'_>) -> Result<()> {
            if *self.cleanup_fails.lock().unwrap() {
                return Err(AppError::Internal("cleanup failed".to_string()));
            }
            ctx.forward(CLEANUP, message, &json!({"cleanup": true})).await
        }
    }

    struct Harness {
        store: InMemoryQueueStore,
        clock: Arc<ManualTimeProvider>,
        runtime: ServiceRuntime,
        stage: Arc<DequeueStage>,
    }

    fn harness(handler: Arc<ScriptedHandler>, config: StageConfig) -> Harness {
        let store = InMemoryQueueStore::new();
        let clock = Arc::new(ManualTimeProvider::new(1_000_000));
        let stage = Arc::new(DequeueStage::new(
            "test",
            PRIMARY,
            config,
            handler,
            clock.clone(),
        ));
        let runtime = ServiceRuntime::new(stage.clone(), Arc::new(store.clone()), 1);
        Harness {
            store,
            clock,
            runtime,
            stage,
        }
    }

    fn quick_config(max_dequeue_count: u32) -> StageConfig {
        StageConfig {
            max_dequeue_count,
            dequeue_timeout_ms: 20,
            ..Default::default()
        }
    }

    async fn seed(h: &Harness, id: &str, created_at: i64) {
        let message = QueueMessage::new(id, created_at, &json!({"n": id})).unwrap();
        enqueue_committed(&h.store, PRIMARY, &message).await.unwrap();
    }

    async fn tick_once(h: &Harness) -> Result<()> {
        let ctx = test_context(h);
        h.stage.tick(&ctx).await
    }

    fn test_context(h: &Harness) -> ServiceContext {
        ServiceContext::detached("test", Arc::new(h.store.clone()))
    }

    #[tokio::test]
    async fn test_success_forwards_and_commits() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;

        tick_once(&h).await.unwrap();

        assert_eq!(h.store.count(PRIMARY), 0);
        let next = h.store.snapshot(NEXT);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].correlation_id, "a");
        assert_eq!(next[0].dequeue_count, 0);
    }

    #[tokio::test]
    async fn test_first_failure_dead_letters_with_default_max() {
        // dequeue_count is 1 after the first dequeue and 1 < 1 is false,
        // so the default never retries on the primary queue
        let handler = Arc::new(ScriptedHandler::failing(1));
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;

        tick_once(&h).await.unwrap();

        assert_eq!(h.store.count(PRIMARY), 0);
        let dead = h.store.snapshot(DEAD_LETTER);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dequeue_count, 1);
        assert_eq!(h.store.count(NEXT), 0);
    }

    #[tokio::test]
    async fn test_retry_on_primary_below_max() {
        let handler = Arc::new(ScriptedHandler::failing(2));
        let h = harness(handler.clone(), quick_config(3));
        seed(&h, "a", h.clock.now_millis()).await;

        tick_once(&h).await.unwrap();
        let primary = h.store.snapshot(PRIMARY);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].dequeue_count, 1);

        tick_once(&h).await.unwrap();
        assert_eq!(h.store.snapshot(PRIMARY)[0].dequeue_count, 2);

        // Third attempt succeeds
        tick_once(&h).await.unwrap();
        assert_eq!(h.store.count(PRIMARY), 0);
        assert_eq!(h.store.count(DEAD_LETTER), 0);
        assert_eq!(h.store.count(NEXT), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let h = harness(handler.clone(), quick_config(2));
        seed(&h, "a", h.clock.now_millis()).await;

        tick_once(&h).await.unwrap();
        assert_eq!(h.store.count(PRIMARY), 1);
        tick_once(&h).await.unwrap();

        assert_eq!(h.store.count(PRIMARY), 0);
        let dead = h.store.snapshot(DEAD_LETTER);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dequeue_count, 2);
    }

    #[tokio::test]
    async fn test_expired_message_dropped_with_cleanup() {
        let handler = Arc::new(ScriptedHandler::failing(1));
        let h = harness(handler.clone(), quick_config(5));
        let week_ms = StageConfig::default().maximum_message_age().as_millis() as i64;
        seed(&h, "old", h.clock.now_millis() - week_ms).await;

        tick_once(&h).await.unwrap();

        assert_eq!(h.store.count(PRIMARY), 0);
        assert_eq!(h.store.count(DEAD_LETTER), 0);
        let cleanup = h.store.snapshot(CLEANUP);
        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup[0].correlation_id, "old");
    }

    #[tokio::test]
    async fn test_failed_disposition_leaves_message_on_primary() {
        let handler = Arc::new(ScriptedHandler::failing(1));
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;
        h.store.fail_next_enqueues(DEAD_LETTER, 1);

        assert_err!(tick_once(&h).await);

        let primary = h.store.snapshot(PRIMARY);
        assert_eq!(primary.len(), 1);
        // Aborted: the stored copy never saw the increment
        assert_eq!(primary[0].dequeue_count, 0);
        assert_eq!(h.store.count(DEAD_LETTER), 0);
    }

    #[tokio::test]
    async fn test_failed_cleanup_leaves_message_on_primary() {
        let handler = Arc::new(ScriptedHandler::failing(1));
        *handler.cleanup_fails.lock().unwrap() = true;
        let h = harness(handler.clone(), quick_config(1));
        let week_ms = StageConfig::default().maximum_message_age().as_millis() as i64;
        seed(&h, "old", h.clock.now_millis() - week_ms).await;

        assert_err!(tick_once(&h).await);
        assert_eq!(h.store.count(PRIMARY), 1);
        assert_eq!(h.store.count(CLEANUP), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_is_not_an_error() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));

        tick_once(&h).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_requests_stop() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        h.store.deny_permission(PRIMARY);
        let mut requested = h.runtime.stop_requested();

        h.runtime.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), requested.wait())
            .await
            .unwrap();
        h.runtime.stop().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_permission_denied_requests_stop() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        h.store.deny_permission(DEAD_LETTER);
        let mut requested = h.runtime.stop_requested();

        h.runtime.start().await.unwrap();
        h.clock.advance(StageConfig::default().dead_letter_move_frequency());
        tokio::time::timeout(Duration::from_secs(5), requested.wait())
            .await
            .unwrap();

        assert_eq!(h.runtime.state(), ServiceState::Stopping);
        h.runtime.stop().await;
        assert_eq!(h.runtime.state(), ServiceState::Stopped);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_begin_failures_retried() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;
        h.store.fail_next_begins(BEGIN_TRANSACTION_MAX_ATTEMPTS - 1);

        tick_once(&h).await.unwrap();
        assert_eq!(h.store.count(NEXT), 1);
    }

    #[tokio::test]
    async fn test_begin_failures_exhausted_propagate() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;
        h.store.fail_next_begins(BEGIN_TRANSACTION_MAX_ATTEMPTS);

        let err = tick_once(&h).await.unwrap_err();
        assert!(matches!(err, AppError::Queue(QueueError::BeginFailed(_))));
        assert_eq!(h.store.count(PRIMARY), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_replayed_when_due() {
        let handler = Arc::new(ScriptedHandler::failing(1));
        let h = harness(handler.clone(), quick_config(1));
        seed(&h, "a", h.clock.now_millis()).await;

        tick_once(&h).await.unwrap();
        assert_eq!(h.store.count(DEAD_LETTER), 1);

        // Not yet due: the dead letter stays put
        tick_once(&h).await.unwrap();
        assert_eq!(h.store.count(DEAD_LETTER), 1);

        h.clock.advance(StageConfig::default().dead_letter_move_frequency());
        tick_once(&h).await.unwrap();

        assert_eq!(h.store.count(DEAD_LETTER), 0);
        assert_eq!(h.store.count(PRIMARY), 0);
        // Replayed message was processed successfully in the same tick
        assert_eq!(h.store.count(NEXT), 1);
    }

    #[tokio::test]
    async fn test_replay_keeps_dequeue_count() {
        let handler = Arc::new(ScriptedHandler::default());
        let h = harness(handler.clone(), quick_config(1));
        let mut message = QueueMessage::new("a", 0, &json!({})).unwrap();
        message.dequeue_count = 4;
        enqueue_committed(&h.store, DEAD_LETTER, &message).await.unwrap();

        let ctx = test_context(&h);
        assert_eq!(h.stage.replay_dead_letters(&ctx).await.unwrap(), 1);

        let primary = h.store.snapshot(PRIMARY);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].dequeue_count, 4);
    }

    #[tokio::test]
    async fn test_competing_workers_process_each_message_once() {
        let handler = Arc::new(ScriptedHandler::default());
        let store = InMemoryQueueStore::new();
        let clock = Arc::new(ManualTimeProvider::new(0));
        let config = StageConfig {
            instances: 4,
            ..quick_config(1)
        };
        let runtime = DequeueStage::new("test", PRIMARY, config, handler.clone(), clock)
            .into_runtime(Arc::new(store.clone()));

        for i in 0..50 {
            let message = QueueMessage::new(format!("m{}", i), 0, &json!({})).unwrap();
            enqueue_committed(&store, PRIMARY, &message).await.unwrap();
        }

        runtime.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while store.count(NEXT) < 50 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        runtime.stop().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 50);
        let mut ids: Vec<_> = store
            .snapshot(NEXT)
            .into_iter()
            .map(|m| m.correlation_id)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
