// Service Runtime - worker pool lifecycle shared by every pipeline service

pub mod constants;
mod panic_guard;
mod shutdown;

use constants::*;
pub use panic_guard::{execute_guarded_async, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken, StopRequested};
use shutdown::StopSignal;

use crate::domain::DomainError;
use crate::error::Result;
use crate::port::{QueueError, QueueHandle, QueueStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`ServiceRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State cell shared by a runtime and the contexts it hands out
#[derive(Clone)]
struct StateCell(Arc<Mutex<ServiceState>>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(ServiceState::Stopped)))
    }

    fn get(&self) -> ServiceState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, service: &str, next: ServiceState) {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        debug!(service = %service, from = %*state, to = %next, "Service state change");
        *state = next;
    }

    /// Move to `next` only from one of `from`; returns whether it moved
    fn advance(&self, service: &str, from: &[ServiceState], next: ServiceState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if !from.contains(&*state) {
            return false;
        }
        debug!(service = %service, from = %*state, to = %next, "Service state change");
        *state = next;
        true
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Stopped => "STOPPED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Behaviour run by a [`ServiceRuntime`]
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Runs once before workers spawn; an error stops the service again
    async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
        Ok(())
    }

    /// One unit of work, called in a loop by every worker
    async fn tick(&self, ctx: &ServiceContext) -> Result<()>;

    /// Runs once after workers finished (or the stop bound elapsed)
    async fn on_stop(&self, _ctx: &ServiceContext) {}
}

/// Lazily opened queue handles, keyed by path
pub struct QueueCache {
    store: Arc<dyn QueueStore>,
    handles: tokio::sync::Mutex<HashMap<String, Arc<dyn QueueHandle>>>,
}

impl QueueCache {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn QueueStore> {
        Arc::clone(&self.store)
    }

    /// Cached handle for `path`, opening it on first use
    pub async fn get(&self, path: &str) -> std::result::Result<Arc<dyn QueueHandle>, QueueError> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get(path) {
            return Ok(Arc::clone(handle));
        }
        let handle = self.store.open(path).await?;
        handles.insert(path.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Close every cached handle once and forget it
    pub async fn release_all(&self, service: &str) {
        let drained: Vec<_> = self.handles.lock().await.drain().collect();
        for (path, handle) in drained {
            if let Err(e) = handle.close().await {
                warn!(service = %service, queue = %path, error = %e, "Failed to close queue handle");
            }
        }
    }
}

/// Per-start context handed to every hook and tick
#[derive(Clone)]
pub struct ServiceContext {
    name: Arc<str>,
    shutdown: ShutdownToken,
    shutdown_tx: Arc<ShutdownSender>,
    queues: Arc<QueueCache>,
    stop_signal: StopSignal,
    state: StateCell,
}

impl ServiceContext {
    /// Context not owned by any runtime, for driving a service by hand
    pub fn detached(name: &str, store: Arc<dyn QueueStore>) -> Self {
        let (shutdown_tx, shutdown) = shutdown_channel();
        Self {
            name: Arc::from(name),
            shutdown,
            shutdown_tx: Arc::new(shutdown_tx),
            queues: Arc::new(QueueCache::new(store)),
            stop_signal: StopSignal::new(),
            state: StateCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    pub async fn queue(&self, path: &str) -> Result<Arc<dyn QueueHandle>> {
        Ok(self.queues.get(path).await?)
    }

    pub fn queue_store(&self) -> Arc<dyn QueueStore> {
        self.queues.store()
    }

    /// Cancel every worker and notify the owner that this service wants to stop
    ///
    /// The runtime reports `Stopping` until the owner's `stop()` completes.
    pub fn request_stop(&self) {
        warn!(service = %self.name, "Service requested its own stop");
        self.state.advance(
            &self.name,
            &[ServiceState::Starting, ServiceState::Running],
            ServiceState::Stopping,
        );
        self.shutdown_tx.shutdown();
        self.stop_signal.raise();
    }
}

struct RunningWorkers {
    ctx: ServiceContext,
    shutdown_tx: Arc<ShutdownSender>,
    workers: Vec<JoinHandle<()>>,
}

/// Runs a [`Service`] as a pool of worker loops
pub struct ServiceRuntime {
    service: Arc<dyn Service>,
    instances: usize,
    stop_timeout: Duration,
    queues: Arc<QueueCache>,
    state: StateCell,
    running: tokio::sync::Mutex<Option<RunningWorkers>>,
    stop_signal: StopSignal,
}

impl ServiceRuntime {
    pub fn new(service: Arc<dyn Service>, store: Arc<dyn QueueStore>, instances: usize) -> Self {
        Self {
            service,
            instances: instances.max(1),
            stop_timeout: STOP_TIMEOUT,
            queues: Arc::new(QueueCache::new(store)),
            state: StateCell::new(),
            running: tokio::sync::Mutex::new(None),
            stop_signal: StopSignal::new(),
        }
    }

    /// Override the bound on waiting for workers during stop
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Subscribe to this service's stop requests
    pub fn stop_requested(&self) -> StopRequested {
        self.stop_signal.subscribe()
    }

    fn set_state(&self, next: ServiceState) {
        self.state.set(self.name(), next);
    }

    /// Start the worker pool
    ///
    /// # Errors
    /// - DomainError::InvalidStateTransition if the service is not stopped
    /// - Whatever `on_start` returned (the service is stopped again)
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let current = self.state();
        if running.is_some() || current != ServiceState::Stopped {
            return Err(DomainError::InvalidStateTransition {
                from: current.to_string(),
                to: ServiceState::Starting.to_string(),
            }
            .into());
        }

        self.set_state(ServiceState::Starting);
        self.stop_signal.rearm();

        let (shutdown_tx, shutdown) = shutdown_channel();
        let shutdown_tx = Arc::new(shutdown_tx);
        let ctx = ServiceContext {
            name: Arc::from(self.name()),
            shutdown,
            shutdown_tx: Arc::clone(&shutdown_tx),
            queues: Arc::clone(&self.queues),
            stop_signal: self.stop_signal.clone(),
            state: self.state.clone(),
        };

        info!(service = %self.name(), instances = self.instances, "Starting service");

        if let Err(e) = self.service.on_start(&ctx).await {
            error!(service = %self.name(), error = %e, "Service failed to start, stopping");
            shutdown_tx.shutdown();
            self.set_state(ServiceState::Stopping);
            self.service.on_stop(&ctx).await;
            self.queues.release_all(self.name()).await;
            self.set_state(ServiceState::Stopped);
            self.stop_signal.raise();
            return Err(e);
        }

        let workers = (0..self.instances)
            .map(|index| {
                let service = Arc::clone(&self.service);
                let ctx = ctx.clone();
                tokio::spawn(async move { run_worker(service, ctx, index).await })
            })
            .collect();

        *running = Some(RunningWorkers {
            ctx,
            shutdown_tx,
            workers,
        });
        // A stop requested from on_start keeps the runtime in Stopping
        if self
            .state
            .advance(self.name(), &[ServiceState::Starting], ServiceState::Running)
        {
            info!(service = %self.name(), "Service running");
        }
        Ok(())
    }

    /// Stop the worker pool; a no-op when already stopped
    ///
    /// Waits for workers at most `stop_timeout`, then tears down regardless.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(RunningWorkers {
            ctx,
            shutdown_tx,
            mut workers,
        }) = running.take()
        else {
            return;
        };

        self.set_state(ServiceState::Stopping);
        info!(service = %self.name(), "Stopping service");
        shutdown_tx.shutdown();

        let all_workers = futures::future::join_all(workers.iter_mut());
        if timeout(self.stop_timeout, all_workers).await.is_err() {
            warn!(
                service = %self.name(),
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Workers did not finish in time, continuing teardown"
            );
        }

        self.service.on_stop(&ctx).await;
        self.queues.release_all(self.name()).await;
        self.set_state(ServiceState::Stopped);
        info!(service = %self.name(), "Service stopped");
    }
}

/// Worker loop: tick until cancelled, surviving failed and panicking ticks
async fn run_worker(service: Arc<dyn Service>, ctx: ServiceContext, index: usize) {
    let mut shutdown = ctx.shutdown().clone();
    debug!(service = %ctx.name(), worker = index, "Worker started");

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        let failure = match execute_guarded_async(service.tick(&ctx)).await {
            PanicGuardResult::Success(Ok(())) => None,
            PanicGuardResult::Success(Err(e)) => Some(e.to_string()),
            PanicGuardResult::Panicked(msg) => Some(format!("panic: {}", msg)),
        };

        if let Some(reason) = failure {
            if shutdown.is_shutdown() {
                // Failure caused by our own cancellation
                break;
            }
            error!(service = %ctx.name(), worker = index, error = %reason, "Service tick failed");
            tokio::select! {
                _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                _ = shutdown.wait() => break,
            }
        }
    }

    debug!(service = %ctx.name(), worker = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::port::queue_store::mocks::InMemoryQueueStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct CountingService {
        ticks: AtomicUsize,
        stops: AtomicUsize,
        fail_start: AtomicBool,
        panic_first_tick: AtomicBool,
        request_stop_on_tick: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl Service for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(AppError::Config("refused".to_string()));
            }
            Ok(())
        }

        async fn tick(&self, ctx: &ServiceContext) -> Result<()> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            ctx.queue("work").await?;
            if self.hang.load(Ordering::SeqCst) {
                // Ignores cancellation on purpose
                std::future::pending::<()>().await;
            }
            if n == 0 && self.panic_first_tick.load(Ordering::SeqCst) {
                panic!("first tick");
            }
            if self.request_stop_on_tick.load(Ordering::SeqCst) {
                ctx.request_stop();
                return Err(AppError::Cancelled);
            }
            ctx.shutdown().sleep(Duration::from_millis(5)).await
        }

        async fn on_stop(&self, _ctx: &ServiceContext) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime(service: Arc<CountingService>, store: &InMemoryQueueStore) -> ServiceRuntime {
        ServiceRuntime::new(service, Arc::new(store.clone()), 2)
    }

    async fn wait_for_ticks(service: &CountingService, n: usize) {
        while service.ticks.load(Ordering::SeqCst) < n {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        let runtime = runtime(Arc::clone(&service), &store);
        assert_eq!(runtime.state(), ServiceState::Stopped);

        assert_ok!(runtime.start().await);
        assert_eq!(runtime.state(), ServiceState::Running);
        assert_err!(runtime.start().await);

        wait_for_ticks(&service, 3).await;
        runtime.stop().await;
        assert_eq!(runtime.state(), ServiceState::Stopped);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);

        // Second stop is a no-op
        runtime.stop().await;
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);

        // Restartable
        runtime.start().await.unwrap();
        assert!(runtime.is_running());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_queue_handles_cached_and_released_once() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        let runtime = runtime(Arc::clone(&service), &store);

        runtime.start().await.unwrap();
        wait_for_ticks(&service, 10).await;
        runtime.stop().await;

        assert_eq!(store.opened_handles(), 1);
        assert_eq!(store.closed_handles(), 1);
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_kill_worker() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        service.panic_first_tick.store(true, Ordering::SeqCst);
        let runtime = ServiceRuntime::new(service.clone(), Arc::new(store), 1);

        runtime.start().await.unwrap();
        // Recovery sleep after the panic, then the loop keeps going
        tokio::time::timeout(Duration::from_secs(5), wait_for_ticks(&service, 3))
            .await
            .unwrap();
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_failed_on_start_stops_and_signals() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        service.fail_start.store(true, Ordering::SeqCst);
        let runtime = runtime(Arc::clone(&service), &store);
        let requested = runtime.stop_requested();

        assert_err!(runtime.start().await);
        assert_eq!(runtime.state(), ServiceState::Stopped);
        assert!(requested.is_requested());
        assert_eq!(service.ticks.load(Ordering::SeqCst), 0);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_stop_raises_signal_and_cancels_workers() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        service.request_stop_on_tick.store(true, Ordering::SeqCst);
        let runtime = runtime(Arc::clone(&service), &store);
        let mut requested = runtime.stop_requested();

        runtime.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), requested.wait())
            .await
            .unwrap();
        // Workers are cancelled; the owner still has to finish the stop
        assert_eq!(runtime.state(), ServiceState::Stopping);
        assert!(!runtime.is_running());
        assert_err!(runtime.start().await);

        runtime.stop().await;
        assert_eq!(runtime.state(), ServiceState::Stopped);

        // Signal is re-armed by the next start
        service.request_stop_on_tick.store(false, Ordering::SeqCst);
        runtime.start().await.unwrap();
        assert!(!runtime.stop_requested().is_requested());
        runtime.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_when_worker_hangs() {
        let store = InMemoryQueueStore::new();
        let service = Arc::new(CountingService::default());
        service.hang.store(true, Ordering::SeqCst);
        let runtime = runtime(Arc::clone(&service), &store);

        runtime.start().await.unwrap();
        wait_for_ticks(&service, 2).await;

        let begun = tokio::time::Instant::now();
        runtime.stop().await;
        let elapsed = begun.elapsed();

        assert_eq!(runtime.state(), ServiceState::Stopped);
        assert!(elapsed >= STOP_TIMEOUT);
        assert!(elapsed < STOP_TIMEOUT + Duration::from_secs(1));
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }
}
