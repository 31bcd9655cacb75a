// Pipeline Supervisor - configuration refresh, restart and cascading stop

use crate::application::runtime::{Service, ServiceContext, ServiceRuntime, StopRequested};
use crate::domain::{GatewayConfig, InferenceConfig, SupervisorConfig};
use crate::error::Result;
use crate::port::{
    ConfigProvider, InferenceClient, QueueStore, SharedInferenceClient, TimeProvider,
    UnconfiguredInferenceClient,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Builds an inference client for a configured service
pub type InferenceClientFactory =
    Arc<dyn Fn(&InferenceConfig) -> Result<Arc<dyn InferenceClient>> + Send + Sync>;

struct AppliedConfig {
    created_at: Option<i64>,
    refresh_delay: Duration,
}

/// Owns the pipeline stages: starts them, restarts them on new configuration
/// and stops all of them when any one asks to stop
pub struct PipelineSupervisor {
    stages: Vec<Arc<ServiceRuntime>>,
    stop_requests: Vec<StopRequested>,
    config_provider: Arc<dyn ConfigProvider>,
    inference: SharedInferenceClient,
    client_factory: InferenceClientFactory,
    time_provider: Arc<dyn TimeProvider>,
    applied: Mutex<AppliedConfig>,
}

impl PipelineSupervisor {
    pub fn new(
        stages: Vec<Arc<ServiceRuntime>>,
        config_provider: Arc<dyn ConfigProvider>,
        inference: SharedInferenceClient,
        client_factory: InferenceClientFactory,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let stop_requests = stages.iter().map(|stage| stage.stop_requested()).collect();
        Self {
            stages,
            stop_requests,
            config_provider,
            inference,
            client_factory,
            time_provider,
            applied: Mutex::new(AppliedConfig {
                created_at: None,
                refresh_delay: SupervisorConfig::default().refresh_delay(),
            }),
        }
    }

    pub fn stages(&self) -> &[Arc<ServiceRuntime>] {
        &self.stages
    }

    /// Wrap the supervisor in a single-worker runtime
    pub fn into_runtime(self, store: Arc<dyn QueueStore>) -> ServiceRuntime {
        ServiceRuntime::new(Arc::new(self), store, 1)
    }

    fn build_client(&self, config: &InferenceConfig) -> Result<Arc<dyn InferenceClient>> {
        if config.is_configured() {
            (self.client_factory)(config)
        } else {
            Ok(Arc::new(UnconfiguredInferenceClient))
        }
    }

    fn record_applied(&self, config: &GatewayConfig) {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        applied.created_at = config.supervisor.created_at_millis();
        applied.refresh_delay = config.supervisor.refresh_delay();
    }

    fn applied_created_at(&self) -> Option<i64> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .created_at
    }

    fn refresh_delay(&self) -> Duration {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .refresh_delay
    }

    async fn start_stages(&self) -> Result<()> {
        for stage in &self.stages {
            if let Err(e) = stage.start().await {
                error!(stage = %stage.name(), error = %e, "Failed to start managed stage");
                self.stop_stages().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stop_stages(&self) {
        futures::future::join_all(self.stages.iter().map(|stage| stage.stop())).await;
    }

    /// Name of the first managed stage that asked to stop
    fn stage_requesting_stop(&self) -> Option<&str> {
        self.stop_requests
            .iter()
            .position(StopRequested::is_requested)
            .map(|index| self.stages[index].name())
    }

    /// Take the whole pipeline down, then ask the owner to stop the supervisor
    async fn escalate(&self, ctx: &ServiceContext, stage: &str) {
        error!(stage = %stage, "Managed stage requested stop, stopping pipeline");
        self.stop_stages().await;
        ctx.request_stop();
    }

    /// Apply a newer configuration once its apply time has passed
    async fn refresh(&self, ctx: &ServiceContext) -> Result<()> {
        let config = match self.config_provider.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to refresh configuration");
                return Ok(());
            }
        };

        let Some(created_at) = config.supervisor.created_at_millis() else {
            return Ok(());
        };
        if self
            .applied_created_at()
            .is_some_and(|applied| created_at <= applied)
        {
            return Ok(());
        }
        if !config.supervisor.is_due(self.time_provider.now_millis()) {
            debug!(created_at, "Newer configuration not due yet");
            return Ok(());
        }
        ctx.shutdown().ensure_running()?;

        let client = match self.build_client(&config.inference) {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "Failed to build inference client for new configuration");
                return Ok(());
            }
        };

        info!(created_at, "Applying new configuration, restarting pipeline");
        self.stop_stages().await;
        // Shutdown may have arrived while the stages were stopping
        ctx.shutdown().ensure_running()?;
        self.inference.replace(client);
        self.record_applied(&config);

        if let Err(e) = self.start_stages().await {
            error!(error = %e, "Pipeline failed to restart");
            ctx.request_stop();
            return Err(e);
        }
        Ok(())
    }
}

/// Index of the first request to fire; never returns for an empty slice
async fn wait_for_any(requests: &mut [StopRequested]) -> usize {
    if requests.is_empty() {
        return std::future::pending().await;
    }
    let waits = requests.iter_mut().map(|request| Box::pin(request.wait()));
    futures::future::select_all(waits).await.1
}

#[async_trait]
impl Service for PipelineSupervisor {
    fn name(&self) -> &str {
        "supervisor"
    }

    async fn on_start(&self, _ctx: &ServiceContext) -> Result<()> {
        let config = self.config_provider.load().await?;
        let client = self.build_client(&config.inference)?;

        if config.inference.is_configured() {
            match client.ping().await {
                Ok(()) => info!(base_url = %config.inference.base_url, "Inference service reachable"),
                Err(e) if e.is_unauthorized() => {
                    error!(error = %e, "Inference service rejected credentials, not starting pipeline");
                    return Err(e.into());
                }
                Err(e) => warn!(error = %e, "Inference service ping failed, starting anyway"),
            }
        } else {
            warn!("No inference service configured, uploads will fail until one is");
        }

        self.inference.replace(client);
        self.record_applied(&config);
        self.start_stages().await?;
        info!(stages = self.stages.len(), "Pipeline started");
        Ok(())
    }

    async fn tick(&self, ctx: &ServiceContext) -> Result<()> {
        if let Some(stage) = self.stage_requesting_stop() {
            self.escalate(ctx, stage).await;
            return Ok(());
        }

        self.refresh(ctx).await?;

        let mut shutdown = ctx.shutdown().clone();
        let mut requests = self.stop_requests.clone();
        let requested = tokio::select! {
            _ = shutdown.wait() => None,
            _ = sleep(self.refresh_delay()) => None,
            index = wait_for_any(&mut requests) => Some(index),
        };
        if let Some(index) = requested {
            self.escalate(ctx, self.stages[index].name()).await;
        }
        Ok(())
    }

    async fn on_stop(&self, _ctx: &ServiceContext) {
        info!("Stopping pipeline stages");
        self.stop_stages().await;
    }
}
