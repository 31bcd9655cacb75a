// Config Provider Port
// Source of the gateway configuration, re-read periodically by the supervisor

use crate::domain::GatewayConfig;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load the current configuration
    async fn load(&self) -> Result<GatewayConfig>;
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Serves whatever configuration was last set
    pub struct StaticConfigProvider {
        config: Mutex<GatewayConfig>,
    }

    impl StaticConfigProvider {
        pub fn new(config: GatewayConfig) -> Self {
            Self {
                config: Mutex::new(config),
            }
        }

        pub fn set(&self, config: GatewayConfig) {
            *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        }
    }

    #[async_trait]
    impl ConfigProvider for StaticConfigProvider {
        async fn load(&self) -> Result<GatewayConfig> {
            Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
        }
    }
}
