// Gateway configuration model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Per-stage queue policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Messages dequeued this many times are dead-lettered instead of re-queued
    pub max_dequeue_count: u32,

    /// Hard expiry after which a failed message is dropped from every queue (seconds)
    pub maximum_message_age_secs: u64,

    /// How often dead-lettered messages are replayed onto the primary queue (seconds)
    pub dead_letter_move_frequency_secs: u64,

    /// How long an empty-queue read blocks before reporting no work (milliseconds)
    pub dequeue_timeout_ms: u64,

    /// Number of competing worker loops
    pub instances: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            max_dequeue_count: 1,
            maximum_message_age_secs: 7 * 24 * 60 * 60, // 7 days
            dead_letter_move_frequency_secs: 30 * 60,  // 30 minutes
            dequeue_timeout_ms: 2_000,
            instances: 1,
        }
    }
}

impl StageConfig {
    pub fn maximum_message_age(&self) -> Duration {
        Duration::from_secs(self.maximum_message_age_secs)
    }

    pub fn dead_letter_move_frequency(&self) -> Duration {
        Duration::from_secs(self.dead_letter_move_frequency_secs)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

/// Queue storage and working directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding every queue
    pub queue_db_path: String,

    /// Root folder for downloaded results
    pub results_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_db_path: "~/.gateway/queues.db".to_string(),
            results_root: PathBuf::from("~/.gateway/results"),
        }
    }
}

/// Remote inference service connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL; an empty value means no client is configured
    pub base_url: String,
    pub auth_secret: String,
    pub request_timeout_secs: u64,

    /// Attempts made when the service answers 503
    pub unavailable_retry_attempts: u32,
    pub unavailable_retry_delay_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_secret: String::new(),
            request_timeout_secs: 120,
            unavailable_retry_attempts: 5,
            unavailable_retry_delay_ms: 5_000,
        }
    }
}

impl InferenceConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }
}

/// Result polling behaviour of the download stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_secs: 60 * 60,
        }
    }
}

impl DownloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Route from a called AE title to a model and result destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveRoute {
    pub model_id: String,
    #[serde(default)]
    pub destination: Option<String>,
}

/// Association routing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    /// Called AE title -> route
    pub routes: HashMap<String, ReceiveRoute>,

    /// Destination used when a route does not name one
    pub default_destination: String,
}

impl ReceiveConfig {
    /// Resolve (model id, destination) for a called AE title
    ///
    /// An exact match wins; otherwise the title is matched ignoring ASCII case,
    /// since configuration sources may normalise key case.
    pub fn route(&self, called_ae: &str) -> Option<(String, String)> {
        let route = self.routes.get(called_ae).or_else(|| {
            self.routes
                .iter()
                .find(|(title, _)| title.eq_ignore_ascii_case(called_ae))
                .map(|(_, route)| route)
        });
        route.map(|route| {
            let destination = route
                .destination
                .clone()
                .unwrap_or_else(|| self.default_destination.clone());
            (route.model_id.clone(), destination)
        })
    }
}

/// Configuration refresh behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub refresh_delay_secs: u64,

    /// When this configuration was written; newer values trigger a restart
    pub config_created_at: Option<DateTime<Utc>>,

    /// Earliest time a newer configuration may be applied
    pub apply_at: Option<DateTime<Utc>>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            refresh_delay_secs: 60,
            config_created_at: None,
            apply_at: None,
        }
    }
}

impl SupervisorConfig {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_secs(self.refresh_delay_secs)
    }

    pub fn created_at_millis(&self) -> Option<i64> {
        self.config_created_at.map(|t| t.timestamp_millis())
    }

    /// True when the apply time is unset or has passed
    pub fn is_due(&self, now_millis: i64) -> bool {
        self.apply_at
            .map(|t| t.timestamp_millis() <= now_millis)
            .unwrap_or(true)
    }
}

/// Whole gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub storage: StorageConfig,
    pub inference: InferenceConfig,
    pub download: DownloadConfig,
    pub receive: ReceiveConfig,
    pub supervisor: SupervisorConfig,

    pub receive_stage: StageConfig,
    pub upload_stage: StageConfig,
    pub download_stage: StageConfig,
    pub push_stage: StageConfig,
    pub delete_stage: StageConfig,
}
