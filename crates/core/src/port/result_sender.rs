// Result Sender Port
// Delivers result files to the destination endpoint (protocol client adapter)

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    #[error("Destination rejected result: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(String),
}

#[async_trait]
pub trait ResultSender: Send + Sync {
    /// Send `files` to `destination`
    async fn send(&self, destination: &str, files: &[PathBuf]) -> Result<(), SendError>;
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Records deliveries; optionally fails the first `failures` calls
    #[derive(Default)]
    pub struct RecordingResultSender {
        sent: Mutex<Vec<(String, Vec<PathBuf>)>>,
        failures: Mutex<u32>,
    }

    impl RecordingResultSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(failures: u32) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }

        pub fn sent(&self) -> Vec<(String, Vec<PathBuf>)> {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl ResultSender for RecordingResultSender {
        async fn send(&self, destination: &str, files: &[PathBuf]) -> Result<(), SendError> {
            {
                let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SendError::Unreachable(destination.to_string()));
                }
            }
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((destination.to_string(), files.to_vec()));
            Ok(())
        }
    }
}
