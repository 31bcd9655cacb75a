// Directory ResultSender
// Delivers result files by copying them into a destination directory

use async_trait::async_trait;
use gateway_core::port::{ResultSender, SendError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Suffix of a copy still in progress; readers of the destination ignore it
const PARTIAL_SUFFIX: &str = ".partial";

/// Treats the destination as a directory that must already exist
#[derive(Debug, Clone, Default)]
pub struct DirectoryResultSender;

impl DirectoryResultSender {
    pub fn new() -> Self {
        Self
    }

    async fn copy_one(source: &Path, destination: &Path) -> Result<(), SendError> {
        let name = source
            .file_name()
            .ok_or_else(|| SendError::Rejected(format!("no file name: {}", source.display())))?;
        let target = destination.join(name);
        let partial = destination.join(format!("{}{}", name.to_string_lossy(), PARTIAL_SUFFIX));

        fs::copy(source, &partial)
            .await
            .map_err(|e| SendError::Io(format!("{}: {}", source.display(), e)))?;
        fs::rename(&partial, &target)
            .await
            .map_err(|e| SendError::Io(format!("{}: {}", target.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl ResultSender for DirectoryResultSender {
    async fn send(&self, destination: &str, files: &[PathBuf]) -> Result<(), SendError> {
        let destination_dir = Path::new(destination);
        match fs::metadata(destination_dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(SendError::Rejected(format!(
                    "destination is not a directory: {}",
                    destination
                )))
            }
            Err(e) => {
                return Err(SendError::Unreachable(format!("{}: {}", destination, e)));
            }
        }

        for file in files {
            Self::copy_one(file, destination_dir).await?;
        }

        info!(destination = %destination, files = files.len(), "Results delivered");
        Ok(())
    }
}
