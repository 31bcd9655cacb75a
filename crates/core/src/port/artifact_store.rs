// Artifact Store Port
// Received associations and downloaded results live as folders of files

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Folder has no files: {0}")]
    EmptyFolder(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Files directly inside `folder`, sorted by name
    async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, ArtifactError>;

    /// Pack every file of `folder` into one archive
    ///
    /// # Errors
    /// - ArtifactError::NotFound if the folder does not exist
    /// - ArtifactError::EmptyFolder if it holds no files
    async fn pack_folder(&self, folder: &Path) -> Result<Vec<u8>, ArtifactError>;

    /// Write `bytes` as `folder/name`, creating the folder, and return the file path
    async fn write_file(
        &self,
        folder: &Path,
        name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError>;

    /// Remove a file or folder recursively; a missing path is not an error
    async fn delete(&self, path: &Path) -> Result<(), ArtifactError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Artifact store over an in-memory file map
    #[derive(Default)]
    pub struct InMemoryArtifactStore {
        files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
        deleted: Mutex<Vec<PathBuf>>,
    }

    impl InMemoryArtifactStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_file(&self, path: impl Into<PathBuf>, bytes: &[u8]) {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.into(), bytes.to_vec());
        }

        pub fn contains(&self, path: &Path) -> bool {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .any(|p| p.starts_with(path))
        }

        pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(path)
                .cloned()
        }

        /// Every path passed to delete, in call order
        pub fn deleted(&self) -> Vec<PathBuf> {
            self.deleted.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl ArtifactStore for InMemoryArtifactStore {
        async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
            let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            Ok(files
                .keys()
                .filter(|p| p.parent() == Some(folder))
                .cloned()
                .collect())
        }

        async fn pack_folder(&self, folder: &Path) -> Result<Vec<u8>, ArtifactError> {
            let files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            let mut archive = Vec::new();
            for (_, bytes) in files.iter().filter(|(p, _)| p.parent() == Some(folder)) {
                archive.extend_from_slice(bytes);
            }
            if archive.is_empty() {
                return Err(ArtifactError::EmptyFolder(folder.display().to_string()));
            }
            Ok(archive)
        }

        async fn write_file(
            &self,
            folder: &Path,
            name: &str,
            bytes: &[u8],
        ) -> Result<PathBuf, ArtifactError> {
            let path = folder.join(name);
            self.add_file(path.clone(), bytes);
            Ok(path)
        }

        async fn delete(&self, path: &Path) -> Result<(), ArtifactError> {
            self.deleted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(path.to_path_buf());
            self.files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|p, _| !p.starts_with(path));
            Ok(())
        }
    }
}
