// Filesystem ArtifactStore
// reason: tokio::fs for async IO, tar + flate2 for the upload archive

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use gateway_core::port::{ArtifactError, ArtifactStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use tokio::fs;
use tracing::{debug, info};

fn io_error(path: &Path, err: std::io::Error) -> ArtifactError {
    if err.kind() == ErrorKind::NotFound {
        ArtifactError::NotFound(path.display().to_string())
    } else {
        ArtifactError::Io(format!("{}: {}", path.display(), err))
    }
}

/// Artifact store over the local filesystem
///
/// Association and result folders are flat: only regular files directly inside
/// a folder belong to it.
#[derive(Debug, Clone, Default)]
pub struct FsArtifactStore;

impl FsArtifactStore {
    pub fn new() -> Self {
        Self
    }
}

/// Regular files directly inside `folder`, sorted by path
async fn files_in(folder: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut entries = fs::read_dir(folder).await.map_err(|e| io_error(folder, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error(folder, e))?
    {
        let file_type = entry.file_type().await.map_err(|e| io_error(folder, e))?;
        if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn build_archive(files: &[PathBuf]) -> Result<Vec<u8>, ArtifactError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = TarBuilder::new(encoder);

    for path in files {
        let name = path
            .file_name()
            .ok_or_else(|| ArtifactError::Archive(format!("no file name: {}", path.display())))?;
        tar.append_path_with_name(path, name)
            .map_err(|e| ArtifactError::Archive(format!("{}: {}", path.display(), e)))?;
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| ArtifactError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ArtifactError::Archive(e.to_string()))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn list_files(&self, folder: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
        files_in(folder).await
    }

    async fn pack_folder(&self, folder: &Path) -> Result<Vec<u8>, ArtifactError> {
        let files = files_in(folder).await?;
        if files.is_empty() {
            return Err(ArtifactError::EmptyFolder(folder.display().to_string()));
        }

        let count = files.len();
        let archive = tokio::task::spawn_blocking(move || build_archive(&files))
            .await
            .map_err(|e| ArtifactError::Archive(format!("archive task failed: {}", e)))??;

        debug!(
            folder = %folder.display(),
            files = count,
            bytes = archive.len(),
            "Folder packed"
        );
        Ok(archive)
    }

    async fn write_file(
        &self,
        folder: &Path,
        name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(folder)
            .await
            .map_err(|e| io_error(folder, e))?;
        let path = folder.join(name);
        fs::write(&path, bytes).await.map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    async fn delete(&self, path: &Path) -> Result<(), ArtifactError> {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Already deleted");
                return Ok(());
            }
            Err(e) => return Err(io_error(path, e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => {
                info!(path = %path.display(), "Artifact deleted");
                Ok(())
            }
            // Raced with another delete
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }
}
