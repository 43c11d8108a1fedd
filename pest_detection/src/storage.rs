use crate::config::StorageConfig;
use image::{ImageFormat, RgbImage};
use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

const OUTPUT_ROUTE: &str = "/output";
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to prepare directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode {path:?}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Failed to list {path:?}: {source}")]
    List {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Files of one request are named after a fresh key, so concurrent
/// uploads never overwrite each other.
#[derive(Debug, Clone)]
pub struct OutputStorage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl OutputStorage {
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        for dir in [&config.upload_dir, &config.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| StorageError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        Ok(Self {
            upload_dir: config.upload_dir.clone(),
            output_dir: config.output_dir.clone(),
        })
    }

    pub fn new_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn save_upload(
        &self,
        key: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let path = self
            .upload_dir
            .join(format!("{}.{}", key, upload_extension(file_name)));
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| StorageError::Write {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }

    /// Encodes `image` as JPEG under the output directory and returns the
    /// file name. Blocking.
    pub fn save_annotated(&self, key: &str, image: &RgbImage) -> Result<String, StorageError> {
        let file_name = format!("{}.jpg", key);
        let path = self.output_dir.join(&file_name);
        image
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|source| StorageError::Encode { path, source })?;

        Ok(file_name)
    }

    pub fn public_path(&self, file_name: &str) -> String {
        format!("{}/{}", OUTPUT_ROUTE, file_name)
    }

    /// Deletes uploads and annotated images last modified at least
    /// `max_age` ago and returns how many were removed.
    pub async fn prune(&self, max_age: Duration) -> Result<usize, StorageError> {
        let now = SystemTime::now();
        let mut removed = 0;

        for dir in [&self.upload_dir, &self.output_dir] {
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .map_err(|source| StorageError::List {
                    path: dir.clone(),
                    source,
                })?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| StorageError::List {
                    path: dir.clone(),
                    source,
                })?
            {
                let path = entry.path();
                let modified = match entry.metadata().await {
                    Ok(metadata) if metadata.is_file() => metadata.modified(),
                    Ok(_) => continue,
                    Err(e) => Err(e),
                };
                let age = match modified {
                    Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!("Skipping {:?}: {}", path, e);
                        continue;
                    }
                };
                if age < max_age {
                    continue;
                }

                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    // Already gone
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
                }
            }
        }

        Ok(removed)
    }

    /// Prunes expired files periodically until a shutdown is broadcast.
    pub async fn run_retention(self, max_age: Duration, mut shutdown_rx: Receiver<()>) {
        let mut interval = tokio::time::interval(max_age.min(PRUNE_INTERVAL));
        tracing::info!("Deleting stored files older than {:?}", max_age);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.prune(max_age).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!("Pruned {} stored files", removed),
                        Err(e) => tracing::error!("Failed to prune stored files: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Retention task stopped");
                    break;
                }
            }
        }
    }
}

// Client supplied names never reach the filesystem, only a sanitized extension.
fn upload_extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}
