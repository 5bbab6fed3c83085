//! Local Cache
//!
//! One durable blob holding the last Dataset that passed the data-loss
//! guard. Read at cold start, overwritten only after an accepted fetch.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::{PortalError, Result};
use crate::model::Dataset;

pub trait LocalCache: Send + Sync + 'static {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> impl Future<Output = Result<Option<Dataset>>> + Send;

    fn store(&self, dataset: &Dataset) -> impl Future<Output = Result<()>> + Send;
}

/// JSON file at `<dir>/<key>.json`, replaced atomically on every store.
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            path: config.dir.join(format!("{}.json", config.key)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalCache for FileCache {
    async fn load(&self) -> Result<Option<Dataset>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Dataset>(&raw) {
            Ok(dataset) => {
                tracing::info!(
                    path = %self.path.display(),
                    students = dataset.students.len(),
                    "Loaded dataset from local cache"
                );
                Ok(Some(dataset))
            }
            Err(e) => {
                // A corrupt blob is as good as none; the next accepted fetch rewrites it.
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding unreadable cache");
                Ok(None)
            }
        }
    }

    async fn store(&self, dataset: &Dataset) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let body = serde_json::to_vec(dataset)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PortalError::Cache(format!("rename {}: {}", tmp.display(), e)))?;

        tracing::debug!(path = %self.path.display(), bytes = body.len(), "Local cache updated");
        Ok(())
    }
}

/// Process-local cache for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryCache {
    slot: Mutex<Option<Dataset>>,
}

impl MemoryCache {
    pub fn with(dataset: Dataset) -> Self {
        Self {
            slot: Mutex::new(Some(dataset)),
        }
    }

    pub fn snapshot(&self) -> Option<Dataset> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl LocalCache for MemoryCache {
    async fn load(&self) -> Result<Option<Dataset>> {
        Ok(self.snapshot())
    }

    async fn store(&self, dataset: &Dataset) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(dataset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{room, student};
    use crate::model::StudentStatus;

    fn cache_in(dir: &Path) -> FileCache {
        FileCache::new(&CacheConfig {
            dir: dir.join("nested"),
            key: "examsy_backup".to_string(),
        })
    }

    #[tokio::test]
    async fn test_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let dataset = Dataset {
            students: vec![student("1234", "7", StudentStatus::InProgress)],
            sessions: vec![],
            rooms: vec![room("r-1")],
        };

        cache.store(&dataset).await.unwrap();
        assert!(cache.path().ends_with("nested/examsy_backup.json"));
        assert_eq!(cache.load().await.unwrap(), Some(dataset));
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        tokio::fs::create_dir_all(cache.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(cache.path(), b"{not json").await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemoryCache::default();
        assert!(cache.load().await.unwrap().is_none());
        cache.store(&Dataset::default()).await.unwrap();
        assert_eq!(cache.snapshot(), Some(Dataset::default()));
    }
}
