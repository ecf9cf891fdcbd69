// src/storage/file.rs - One JSON document per alarm on local disk
use super::{check_not_closed, check_single_open, AlarmQuery, AlarmStore};
use crate::error::{MonitorError, Result};
use crate::model::{Alarm, AlarmId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EXTENSION: &str = "json";

/// Durable alarm store rooted at a directory.
///
/// Each alarm lives in `<id>.json`. Writes go to a temporary sibling that is
/// synced before being renamed into place, and the directory is synced after
/// the rename. A record on disk is always either the old or the new version,
/// and `save` only returns once the new one is durable. All records are
/// indexed in memory on open.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    index: RwLock<HashMap<AlarmId, Alarm>>,
    /// Serializes writers so the single-open check and the rename agree
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            MonitorError::Persistence(format!("cannot create {}: {}", root.display(), e))
        })?;

        let mut index = HashMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(alarm) => {
                    index.insert(alarm.id, alarm);
                }
                Err(e) => warn!("Skipping unreadable alarm record {}: {}", path.display(), e),
            }
        }

        info!("Opened alarm store at {} ({} records)", root.display(), index.len());
        Ok(Self {
            root,
            index: RwLock::new(index),
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, id: AlarmId) -> PathBuf {
        self.root.join(format!("{}.{}", id, EXTENSION))
    }

    async fn read_record(path: &Path) -> Result<Alarm> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl AlarmStore for FileStore {
    async fn save(&self, alarm: &Alarm) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        {
            let index = self.index.read();
            check_not_closed(&index, alarm)?;
            check_single_open(&index, alarm)?;
        }

        let body = serde_json::to_vec_pretty(alarm)?;
        let path = self.record_path(alarm.id);
        let tmp = path.with_extension("tmp");

        if let Err(e) = write_synced(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(MonitorError::Persistence(format!("write {}: {}", tmp.display(), e)));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(MonitorError::Persistence(format!(
                "rename {}: {}",
                path.display(),
                e
            )));
        }
        sync_dir(&self.root)
            .await
            .map_err(|e| MonitorError::Persistence(format!("sync {}: {}", self.root.display(), e)))?;

        debug!("Stored alarm {} ({} bytes)", alarm.id, body.len());
        self.index.write().insert(alarm.id, alarm.clone());
        Ok(())
    }

    async fn get(&self, id: AlarmId) -> Result<Option<Alarm>> {
        Ok(self.index.read().get(&id).cloned())
    }

    async fn open_alarms(&self) -> Result<Vec<Alarm>> {
        Ok(self
            .index
            .read()
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect())
    }

    async fn list(&self, query: &AlarmQuery) -> Result<Vec<Alarm>> {
        Ok(query.apply(self.index.read().values()))
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}

/// Persist the directory entry created by a rename
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
