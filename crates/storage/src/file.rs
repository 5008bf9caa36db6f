use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use snafu::ResultExt;

use super::error::{
    CreateDirectorySnafu, ParseBlobSnafu, RemoveBlobSnafu, RenameTempFileSnafu,
    SerializeBlobSnafu, StorageError, WriteBlobSnafu,
};
use super::{BoxFuture, HistoryKeeper, Moment, StorageResult, empty_blob};

pub const HISTORY_DIRECTORY_NAME: &str = "history";

/// Stores each moment as `<dir>/<moment>.json`, replaced atomically on save.
#[derive(Debug)]
pub struct FileHistoryKeeper {
    dir: PathBuf,
    write_locks: Mutex<HashMap<Moment, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileHistoryKeeper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, moment: &Moment) -> PathBuf {
        self.dir.join(format!("{moment}.json"))
    }

    fn write_lock(&self, moment: &Moment) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(moment.clone()).or_default())
    }

    /// Drops the moment's lock entry unless another writer is already waiting on it.
    fn release_write_lock(&self, moment: &Moment, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(moment)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(lock) == 2);
        if idle {
            locks.remove(moment);
        }
    }

    async fn read_blob(&self, moment: &Moment) -> StorageResult<serde_json::Value> {
        let path = self.path_for(moment);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(empty_blob()),
            Err(source) => {
                return Err(StorageError::ReadBlob {
                    stage: "history-file-read",
                    path,
                    source,
                });
            }
        };

        serde_json::from_str(&content).context(ParseBlobSnafu {
            stage: "history-file-parse",
            moment: moment.to_string(),
        })
    }

    async fn write_blob(&self, moment: &Moment, blob: &serde_json::Value) -> StorageResult<()> {
        let lock = self.write_lock(moment);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .context(CreateDirectorySnafu {
                stage: "history-file-create-directory",
                path: self.dir.clone(),
            })?;

        let content = serde_json::to_string_pretty(blob).context(SerializeBlobSnafu {
            stage: "history-file-serialize",
        })?;

        let path = self.path_for(moment);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .context(WriteBlobSnafu {
                stage: "history-file-write-temporary",
                path: temp_path.clone(),
            })?;

        tokio::fs::rename(&temp_path, &path)
            .await
            .context(RenameTempFileSnafu {
                stage: "history-file-rename-temporary",
                from: temp_path,
                to: path.clone(),
            })?;

        tracing::debug!(moment = %moment, path = ?path, "saved history blob");
        Ok(())
    }

    async fn remove_blob(&self, moment: &Moment) -> StorageResult<()> {
        let lock = self.write_lock(moment);
        let _guard = lock.lock().await;

        let path = self.path_for(moment);
        let result = match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveBlobSnafu {
                stage: "history-file-remove",
                path,
            }),
        };
        self.release_write_lock(moment, &lock);
        result
    }
}

impl HistoryKeeper for FileHistoryKeeper {
    fn remember<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<serde_json::Value>> {
        Box::pin(self.read_blob(moment))
    }

    fn save<'a>(
        &'a self,
        moment: &'a Moment,
        blob: serde_json::Value,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move { self.write_blob(moment, &blob).await })
    }

    fn forget<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.remove_blob(moment))
    }
}
