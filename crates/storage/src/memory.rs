use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{BoxFuture, HistoryKeeper, Moment, StorageResult, empty_blob};

/// Process-local keeper used when history must not touch the disk.
#[derive(Debug, Default)]
pub struct MemoryHistoryKeeper {
    blobs: Mutex<HashMap<Moment, serde_json::Value>>,
}

impl MemoryHistoryKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, moment: &Moment) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(moment)
    }
}

impl HistoryKeeper for MemoryHistoryKeeper {
    fn remember<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<serde_json::Value>> {
        Box::pin(async move {
            let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(blobs.get(moment).cloned().unwrap_or_else(empty_blob))
        })
    }

    fn save<'a>(
        &'a self,
        moment: &'a Moment,
        blob: serde_json::Value,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.blobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(moment.clone(), blob);
            Ok(())
        })
    }

    fn forget<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.blobs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(moment);
            Ok(())
        })
    }
}
