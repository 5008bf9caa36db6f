use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chorus_chat::ServiceRecord;

use crate::settings::{SettingsError, persist_json};

pub const SERVICES_FILE_NAME: &str = "services.json";

/// The list of persisted chat services, kept beside the settings file.
pub struct ServicesStore {
    records: Arc<ArcSwap<Vec<ServiceRecord>>>,
    path: PathBuf,
}

impl ServicesStore {
    pub fn new(path: PathBuf) -> Self {
        let records = Self::load_from_disk(&path);
        Self {
            records: Arc::new(ArcSwap::from_pointee(records)),
            path,
        }
    }

    pub fn in_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join(SERVICES_FILE_NAME))
    }

    pub fn records(&self) -> Arc<Vec<ServiceRecord>> {
        self.records.load_full()
    }

    pub fn find(&self, predicate: impl Fn(&ServiceRecord) -> bool) -> Option<ServiceRecord> {
        self.records.load().iter().find(|record| predicate(record)).cloned()
    }

    pub fn update(&self, records: Vec<ServiceRecord>) -> Result<(), SettingsError> {
        persist_json(&self.path, &records)?;
        self.records.store(Arc::new(records));
        Ok(())
    }

    /// Replaces the record with the same name and api, or appends it.
    pub fn upsert(&self, record: ServiceRecord) -> Result<(), SettingsError> {
        let mut records = self.records.load().as_ref().clone();
        match records
            .iter_mut()
            .find(|existing| existing.name() == record.name() && existing.api() == record.api())
        {
            Some(existing) => {
                if *existing == record {
                    return Ok(());
                }
                *existing = record;
            }
            None => records.push(record),
        }
        self.update(records)
    }

    fn load_from_disk(path: &Path) -> Vec<ServiceRecord> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to read services file, starting empty"
                );
                return Vec::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse services file, starting empty"
                );
                Vec::new()
            }
        }
    }
}
