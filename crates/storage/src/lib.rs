//! Persistence for conversation history blobs keyed by an opaque moment.

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod file;
pub mod ids;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use file::FileHistoryKeeper;
pub use ids::Moment;
pub use memory::MemoryHistoryKeeper;
pub use sqlite::SqliteHistoryKeeper;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Key-value store for JSON history blobs.
///
/// A missing blob is not an error: `remember` yields an empty JSON object and `forget`
/// succeeds. Writes to the same moment never interleave.
pub trait HistoryKeeper: Send + Sync {
    fn new_key(&self) -> Moment {
        Moment::generate()
    }

    fn remember<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<serde_json::Value>>;

    fn save<'a>(
        &'a self,
        moment: &'a Moment,
        blob: serde_json::Value,
    ) -> BoxFuture<'a, StorageResult<()>>;

    fn forget<'a>(&'a self, moment: &'a Moment) -> BoxFuture<'a, StorageResult<()>>;
}

pub(crate) fn empty_blob() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
