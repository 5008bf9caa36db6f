use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::error::{
    CreateDirectorySnafu, ParseBlobSnafu, SerializeBlobSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu,
};
use super::{BoxFuture, HistoryKeeper, Moment, StorageResult, empty_blob};

/// Keeps history blobs in a single sqlite table, one row per moment.
#[derive(Debug, Clone)]
pub struct SqliteHistoryKeeper {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteHistoryKeeper {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single connection serializes writes, and keeps `:memory:` databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite history store");
        Ok(Self { pool, database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    async fn read_blob(&self, moment: &Moment) -> StorageResult<serde_json::Value> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT blob FROM history_blobs WHERE moment = ?")
                .bind(moment.as_str())
                .fetch_optional(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "history-sqlite-select",
                })?;

        let Some(raw) = raw else {
            return Ok(empty_blob());
        };

        serde_json::from_str(&raw).context(ParseBlobSnafu {
            stage: "history-sqlite-parse",
            moment: moment.to_string(),
        })
    }

    async fn write_blob(&self, moment: &Moment, blob: &serde_json::Value) -> StorageResult<()> {
        let content = serde_json::to_string(blob).context(SerializeBlobSnafu {
            stage: "history-sqlite-serialize",
        })?;

        sqlx::query(
            "INSERT INTO history_blobs (moment, blob, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(moment) DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
        )
        .bind(moment.as_str())
        .bind(content)
        .bind(unix_timestamp_seconds())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "history-sqlite-upsert",
        })?;
        Ok(())
    }

    async fn remove_blob(&self, moment: &Moment) -> StorageResult<()> {
        sqlx::query("DELETE FROM history_blobs WHERE moment = ?")
            .bind(moment.as_str())
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "history-sqlite-delete",
            })?;
        Ok(())
    }
}

impl HistoryKeeper for SqliteHistoryKeeper {
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

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: PathBuf::from(parent),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
