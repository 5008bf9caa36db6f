use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chorus_chat::TitleSettings;
use chorus_llm::{ApiEndpoint, DEFAULT_OPENAI_URL};
use chorus_storage::{
    FileHistoryKeeper, HistoryKeeper, MemoryHistoryKeeper, SqliteHistoryKeeper, StorageResult,
};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "chorus";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const HISTORY_DIRECTORY_NAME: &str = "history";
pub const SQLITE_FILE_NAME: &str = "history.sqlite3";
pub const ENV_PREFIX: &str = "CHORUS_";
pub const DEFAULT_ENDPOINT_ID: &str = "openai";
pub const DEFAULT_LOG_FILTER: &str = "warn,chorus=info";

/// Where conversation history blobs are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Files,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<ApiEndpoint>,
    #[serde(default)]
    pub default_endpoint: String,
    /// Overrides `<config_dir>/history`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_dir: Option<PathBuf>,
    #[serde(default)]
    pub history_backend: HistoryBackend,
    #[serde(default)]
    pub title: TitleSettings,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            default_endpoint: DEFAULT_ENDPOINT_ID.to_string(),
            history_dir: None,
            history_backend: HistoryBackend::default(),
            title: TitleSettings::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.endpoints = self
            .endpoints
            .into_iter()
            .map(|endpoint| {
                let mut normalized =
                    ApiEndpoint::new(endpoint.id, endpoint.api_type, endpoint.name)
                        .with_url(endpoint.url)
                        .with_key(endpoint.key);
                normalized.icon = endpoint.icon;
                normalized.params = endpoint.params;
                normalized
            })
            .filter(|endpoint| !endpoint.id.is_empty())
            .collect();
        if self.endpoints.is_empty() {
            self.endpoints = default_endpoints();
        }

        self.default_endpoint = self.default_endpoint.trim().to_string();
        self.history_dir = self
            .history_dir
            .filter(|path| !path.as_os_str().is_empty());
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };

        self
    }

    /// The configured default endpoint when it exists, otherwise the first endpoint.
    pub fn default_endpoint_id(&self) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.id == self.default_endpoint)
            .or_else(|| self.endpoints.first())
            .map(|endpoint| endpoint.id.as_str())
    }

    pub fn history_location(&self, config_dir: &Path) -> PathBuf {
        self.history_dir
            .clone()
            .unwrap_or_else(|| config_dir.join(HISTORY_DIRECTORY_NAME))
    }

    pub async fn open_history_keeper(
        &self,
        config_dir: &Path,
    ) -> StorageResult<Arc<dyn HistoryKeeper>> {
        let location = self.history_location(config_dir);
        let keeper: Arc<dyn HistoryKeeper> = match self.history_backend {
            HistoryBackend::Files => Arc::new(FileHistoryKeeper::new(location.clone())),
            HistoryBackend::Sqlite => {
                let database = location.join(SQLITE_FILE_NAME);
                Arc::new(SqliteHistoryKeeper::open(&database.to_string_lossy()).await?)
            }
            HistoryBackend::Memory => Arc::new(MemoryHistoryKeeper::new()),
        };

        tracing::debug!(
            backend = ?self.history_backend,
            location = %location.display(),
            "opened history keeper"
        );
        Ok(keeper)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".chorus"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory holding the settings file; sibling state files live here too.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        persist_json(&self.config_path, &normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Settings {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = %path.display(), "settings file not found, using defaults");
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }
}

/// Writes `value` as pretty JSON through a temporary sibling file.
pub(crate) fn persist_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-config-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(value).context(SerializeConfigSnafu {
        stage: "serialize-config-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-config-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-config-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    tracing::debug!(path = %path.display(), "saved config file");
    Ok(())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_endpoints() -> Vec<ApiEndpoint> {
    vec![ApiEndpoint::new(DEFAULT_ENDPOINT_ID, "openai", "ChatGPT").with_url(DEFAULT_OPENAI_URL)]
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
