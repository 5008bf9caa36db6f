use std::env;
use std::path::PathBuf;

use chorus::repl::{Repl, ReplError};
use chorus::services::ServicesStore;
use chorus::settings::SettingsStore;
use chorus_chat::{ChatError, MultiChatsOptions, MultiChatsService, ServiceRecord};
use chorus_llm::ApiRegistry;
use chorus_storage::StorageError;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    endpoint: Option<String>,
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("endpoint '{endpoint_id}' is not configured or has no api key"))]
    EndpointUnavailable {
        stage: &'static str,
        endpoint_id: String,
    },
    #[snafu(display("no endpoint is configured"))]
    NoEndpoint { stage: &'static str },
    #[snafu(display("failed to open history storage: {source}"))]
    OpenHistory {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to restore saved chats: {source}"))]
    RestoreChats {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("terminal i/o failed: {source}"))]
    Terminal {
        stage: &'static str,
        source: ReplError,
    },
}

type AppResult<T> = Result<T, AppError>;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("chorus: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings_store = match args.config_path {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    init_tracing(&settings.log_filter);

    let endpoint_id = match args.endpoint {
        Some(endpoint_id) => endpoint_id,
        None => settings
            .default_endpoint_id()
            .context(NoEndpointSnafu {
                stage: "select-endpoint",
            })?
            .to_string(),
    };
    let registry = ApiRegistry::from_endpoints(settings.endpoints.clone());
    let api = registry
        .get(&endpoint_id)
        .cloned()
        .context(EndpointUnavailableSnafu {
            stage: "select-endpoint",
            endpoint_id: endpoint_id.clone(),
        })?;

    let config_dir = settings_store.config_dir();
    let keeper = settings
        .open_history_keeper(&config_dir)
        .await
        .context(OpenHistorySnafu {
            stage: "open-history-keeper",
        })?;

    let services = ServicesStore::in_dir(&config_dir);
    let saved = services.find(|record| {
        matches!(record, ServiceRecord::Multi(record) if record.api == endpoint_id)
    });
    let service = match saved {
        Some(ServiceRecord::Multi(record)) => MultiChatsService::from_record(
            &record,
            &registry,
            keeper,
            settings.title.clone(),
        )
        .context(RestoreChatsSnafu {
            stage: "restore-collection",
        })?,
        _ => {
            let name = api.info().name.clone();
            MultiChatsService::new(
                MultiChatsOptions::new(name, api, keeper).with_title_settings(settings.title.clone()),
            )
        }
    };

    tracing::info!(
        endpoint_id = %endpoint_id,
        chats = service.len(),
        config_dir = %config_dir.display(),
        "chorus started"
    );

    let mut repl = Repl::new(service.clone(), services, tokio::io::stdin(), tokio::io::stdout());
    let result = repl.run().await;
    service.destroy();
    result.context(TerminalSnafu { stage: "run-repl" })
}

fn init_tracing(fallback_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_args(args: impl IntoIterator<Item = String>) -> AppResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config",
                    arg: "--config",
                })?;
                parsed.config_path = Some(PathBuf::from(value));
            }
            "--endpoint" => {
                let value = args.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-endpoint",
                    arg: "--endpoint",
                })?;
                parsed.endpoint = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: arg,
                }
                .fail();
            }
        }
    }
    Ok(parsed)
}
