use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Recovery action a remote endpoint asked for, rendered by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryHint {
    CredentialsExpired,
    ReauthenticationRequired,
}

impl fmt::Display for RecoveryHint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialsExpired => formatter.write_str("credentials expired"),
            Self::ReauthenticationRequired => formatter.write_str("re-authentication required"),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Adapter failure taxonomy.
///
/// Variants keep rendered messages instead of transport sources so the value can be
/// stored as a service's last error and broadcast to every listener.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("network error on `{stage}`: {message}"))]
    Network {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("API error on `{stage}`: {message}"))]
    Api {
        stage: &'static str,
        message: String,
        hint: Option<RecoveryHint>,
    },
    #[snafu(display("request aborted on `{stage}`"))]
    Aborted { stage: &'static str },
    #[snafu(display("server closed connection without sending a message"))]
    ServerClosedConnection { stage: &'static str },
    #[snafu(display("missing API key for endpoint '{endpoint_id}'"))]
    MissingApiKey {
        stage: &'static str,
        endpoint_id: String,
    },
    #[snafu(display("API type '{api_type}' is not supported"))]
    UnsupportedApi {
        stage: &'static str,
        api_type: String,
    },
}

impl ApiError {
    pub fn network(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Network {
            stage,
            message: message.into(),
        }
    }

    pub fn api(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Api {
            stage,
            message: message.into(),
            hint: None,
        }
    }

    pub fn aborted(stage: &'static str) -> Self {
        Self::Aborted { stage }
    }

    pub fn with_hint(self, hint: RecoveryHint) -> Self {
        match self {
            Self::Api { stage, message, .. } => Self::Api {
                stage,
                message,
                hint: Some(hint),
            },
            other => other,
        }
    }

    /// True for caller- or transport-initiated cancellation, which is not a failure by itself.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn recovery_hint(&self) -> Option<RecoveryHint> {
        match self {
            Self::Api { hint, .. } => *hint,
            _ => None,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Network { stage, .. }
            | Self::Api { stage, .. }
            | Self::Aborted { stage }
            | Self::ServerClosedConnection { stage }
            | Self::MissingApiKey { stage, .. }
            | Self::UnsupportedApi { stage, .. } => stage,
        }
    }
}
