use chorus_llm::ApiError;
use snafu::Snafu;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures that escape a chat operation.
///
/// Network and remote failures of an exchange are not here: they are recorded as the
/// service's last error and broadcast instead of being returned.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("a message is already being sent on `{stage}`"))]
    SendWhilePending { stage: &'static str },
    #[snafu(display("chat service has been destroyed"))]
    ServiceDestroyed { stage: &'static str },
    #[snafu(display("conversation history is empty"))]
    EmptyHistory { stage: &'static str },
    #[snafu(display("message index {index} is out of range for {len} messages"))]
    IndexOutOfRange {
        stage: &'static str,
        index: isize,
        len: usize,
    },
    #[snafu(display("cannot regenerate from the root message"))]
    RegenerateRoot { stage: &'static str },
    #[snafu(display("nothing to regenerate: {details}"))]
    NothingToRegenerate {
        stage: &'static str,
        details: &'static str,
    },
    #[snafu(display("adapter sent a first delta without a role"))]
    MissingRole { stage: &'static str },
    #[snafu(display("adapter completed a message without {missing}"))]
    IncompleteMessage {
        stage: &'static str,
        missing: &'static str,
    },
    #[snafu(display("remote session rejected `{stage}`: {source}"))]
    RemoteSession {
        stage: &'static str,
        source: ApiError,
    },
    #[snafu(display("no API is registered for endpoint '{endpoint_id}'"))]
    UnknownApi {
        stage: &'static str,
        endpoint_id: String,
    },
}

impl ChatError {
    /// Adapter broke the delta contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::MissingRole { .. } | Self::IncompleteMessage { .. })
    }

    /// Caller invoked an operation against the service's current state.
    pub fn is_state_violation(&self) -> bool {
        matches!(
            self,
            Self::SendWhilePending { .. }
                | Self::ServiceDestroyed { .. }
                | Self::EmptyHistory { .. }
                | Self::IndexOutOfRange { .. }
                | Self::RegenerateRoot { .. }
                | Self::NothingToRegenerate { .. }
        )
    }
}
