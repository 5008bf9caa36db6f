//! Chat message model and the adapter contract every backend implements.

pub mod api;
pub mod endpoint;
pub mod error;
pub mod message;
mod rig_adapter;

pub use api::{
    ApiInfo, BoxFuture, ChatApi, CompletionApi, ConversationApi, DeltaSink, SendOptions,
    StreamDelta, delta_channel,
};
pub use endpoint::{
    ApiEndpoint, ApiRegistry, DEFAULT_OPENAI_MODEL, DEFAULT_OPENAI_URL, create_api,
};
pub use error::{ApiError, ApiResult, RecoveryHint};
pub use message::{ChatLink, ChatMessage, ChatRole, MessageDelta, Params, ResponseEnvelope};
pub use rig_adapter::{RIG_OPENAI_API_TYPE, RigCompletionApi};

pub use tokio_util::sync::CancellationToken;
