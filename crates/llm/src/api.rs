use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::ApiResult;
use super::message::{ChatMessage, MessageDelta, Params, ResponseEnvelope};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared description of an adapter: which endpoint it talks to and how it is presented.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiInfo {
    pub endpoint_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl ApiInfo {
    pub fn new(endpoint_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            name: name.into(),
            icon: None,
            params: Params::new(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// One delta as delivered by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelta {
    pub delta: MessageDelta,
    pub response: ResponseEnvelope,
}

/// Adapter-side handle for delivering deltas to the chat engine.
#[derive(Debug, Clone)]
pub struct DeltaSink {
    events: mpsc::UnboundedSender<StreamDelta>,
}

impl DeltaSink {
    /// Forwards one delta. Returns false once the receiving exchange has gone away,
    /// which adapters treat as a request to stop streaming.
    pub fn emit(&self, delta: MessageDelta, response: ResponseEnvelope) -> bool {
        self.events.send(StreamDelta { delta, response }).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

pub fn delta_channel() -> (DeltaSink, mpsc::UnboundedReceiver<StreamDelta>) {
    let (events, receiver) = mpsc::unbounded_channel();
    (DeltaSink { events }, receiver)
}

/// Per-call inputs shared by both adapter variants.
///
/// `params` is an immutable snapshot of the owning service's API parameters taken when
/// the exchange starts, so later edits never leak into an in-flight call.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub cancel: CancellationToken,
    pub sink: DeltaSink,
    pub params: Params,
}

impl SendOptions {
    pub fn new(cancel: CancellationToken, sink: DeltaSink) -> Self {
        Self {
            cancel,
            sink,
            params: Params::new(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

/// Stateless adapter: every call carries the entire history.
pub trait CompletionApi: Send + Sync {
    fn info(&self) -> &ApiInfo;

    fn send_conversation(
        &self,
        history: Vec<ChatMessage>,
        options: SendOptions,
    ) -> BoxFuture<'_, ApiResult<()>>;

    /// Endpoints that cannot afford an extra request per conversation get local titles.
    fn is_highly_rate_limited(&self) -> bool {
        false
    }
}

/// Stateful adapter: the remote side keeps the session, the client sends only new text.
pub trait ConversationApi: Send + Sync {
    fn info(&self) -> &ApiInfo;

    fn send_message(&self, text: String, options: SendOptions) -> BoxFuture<'_, ApiResult<()>>;

    /// Builds an independent adapter with the same configuration and an empty session.
    /// The returned instance must not share mutable session state with `self`.
    fn clone_with_fresh_session(&self) -> Arc<dyn ConversationApi>;

    /// Whether the remote session can drop turns, making regeneration of an answer legal.
    fn can_regenerate(&self) -> bool {
        false
    }

    /// Asks the remote session to forget history entries at `index` and after.
    fn remove_messages_after(&self, _index: usize) -> BoxFuture<'_, ApiResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Drops the session so the next message starts a new remote conversation.
    fn reset_session(&self) {}

    fn supports_session_deletion(&self) -> bool {
        false
    }

    /// Deletes the remote session created by this instance, if any.
    fn delete_session(&self) -> BoxFuture<'_, ApiResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_highly_rate_limited(&self) -> bool {
        false
    }
}

/// Adapter handle, matched exhaustively wherever the two styles behave differently.
#[derive(Clone)]
pub enum ChatApi {
    Completion(Arc<dyn CompletionApi>),
    Conversation(Arc<dyn ConversationApi>),
}

impl ChatApi {
    pub fn info(&self) -> &ApiInfo {
        match self {
            Self::Completion(api) => api.info(),
            Self::Conversation(api) => api.info(),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.info().endpoint_id
    }

    pub fn is_highly_rate_limited(&self) -> bool {
        match self {
            Self::Completion(api) => api.is_highly_rate_limited(),
            Self::Conversation(api) => api.is_highly_rate_limited(),
        }
    }

    /// Returns an instance safe to drive a parallel conversation.
    ///
    /// Completion adapters are stateless and shared; conversation adapters get a fresh session.
    pub fn fork(&self) -> Self {
        match self {
            Self::Completion(api) => Self::Completion(Arc::clone(api)),
            Self::Conversation(api) => Self::Conversation(api.clone_with_fresh_session()),
        }
    }
}

impl std::fmt::Debug for ChatApi {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Completion(_) => "Completion",
            Self::Conversation(_) => "Conversation",
        };
        formatter
            .debug_struct("ChatApi")
            .field("kind", &kind)
            .field("endpoint_id", &self.endpoint_id())
            .finish()
    }
}
