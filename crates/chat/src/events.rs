use chorus_llm::{ApiError, ChatMessage, MessageDelta, ResponseEnvelope};
use chorus_storage::Moment;

/// Notifications broadcast by a single conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A user-authored message was appended to history.
    UserMessage(ChatMessage),
    MessageBegin,
    /// A delta exactly as the adapter delivered it.
    MessageDelta {
        delta: MessageDelta,
        response: ResponseEnvelope,
    },
    /// A message finished streaming. `message` is `None` when nothing could be committed;
    /// `response.aborted` tells a caller-aborted exchange apart from an empty one.
    MessageEnd {
        message: Option<ChatMessage>,
        response: ResponseEnvelope,
    },
    /// The exchange is over and the service is idle again.
    ExchangeFinished { aborted: bool },
    Error(ApiError),
    HistoryRemoved { from_index: usize },
    MessageUpdated { index: usize, message: ChatMessage },
    HistoryCleared,
    TitleChanged(Option<String>),
    ShapeChanged,
    MomentAssigned(Moment),
}

/// Notifications broadcast by a conversation collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiChatsEvent {
    ChatCreated { index: usize },
    ChatRemoved { index: usize },
    ChatsCleared,
    ShapeChanged,
}
