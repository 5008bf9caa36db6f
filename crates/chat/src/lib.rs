//! Conversation engine: single-flight exchanges over a chat API, delta accumulation,
//! title generation and collections of conversations.

pub mod error;
pub mod events;
pub mod multi;
pub mod pending;
pub mod record;
pub mod service;
pub mod title;

#[cfg(test)]
mod testing;

pub use error::{ChatError, ChatResult};
pub use events::{ChatEvent, MultiChatsEvent};
pub use multi::{MultiChatsOptions, MultiChatsService};
pub use pending::{ExchangePhase, MessagePatch, PendingMessage};
pub use record::{
    ChatRecord, ChatServiceRecord, HistoryBlob, MultiChatsServiceRecord, ServiceRecord,
    ServiceShape,
};
pub use service::{ChatService, ChatServiceOptions};
pub use title::{TitleGenerator, TitleSettings, clean_title};
