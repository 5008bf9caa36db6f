use chorus_llm::{ChatLink, ChatMessage, ChatRole, MessageDelta};
use snafu::ensure;

use crate::error::{ChatResult, IncompleteMessageSnafu};

/// Exchange lifecycle of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    /// Waiting for or receiving deltas.
    Streaming,
    /// Adapter returned; closing out the pending message and persisting.
    Finalizing,
}

impl ExchangePhase {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Assistant message under construction. Never aliased with committed history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub role: ChatRole,
    pub content: String,
    pub steps: Vec<String>,
    pub links: Vec<ChatLink>,
    /// Remote message id, stable across the deltas of one message.
    pub id: Option<String>,
}

impl PendingMessage {
    pub fn new(role: ChatRole) -> Self {
        Self {
            role,
            content: String::new(),
            steps: Vec::new(),
            links: Vec::new(),
            id: None,
        }
    }

    /// Content concatenates; steps and links append.
    pub fn merge(&mut self, delta: MessageDelta, id: Option<&str>) {
        if let Some(role) = delta.role {
            self.role = role;
        }
        if let Some(content) = delta.content {
            self.content.push_str(&content);
        }
        if let Some(steps) = delta.steps {
            self.steps.extend(steps);
        }
        if let Some(links) = delta.links {
            self.links.extend(links);
        }
        if self.id.is_none() {
            self.id = id.map(str::to_string);
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// Promotes to a committed message, trimmed of surrounding whitespace.
    pub fn finish(self, stage: &'static str) -> ChatResult<ChatMessage> {
        ensure!(
            self.has_content(),
            IncompleteMessageSnafu {
                stage,
                missing: "content",
            }
        );

        let mut message = ChatMessage::new(self.role, self.content.trim());
        if !self.steps.is_empty() {
            message.steps = Some(self.steps);
        }
        if !self.links.is_empty() {
            message.links = Some(self.links);
        }
        Ok(message)
    }
}

/// Partial edit applied to a committed history entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub role: Option<ChatRole>,
    pub content: Option<String>,
    pub steps: Option<Vec<String>>,
    pub links: Option<Vec<ChatLink>>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn apply(self, message: &mut ChatMessage) {
        if let Some(role) = self.role {
            message.role = role;
        }
        if let Some(content) = self.content {
            message.content = content;
        }
        if let Some(steps) = self.steps {
            message.steps = Some(steps);
        }
        if let Some(links) = self.links {
            message.links = Some(links);
        }
    }
}
