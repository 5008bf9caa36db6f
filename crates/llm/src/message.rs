use serde::{Deserialize, Serialize};

/// Free-form parameter map shared by endpoints, services and per-call overrides.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A named reference attached to an answer (citations, search results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLink {
    pub name: String,
    pub url: String,
}

impl ChatLink {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// One committed chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<ChatLink>>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            steps: None,
            links: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_links(mut self, links: Vec<ChatLink>) -> Self {
        self.links = Some(links);
        self
    }
}

/// Incremental fragment of an in-progress message.
///
/// Only the first delta of a message is required to carry a role; `content` is
/// concatenated while `steps` and `links` are appended.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<ChatLink>>,
}

impl MessageDelta {
    pub fn role(role: ChatRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: ChatRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_links(mut self, links: Vec<ChatLink>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.as_deref().is_none_or(str::is_empty)
            && self.steps.as_ref().is_none_or(Vec::is_empty)
            && self.links.as_ref().is_none_or(Vec::is_empty)
    }
}

/// Per-delta response metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// More deltas follow for the current message; `false` is the completion signal.
    pub pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub filtered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_replies: Option<Vec<String>>,
    /// Set on the terminal envelope when the caller cancelled the exchange.
    #[serde(default)]
    pub aborted: bool,
}

impl ResponseEnvelope {
    pub fn streaming() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    pub fn complete() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_suggested_replies(mut self, replies: Vec<String>) -> Self {
        self.suggested_replies = Some(replies);
        self
    }

    pub fn filtered(mut self) -> Self {
        self.filtered = true;
        self
    }

    pub fn aborted(mut self) -> Self {
        self.aborted = true;
        self
    }
}
