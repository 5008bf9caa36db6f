use chorus_llm::{ChatMessage, Params};
use chorus_storage::Moment;
use serde::{Deserialize, Serialize};

/// Presentation and call configuration shared by a service and, for collections, its children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceShape {
    pub name: String,
    pub icon: Option<String>,
    pub api_params: Params,
    pub params: Params,
}

impl ServiceShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Blob stored under a conversation's moment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// Persisted form of a single-conversation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatServiceRecord {
    pub name: String,
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moment: Option<Moment>,
}

/// One child entry of a persisted conversation collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moment: Option<Moment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

/// Persisted form of a conversation collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiChatsServiceRecord {
    pub name: String,
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_params: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    pub chats: Vec<ChatRecord>,
}

/// Either kind of service, as listed in the services file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceRecord {
    // Tried first: a collection record also parses as a single-chat record.
    Multi(MultiChatsServiceRecord),
    Single(ChatServiceRecord),
}

impl ServiceRecord {
    pub fn name(&self) -> &str {
        match self {
            Self::Multi(record) => &record.name,
            Self::Single(record) => &record.name,
        }
    }

    pub fn api(&self) -> &str {
        match self {
            Self::Multi(record) => &record.api,
            Self::Single(record) => &record.api,
        }
    }
}

pub(crate) fn non_empty(params: &Params) -> Option<Params> {
    if params.is_empty() {
        None
    } else {
        Some(params.clone())
    }
}
