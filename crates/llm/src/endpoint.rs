use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::api::{ApiInfo, ChatApi};
use super::error::{ApiError, ApiResult};
use super::message::Params;
use super::rig_adapter::{RIG_OPENAI_API_TYPE, RigCompletionApi};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// User-configured remote endpoint, as stored in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub id: String,
    #[serde(rename = "type")]
    pub api_type: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl ApiEndpoint {
    pub fn new(
        id: impl Into<String>,
        api_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into().trim().to_string(),
            api_type: api_type.into().trim().to_string(),
            name: name.into().trim().to_string(),
            url: String::new(),
            key: String::new(),
            icon: None,
            params: Params::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into().trim().to_string();
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into().trim().to_string();
        self
    }

    pub fn info(&self) -> ApiInfo {
        let mut info = ApiInfo::new(&self.id, &self.name).with_params(self.params.clone());
        info.icon = self.icon.clone();
        info
    }
}

/// Builds the adapter for one endpoint.
pub fn create_api(mut endpoint: ApiEndpoint) -> ApiResult<ChatApi> {
    if endpoint.api_type.trim().is_empty() {
        endpoint.api_type = RIG_OPENAI_API_TYPE.to_string();
    }

    match endpoint.api_type.as_str() {
        "openai" | "rig-openai" | "chatgpt" => {
            endpoint.api_type = RIG_OPENAI_API_TYPE.to_string();
            Ok(ChatApi::Completion(Arc::new(RigCompletionApi::new(
                endpoint,
            )?)))
        }
        _ => Err(ApiError::UnsupportedApi {
            stage: "create-api",
            api_type: endpoint.api_type,
        }),
    }
}

/// Live adapters keyed by endpoint id, used to resolve persisted service records.
#[derive(Debug, Clone, Default)]
pub struct ApiRegistry {
    apis: BTreeMap<String, ChatApi>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiates every endpoint; endpoints that fail to build are skipped and logged.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = ApiEndpoint>) -> Self {
        let mut registry = Self::new();
        for endpoint in endpoints {
            let endpoint_id = endpoint.id.clone();
            match create_api(endpoint) {
                Ok(api) => registry.register(api),
                Err(error) => {
                    tracing::warn!(
                        endpoint_id = %endpoint_id,
                        error = %error,
                        "skipping endpoint that failed to initialize"
                    );
                }
            }
        }
        registry
    }

    pub fn register(&mut self, api: ChatApi) {
        self.apis.insert(api.endpoint_id().to_string(), api);
    }

    pub fn get(&self, endpoint_id: &str) -> Option<&ChatApi> {
        self.apis.get(endpoint_id)
    }

    pub fn endpoint_ids(&self) -> impl Iterator<Item = &str> {
        self.apis.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }
}
