use futures::StreamExt;
use rig::completion::{CompletionError, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::ensure;

use super::api::{ApiInfo, BoxFuture, CompletionApi, SendOptions};
use super::endpoint::{ApiEndpoint, DEFAULT_OPENAI_MODEL};
use super::error::{ApiError, ApiResult, MissingApiKeySnafu, RecoveryHint};
use super::message::{ChatMessage, ChatRole, MessageDelta, Params, ResponseEnvelope};

pub const RIG_OPENAI_API_TYPE: &str = "openai";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Completion adapter for OpenAI-compatible endpoints, streamed through Rig.
pub struct RigCompletionApi {
    endpoint: ApiEndpoint,
    info: ApiInfo,
}

impl RigCompletionApi {
    pub fn new(endpoint: ApiEndpoint) -> ApiResult<Self> {
        ensure!(
            !endpoint.key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                endpoint_id: endpoint.id.clone(),
            }
        );

        let info = endpoint.info();
        Ok(Self { endpoint, info })
    }

    fn build_client(endpoint: &ApiEndpoint) -> ApiResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(endpoint.key.as_str());
        if !endpoint.url.is_empty() {
            builder = builder.base_url(endpoint.url.as_str());
        }
        builder
            .build()
            .map_err(|source| ApiError::network("build-client", source.to_string()))
    }

    /// Endpoint defaults overlaid with the per-call snapshot.
    fn effective_params(&self, overrides: &Params) -> Params {
        let mut params = self.endpoint.params.clone();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        params
    }

    fn model_id(params: &Params) -> String {
        params
            .get("model")
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or(DEFAULT_OPENAI_MODEL)
            .to_string()
    }

    fn to_rig_message(message: &ChatMessage) -> Option<RigMessage> {
        match message.role {
            ChatRole::System => None,
            ChatRole::User => Some(RigMessage::user(message.content.clone())),
            ChatRole::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(params: &Params, history: &[ChatMessage]) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = params.get("preamble").and_then(|value| value.as_str())
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.to_string());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it.
        for message in history {
            if matches!(message.role, ChatRole::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        &self,
        history: &[ChatMessage],
        params: &Params,
    ) -> ApiResult<RigStreamingResponse> {
        let client = Self::build_client(&self.endpoint)?;
        let model_id = Self::model_id(params);
        let model = client.completion_model(model_id.clone());

        let mut messages = history
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                endpoint_id = %self.endpoint.id,
                model_id = %model_id,
                history_len = history.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return Err(ApiError::api(
                "open-stream-filter-messages",
                "conversation has no user or assistant messages",
            ));
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(params, history) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = params.get("temperature").and_then(|value| value.as_f64()) {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = params.get("max_tokens").and_then(|value| value.as_u64()) {
            builder = builder.max_tokens(max_tokens);
        }

        builder
            .stream()
            .await
            .map_err(|source| Self::classify_error("open-stream", source))
    }

    fn classify_error(stage: &'static str, source: CompletionError) -> ApiError {
        match source {
            CompletionError::ProviderError(message) | CompletionError::ResponseError(message) => {
                let hint = recovery_hint_for(&message);
                let error = ApiError::api(stage, message);
                match hint {
                    Some(hint) => error.with_hint(hint),
                    None => error,
                }
            }
            other => ApiError::network(stage, other.to_string()),
        }
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<MessageDelta>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                Some(MessageDelta::text(text.text))
            }
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Whole reasoning blocks become one step; fragments are not surfaced.
                let text = reasoning.reasoning.join("");
                if text.trim().is_empty() {
                    return None;
                }
                Some(MessageDelta::default().with_steps(vec![text]))
            }
            StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream(&self, history: Vec<ChatMessage>, options: SendOptions) -> ApiResult<()> {
        let params = self.effective_params(&options.params);
        let mut stream = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                return Err(ApiError::aborted("open-stream-cancelled"));
            }
            opened = self.open_stream(&history, &params) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        endpoint_id = %self.endpoint.id,
                        error = %error,
                        "failed to open completion stream"
                    );
                    return Err(error);
                }
            },
        };

        let mut progress = StreamProgress::default();
        loop {
            tokio::select! {
                _ = options.cancel.cancelled() => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(endpoint_id = %self.endpoint.id, "completion stream cancelled");
                    stream.cancel();
                    return Err(ApiError::aborted("stream-cancelled"));
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            let Some(mut delta) = Self::map_stream_item(item) else {
                                continue;
                            };
                            progress.observe(&mut delta);
                            if !options.sink.emit(delta, ResponseEnvelope::streaming()) {
                                stream.cancel();
                                return Err(ApiError::aborted("stream-receiver-dropped"));
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                endpoint_id = %self.endpoint.id,
                                error = %source,
                                "completion stream emitted an error chunk"
                            );
                            return Err(Self::classify_error("stream-chunk", source));
                        }
                        None => break,
                    }
                }
            }
        }

        match progress.terminal() {
            Some((delta, response)) => {
                options.sink.emit(delta, response);
            }
            None if progress.started => {
                // Left open so the engine reports the reply as closed without a message.
                tracing::debug!(
                    endpoint_id = %self.endpoint.id,
                    "completion stream ended without text"
                );
            }
            None => {}
        }
        Ok(())
    }
}

/// What a completion stream has produced so far.
#[derive(Debug, Default)]
struct StreamProgress {
    started: bool,
    has_text: bool,
}

impl StreamProgress {
    /// Stamps the assistant role on the first delta and notes visible text.
    fn observe(&mut self, delta: &mut MessageDelta) {
        if !self.started {
            delta.role = Some(ChatRole::Assistant);
            self.started = true;
        }
        if delta
            .content
            .as_deref()
            .is_some_and(|content| !content.trim().is_empty())
        {
            self.has_text = true;
        }
    }

    /// The completion signal, sent only for replies that carried text.
    fn terminal(&self) -> Option<(MessageDelta, ResponseEnvelope)> {
        self.has_text
            .then(|| (MessageDelta::default(), ResponseEnvelope::complete()))
    }
}

impl CompletionApi for RigCompletionApi {
    fn info(&self) -> &ApiInfo {
        &self.info
    }

    fn send_conversation(
        &self,
        history: Vec<ChatMessage>,
        options: SendOptions,
    ) -> BoxFuture<'_, ApiResult<()>> {
        Box::pin(self.run_stream(history, options))
    }
}

fn recovery_hint_for(message: &str) -> Option<RecoveryHint> {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("expired") {
        Some(RecoveryHint::CredentialsExpired)
    } else if lowered.contains("401")
        || lowered.contains("unauthorized")
        || lowered.contains("invalid_api_key")
    {
        Some(RecoveryHint::ReauthenticationRequired)
    } else {
        None
    }
}
