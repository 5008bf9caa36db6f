use chorus_llm::{
    ApiResult, CancellationToken, ChatApi, ChatMessage, ChatRole, Params, SendOptions,
    delta_channel,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;

const QUOTE_CHARACTERS: &[char] = &[
    '"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{300C}', '\u{300D}',
    '\u{300A}', '\u{300B}',
];

/// When and how conversation titles are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleSettings {
    pub enabled: bool,
    /// Titles are generated only while `min_history < len < max_history`.
    pub min_history: usize,
    pub max_history: usize,
    /// Per-message character cap inside the title prompt.
    pub excerpt_chars: usize,
    /// Word count of locally synthesized titles.
    pub local_words: usize,
}

impl Default for TitleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_history: 3,
            max_history: 10,
            excerpt_chars: 100,
            local_words: 5,
        }
    }
}

impl TitleSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Runs the side exchange that names a conversation.
#[derive(Debug, Clone, Default)]
pub struct TitleGenerator {
    settings: TitleSettings,
}

impl TitleGenerator {
    pub fn new(settings: TitleSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TitleSettings {
        &self.settings
    }

    pub fn should_generate(&self, history_len: usize) -> bool {
        self.settings.enabled
            && history_len > self.settings.min_history
            && history_len < self.settings.max_history
    }

    pub fn build_prompt(&self, history: &[ChatMessage]) -> String {
        let transcript = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| {
                let speaker = match message.role {
                    ChatRole::User => "User",
                    ChatRole::Assistant => "Assistant",
                    ChatRole::System => "System",
                };
                format!(
                    "{speaker}: {}",
                    excerpt(message.content.trim(), self.settings.excerpt_chars)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Give the conversation below a short name of a few words, written in the language \
             the conversation uses. Reply with the name only, without quotes or trailing \
             punctuation.\n\nConversation:\n{transcript}"
        )
    }

    /// Produces a cleaned title. Never touches the primary conversation's history or session.
    pub async fn generate(
        &self,
        api: &ChatApi,
        history: &[ChatMessage],
        params: Params,
        cancel: &CancellationToken,
    ) -> ApiResult<String> {
        if api.is_highly_rate_limited() {
            // Keeps the result asynchronous even when no request is made.
            tokio::task::yield_now().await;
            return Ok(self.local_title(history));
        }

        let prompt = self.build_prompt(history);
        let (sink, mut deltas) = delta_channel();
        let options = SendOptions::new(cancel.child_token(), sink).with_params(params);

        let raw = match api {
            ChatApi::Completion(api) => {
                api.send_conversation(vec![ChatMessage::user(prompt)], options)
                    .await?;
                collect_reply(&mut deltas)
            }
            ChatApi::Conversation(api) => {
                let scratch = api.clone_with_fresh_session();
                let sent = scratch.send_message(prompt, options).await;
                if scratch.supports_session_deletion()
                    && let Err(error) = scratch.delete_session().await
                {
                    tracing::debug!(
                        endpoint_id = %scratch.info().endpoint_id,
                        error = %error,
                        "failed to delete title session"
                    );
                }
                sent?;
                collect_reply(&mut deltas)
            }
        };

        Ok(clean_title(&raw))
    }

    /// First few words of the most recent message.
    pub fn local_title(&self, history: &[ChatMessage]) -> String {
        let Some(last) = history.last() else {
            return String::new();
        };
        let words = last
            .content
            .split_whitespace()
            .take(self.settings.local_words)
            .collect::<Vec<_>>()
            .join(" ");
        clean_title(&words)
    }
}

/// Strips wrapping quotes and one trailing period from a model reply.
pub fn clean_title(raw: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or_default().trim();
    let unquoted = first_line.trim_matches(QUOTE_CHARACTERS).trim();
    let unpunctuated = unquoted
        .strip_suffix('.')
        .or_else(|| unquoted.strip_suffix('\u{3002}'))
        .unwrap_or(unquoted);
    unpunctuated.trim().to_string()
}

fn excerpt(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

fn collect_reply(deltas: &mut UnboundedReceiver<chorus_llm::StreamDelta>) -> String {
    let mut reply = String::new();
    while let Ok(item) = deltas.try_recv() {
        if let Some(content) = item.delta.content {
            reply.push_str(&content);
        }
    }
    reply
}
