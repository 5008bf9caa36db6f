//! Scripted adapters for driving services deterministically in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chorus_llm::{
    ApiError, ApiInfo, ApiResult, BoxFuture, ChatMessage, ChatRole, CompletionApi,
    ConversationApi, MessageDelta, ResponseEnvelope, SendOptions,
};
use tokio::sync::Notify;

#[derive(Clone)]
pub(crate) enum Step {
    Delta(MessageDelta, ResponseEnvelope),
    Fail(ApiError),
    /// Blocks until the exchange is cancelled, then reports an abort.
    WaitForCancel,
    /// Blocks until notified; cancellation still ends the call.
    Wait(Arc<Notify>),
}

/// A complete single-delta answer.
pub(crate) fn reply(text: &str) -> Vec<Step> {
    vec![Step::Delta(
        MessageDelta::role(ChatRole::Assistant).with_content(text),
        ResponseEnvelope::complete(),
    )]
}

pub(crate) fn streaming(delta: MessageDelta) -> Step {
    Step::Delta(delta, ResponseEnvelope::streaming())
}

pub(crate) fn terminal(delta: MessageDelta) -> Step {
    Step::Delta(delta, ResponseEnvelope::complete())
}

async fn play(steps: Vec<Step>, options: SendOptions) -> ApiResult<()> {
    for step in steps {
        match step {
            Step::Delta(delta, response) => {
                options.sink.emit(delta, response);
                tokio::task::yield_now().await;
            }
            Step::Fail(error) => return Err(error),
            Step::WaitForCancel => {
                options.cancel.cancelled().await;
                return Err(ApiError::aborted("scripted-cancelled"));
            }
            Step::Wait(gate) => {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = options.cancel.cancelled() => {
                        return Err(ApiError::aborted("scripted-cancelled"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ScriptedCompletionApi {
    info: ApiInfo,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    rate_limited: bool,
}

impl ScriptedCompletionApi {
    pub(crate) fn new(endpoint_id: &str) -> Self {
        Self {
            info: ApiInfo::new(endpoint_id, endpoint_id),
            scripts: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            rate_limited: false,
        }
    }

    pub(crate) fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }

    /// Queues the steps played by the next call. Calls without a script stream nothing.
    pub(crate) fn push_script(&self, steps: Vec<Step>) {
        lock(&self.scripts).push_back(steps);
    }

    pub(crate) fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls).clone()
    }
}

impl CompletionApi for ScriptedCompletionApi {
    fn info(&self) -> &ApiInfo {
        &self.info
    }

    fn send_conversation(
        &self,
        history: Vec<ChatMessage>,
        options: SendOptions,
    ) -> BoxFuture<'_, ApiResult<()>> {
        lock(&self.calls).push(history);
        let steps = lock(&self.scripts).pop_front().unwrap_or_default();
        Box::pin(play(steps, options))
    }

    fn is_highly_rate_limited(&self) -> bool {
        self.rate_limited
    }
}

/// State shared by a conversation adapter and every session forked from it.
#[derive(Default)]
pub(crate) struct ConversationScript {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    sent: Mutex<Vec<(usize, String)>>,
    removed: Mutex<Vec<(usize, usize)>>,
    deleted: Mutex<Vec<usize>>,
    removal_failure: Mutex<Option<ApiError>>,
    resets: AtomicUsize,
    sessions: AtomicUsize,
    can_regenerate: bool,
    session_deletion: bool,
}

impl ConversationScript {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn regenerating() -> Arc<Self> {
        Arc::new(Self {
            can_regenerate: true,
            ..Self::default()
        })
    }

    pub(crate) fn deleting() -> Arc<Self> {
        Arc::new(Self {
            session_deletion: true,
            ..Self::default()
        })
    }

    pub(crate) fn push_script(&self, steps: Vec<Step>) {
        lock(&self.scripts).push_back(steps);
    }

    /// Makes the next remote truncation fail with `error`.
    pub(crate) fn fail_next_removal(&self, error: ApiError) {
        *lock(&self.removal_failure) = Some(error);
    }

    /// `(session, text)` for every message sent, in order.
    pub(crate) fn sent(&self) -> Vec<(usize, String)> {
        lock(&self.sent).clone()
    }

    /// `(session, index)` for every remote truncation.
    pub(crate) fn removed(&self) -> Vec<(usize, usize)> {
        lock(&self.removed).clone()
    }

    pub(crate) fn deleted_sessions(&self) -> Vec<usize> {
        lock(&self.deleted).clone()
    }

    pub(crate) fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedConversationApi {
    info: ApiInfo,
    script: Arc<ConversationScript>,
    session: usize,
}

impl ScriptedConversationApi {
    /// The primary adapter uses session 0; forks get increasing ids.
    pub(crate) fn new(endpoint_id: &str, script: Arc<ConversationScript>) -> Self {
        Self {
            info: ApiInfo::new(endpoint_id, endpoint_id),
            script,
            session: 0,
        }
    }

    pub(crate) fn session(&self) -> usize {
        self.session
    }
}

impl ConversationApi for ScriptedConversationApi {
    fn info(&self) -> &ApiInfo {
        &self.info
    }

    fn send_message(&self, text: String, options: SendOptions) -> BoxFuture<'_, ApiResult<()>> {
        lock(&self.script.sent).push((self.session, text));
        let steps = lock(&self.script.scripts).pop_front().unwrap_or_default();
        Box::pin(play(steps, options))
    }

    fn clone_with_fresh_session(&self) -> Arc<dyn ConversationApi> {
        Arc::new(Self {
            info: self.info.clone(),
            script: Arc::clone(&self.script),
            session: self.script.sessions.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    fn can_regenerate(&self) -> bool {
        self.script.can_regenerate
    }

    fn remove_messages_after(&self, index: usize) -> BoxFuture<'_, ApiResult<()>> {
        if let Some(error) = lock(&self.script.removal_failure).take() {
            return Box::pin(async move { Err(error) });
        }
        lock(&self.script.removed).push((self.session, index));
        Box::pin(async { Ok(()) })
    }

    fn reset_session(&self) {
        self.script.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn supports_session_deletion(&self) -> bool {
        self.script.session_deletion
    }

    fn delete_session(&self) -> BoxFuture<'_, ApiResult<()>> {
        lock(&self.script.deleted).push(self.session);
        Box::pin(async { Ok(()) })
    }
}
