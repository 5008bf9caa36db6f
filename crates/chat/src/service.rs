use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chorus_llm::{
    ApiError, ApiRegistry, CancellationToken, ChatApi, ChatMessage, ChatRole, Params,
    ResponseEnvelope, SendOptions, StreamDelta, delta_channel,
};
use chorus_storage::{HistoryKeeper, Moment};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::error::{
    ChatError, ChatResult, EmptyHistorySnafu, IndexOutOfRangeSnafu, MissingRoleSnafu,
    NothingToRegenerateSnafu, RegenerateRootSnafu, RemoteSessionSnafu, SendWhilePendingSnafu,
    ServiceDestroyedSnafu, UnknownApiSnafu,
};
use crate::events::ChatEvent;
use crate::pending::{ExchangePhase, MessagePatch, PendingMessage};
use crate::record::{ChatServiceRecord, HistoryBlob, ServiceShape, non_empty};
use crate::title::{TitleGenerator, TitleSettings};

const EVENT_CAPACITY: usize = 1024;

/// The single in-flight title generation of a service.
#[derive(Clone)]
struct TitleJob {
    task: Shared<BoxFuture<'static, ()>>,
    handle: AbortHandle,
    cancel: CancellationToken,
}

impl TitleJob {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Everything needed to build a [`ChatService`].
pub struct ChatServiceOptions {
    pub shape: ServiceShape,
    pub api: ChatApi,
    pub keeper: Arc<dyn HistoryKeeper>,
    /// Persisted history to rehydrate lazily on first use.
    pub moment: Option<Moment>,
    pub title: Option<String>,
    pub title_settings: TitleSettings,
}

impl ChatServiceOptions {
    pub fn new(name: impl Into<String>, api: ChatApi, keeper: Arc<dyn HistoryKeeper>) -> Self {
        Self {
            shape: ServiceShape::new(name),
            api,
            keeper,
            moment: None,
            title: None,
            title_settings: TitleSettings::default(),
        }
    }

    pub fn with_shape(mut self, shape: ServiceShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_moment(mut self, moment: Option<Moment>) -> Self {
        self.moment = moment;
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_title_settings(mut self, title_settings: TitleSettings) -> Self {
        self.title_settings = title_settings;
        self
    }
}

/// One conversation: history, the in-flight exchange, title and persistence.
///
/// Cloning yields another handle to the same conversation.
#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatServiceInner>,
}

struct ChatServiceInner {
    api: ChatApi,
    keeper: Arc<dyn HistoryKeeper>,
    titles: TitleGenerator,
    events: broadcast::Sender<ChatEvent>,
    state: Mutex<ChatState>,
    // Serializes blob loads and saves so the newest snapshot is written last.
    store_gate: tokio::sync::Mutex<()>,
}

struct ChatState {
    shape: ServiceShape,
    history: Vec<ChatMessage>,
    phase: ExchangePhase,
    pending_message: Option<PendingMessage>,
    /// A message was committed during the current exchange.
    answered: bool,
    moment: Option<Moment>,
    loaded: bool,
    last_error: Option<ApiError>,
    title: Option<String>,
    custom_title: Option<String>,
    cancel: CancellationToken,
    last_exchange_aborted: bool,
    title_job: Option<TitleJob>,
    /// Bumped by `clear`; generations started under an older epoch are discarded.
    title_epoch: u64,
    title_cancel: CancellationToken,
    destroyed: bool,
}

impl ChatState {
    fn ensure_ready(&self, stage: &'static str) -> ChatResult<()> {
        ensure!(!self.destroyed, ServiceDestroyedSnafu { stage });
        ensure!(self.phase.is_idle(), SendWhilePendingSnafu { stage });
        Ok(())
    }

    fn begin_exchange(&mut self) -> CancellationToken {
        self.phase = ExchangePhase::Streaming;
        self.pending_message = None;
        self.answered = false;
        self.last_error = None;
        self.last_exchange_aborted = false;
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    fn is_title_running(&self) -> bool {
        self.title_job.as_ref().is_some_and(TitleJob::is_running)
    }

    fn blob(&self) -> HistoryBlob {
        HistoryBlob {
            title: self.title.clone(),
            custom_title: self.custom_title.clone(),
            history: self.history.clone(),
        }
    }
}

struct ExchangeOutcome {
    result: Result<(), ApiError>,
    violation: Option<ChatError>,
}

impl ChatService {
    pub fn new(options: ChatServiceOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let loaded = options.moment.is_none();
        let state = ChatState {
            shape: options.shape,
            history: Vec::new(),
            phase: ExchangePhase::Idle,
            pending_message: None,
            answered: false,
            moment: options.moment,
            loaded,
            last_error: None,
            title: options.title,
            custom_title: None,
            cancel: CancellationToken::new(),
            last_exchange_aborted: false,
            title_job: None,
            title_epoch: 0,
            title_cancel: CancellationToken::new(),
            destroyed: false,
        };

        Self {
            inner: Arc::new(ChatServiceInner {
                api: options.api,
                keeper: options.keeper,
                titles: TitleGenerator::new(options.title_settings),
                events,
                state: Mutex::new(state),
                store_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Restores a service from its record, driving a fresh instance of the registered API.
    pub fn from_record(
        record: &ChatServiceRecord,
        registry: &ApiRegistry,
        keeper: Arc<dyn HistoryKeeper>,
        title_settings: TitleSettings,
    ) -> ChatResult<Self> {
        let api = registry.get(&record.api).context(UnknownApiSnafu {
            stage: "chat-service-from-record",
            endpoint_id: record.api.clone(),
        })?;

        let shape = ServiceShape {
            name: record.name.clone(),
            icon: record.icon.clone(),
            api_params: record.api_params.clone().unwrap_or_default(),
            params: record.params.clone().unwrap_or_default(),
        };
        Ok(Self::new(
            ChatServiceOptions::new(record.name.clone(), api.fork(), keeper)
                .with_shape(shape)
                .with_moment(record.moment.clone())
                .with_title_settings(title_settings),
        ))
    }

    pub fn to_record(&self) -> ChatServiceRecord {
        let state = self.state();
        ChatServiceRecord {
            name: state.shape.name.clone(),
            api: self.inner.api.endpoint_id().to_string(),
            icon: state.shape.icon.clone(),
            api_params: non_empty(&state.shape.api_params),
            params: non_empty(&state.shape.params),
            moment: state.moment.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.inner.events.subscribe()
    }

    pub fn same_service(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn api(&self) -> &ChatApi {
        &self.inner.api
    }

    pub fn shape(&self) -> ServiceShape {
        self.state().shape.clone()
    }

    pub fn name(&self) -> String {
        self.state().shape.name.clone()
    }

    pub fn icon(&self) -> Option<String> {
        self.state().shape.icon.clone()
    }

    pub fn api_params(&self) -> Params {
        self.state().shape.api_params.clone()
    }

    pub fn params(&self) -> Params {
        self.state().shape.params.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.update_shape(|shape| replace_if_changed(&mut shape.name, name))
    }

    pub fn set_icon(&self, icon: Option<String>) -> bool {
        self.update_shape(|shape| replace_if_changed(&mut shape.icon, icon))
    }

    /// Takes effect from the next exchange; an in-flight call keeps its snapshot.
    pub fn set_api_params(&self, api_params: Params) -> bool {
        self.update_shape(|shape| replace_if_changed(&mut shape.api_params, api_params))
    }

    pub fn set_params(&self, params: Params) -> bool {
        self.update_shape(|shape| replace_if_changed(&mut shape.params, params))
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.state().history.clone()
    }

    pub fn pending_message(&self) -> Option<PendingMessage> {
        self.state().pending_message.clone()
    }

    pub fn phase(&self) -> ExchangePhase {
        self.state().phase
    }

    pub fn is_pending(&self) -> bool {
        !self.phase().is_idle()
    }

    pub fn last_error(&self) -> Option<ApiError> {
        self.state().last_error.clone()
    }

    /// Whether the most recent exchange was stopped by [`ChatService::abort`].
    pub fn last_exchange_aborted(&self) -> bool {
        self.state().last_exchange_aborted
    }

    /// Custom title if set, otherwise the generated one.
    pub fn title(&self) -> Option<String> {
        let state = self.state();
        state.custom_title.clone().or_else(|| state.title.clone())
    }

    pub fn generated_title(&self) -> Option<String> {
        self.state().title.clone()
    }

    pub fn custom_title(&self) -> Option<String> {
        self.state().custom_title.clone()
    }

    pub fn moment(&self) -> Option<Moment> {
        self.state().moment.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().loaded
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    pub fn is_title_generating(&self) -> bool {
        self.state().is_title_running()
    }

    /// Sets or clears the user-chosen title. Generated titles never replace it.
    pub async fn set_custom_title(&self, title: Option<String>) {
        self.load().await;
        let title = title
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty());
        let changed = replace_if_changed(&mut self.state().custom_title, title);
        if changed {
            self.emit(ChatEvent::TitleChanged(self.title()));
            self.persist().await;
        }
    }

    /// Rehydrates history from the keeper. Runs once; later calls return immediately.
    pub async fn load(&self) {
        if self.state().loaded {
            return;
        }

        let _gate = self.inner.store_gate.lock().await;
        let moment = {
            let state = self.state();
            if state.loaded {
                return;
            }
            state.moment.clone()
        };

        let blob = match moment {
            Some(moment) => self.remember(&moment).await,
            None => None,
        };

        let title = {
            let mut state = self.state();
            state.loaded = true;
            let Some(blob) = blob else {
                return;
            };
            if state.history.is_empty() {
                state.history = blob.history;
            }
            // The stored blob is authoritative over a title cached in a record.
            state.title = blob.title;
            if state.custom_title.is_none() {
                state.custom_title = blob.custom_title;
            }
            state.custom_title.clone().or_else(|| state.title.clone())
        };
        if title.is_some() {
            self.emit(ChatEvent::TitleChanged(title));
        }
    }

    async fn remember(&self, moment: &Moment) -> Option<HistoryBlob> {
        let value = match self.inner.keeper.remember(moment).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(moment = %moment, error = %error, "failed to load chat history");
                return None;
            }
        };
        match serde_json::from_value(value) {
            Ok(blob) => Some(blob),
            Err(error) => {
                tracing::warn!(moment = %moment, error = %error, "ignoring malformed chat history");
                None
            }
        }
    }

    /// Writes the history blob, assigning a moment on first save. Failures are logged.
    pub async fn persist(&self) {
        let _gate = self.inner.store_gate.lock().await;
        self.persist_gated().await;
    }

    /// Body of [`ChatService::persist`]; the caller holds `store_gate`.
    async fn persist_gated(&self) {
        let (moment, blob, assigned) = {
            let mut state = self.state();
            if state.destroyed || !state.loaded {
                return;
            }
            let assigned = state.moment.is_none();
            let moment = state
                .moment
                .get_or_insert_with(|| self.inner.keeper.new_key())
                .clone();
            (moment, state.blob(), assigned)
        };

        if assigned {
            self.emit(ChatEvent::MomentAssigned(moment.clone()));
        }

        let value = match serde_json::to_value(&blob) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(moment = %moment, error = %error, "failed to encode chat history");
                return;
            }
        };
        if let Err(error) = self.inner.keeper.save(&moment, value).await {
            tracing::warn!(moment = %moment, error = %error, "failed to persist chat history");
        }
    }

    /// Deletes the persisted blob, if one was ever written.
    pub async fn forget_history(&self) {
        let Some(moment) = self.moment() else {
            return;
        };
        let _gate = self.inner.store_gate.lock().await;
        if let Err(error) = self.inner.keeper.forget(&moment).await {
            tracing::warn!(moment = %moment, error = %error, "failed to forget chat history");
        }
    }

    /// Appends `message` and runs one exchange.
    ///
    /// Network and remote failures resolve to `Ok` and land in [`ChatService::last_error`];
    /// only state and protocol violations are returned.
    pub async fn send_message(&self, message: ChatMessage) -> ChatResult<()> {
        self.load().await;
        let cancel = {
            let mut state = self.state();
            state.ensure_ready("send-message")?;
            state.history.push(message.clone());
            state.begin_exchange()
        };

        self.emit(ChatEvent::UserMessage(message));
        self.persist().await;
        self.emit(ChatEvent::MessageBegin);
        self.run_exchange(cancel).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> ChatResult<()> {
        self.send_message(ChatMessage::user(text)).await
    }

    /// Re-asks the last question. A trailing user message is resent as is; a trailing
    /// answer is dropped first, which needs [`ChatService::can_regenerate_from`].
    pub async fn regenerate_last_response(&self) -> ChatResult<()> {
        let stage = "regenerate-last-response";
        self.load().await;
        let cancel = {
            let mut state = self.state();
            state.ensure_ready(stage)?;
            let last_role = state
                .history
                .last()
                .map(|message| message.role)
                .context(EmptyHistorySnafu { stage })?;
            match last_role {
                ChatRole::User => Some(state.begin_exchange()),
                ChatRole::Assistant => None,
                ChatRole::System => {
                    return NothingToRegenerateSnafu {
                        stage,
                        details: "the last message is a system message",
                    }
                    .fail();
                }
            }
        };

        match cancel {
            Some(cancel) => {
                self.emit(ChatEvent::MessageBegin);
                self.run_exchange(cancel).await
            }
            None => self.regenerate_from(-1).await,
        }
    }

    /// Drops the message at `index` and everything after it, then reruns the exchange.
    /// Negative indices count from the end.
    pub async fn regenerate_from(&self, index: isize) -> ChatResult<()> {
        let stage = "regenerate-from";
        self.load().await;
        let start = {
            let mut state = self.state();
            state.ensure_ready(stage)?;
            let start = regenerate_start(&state.history, index, stage)?;
            ensure!(
                self.adapter_can_regenerate(),
                NothingToRegenerateSnafu {
                    stage,
                    details: "the remote session cannot drop answers",
                }
            );
            // Busy while the remote session trims; the exchange begins only once it has.
            state.phase = ExchangePhase::Finalizing;
            start
        };

        if let Err(error) = self.trim_remote(start).await {
            self.state().phase = ExchangePhase::Idle;
            return Err(error).context(RemoteSessionSnafu { stage });
        }

        let cancel = {
            let mut state = self.state();
            state.history.truncate(start);
            state.begin_exchange()
        };
        self.emit(ChatEvent::HistoryRemoved { from_index: start });
        self.persist().await;
        self.emit(ChatEvent::MessageBegin);
        self.run_exchange(cancel).await
    }

    /// Whether [`ChatService::regenerate_from`] would accept `index` right now.
    pub fn can_regenerate_from(&self, index: isize) -> bool {
        let state = self.state();
        state.ensure_ready("can-regenerate-from").is_ok()
            && regenerate_start(&state.history, index, "can-regenerate-from").is_ok()
            && self.adapter_can_regenerate()
    }

    /// Removes the entry at `index` and everything after it, remotely too for session APIs.
    pub async fn remove_messages_after(&self, index: usize) -> ChatResult<()> {
        let stage = "remove-messages-after";
        self.load().await;
        {
            let mut state = self.state();
            state.ensure_ready(stage)?;
            let len = state.history.len();
            ensure!(
                index < len,
                IndexOutOfRangeSnafu {
                    stage,
                    index: isize::try_from(index).unwrap_or(isize::MAX),
                    len,
                }
            );
            // Busy while the remote session trims.
            state.phase = ExchangePhase::Finalizing;
        }

        let trimmed = self.trim_remote(index).await;
        {
            let mut state = self.state();
            state.phase = ExchangePhase::Idle;
            if trimmed.is_ok() {
                state.history.truncate(index);
            }
        }
        trimmed.context(RemoteSessionSnafu { stage })?;

        self.emit(ChatEvent::HistoryRemoved { from_index: index });
        self.persist().await;
        Ok(())
    }

    /// Cancels the in-flight exchange. Idempotent; cleanup happens on the exchange's own path.
    pub fn abort(&self) {
        self.state().cancel.cancel();
    }

    /// Wipes history, error and titles, and deletes the persisted blob. The moment is kept.
    /// A title still being generated is cancelled and never applied.
    pub async fn clear(&self) -> ChatResult<()> {
        self.load().await;
        let moment = {
            let mut state = self.state();
            state.ensure_ready("clear")?;
            state.history.clear();
            state.pending_message = None;
            state.last_error = None;
            state.title = None;
            state.custom_title = None;
            state.title_epoch += 1;
            if let Some(job) = &state.title_job {
                job.cancel.cancel();
            }
            state.moment.clone()
        };

        if let ChatApi::Conversation(api) = &self.inner.api {
            api.reset_session();
        }
        self.emit(ChatEvent::HistoryCleared);
        self.emit(ChatEvent::TitleChanged(None));

        if let Some(moment) = moment {
            let _gate = self.inner.store_gate.lock().await;
            if let Err(error) = self.inner.keeper.forget(&moment).await {
                tracing::warn!(moment = %moment, error = %error, "failed to forget cleared history");
            }
        }
        Ok(())
    }

    /// Edits a committed entry in place. No request is made.
    pub async fn update_message(&self, patch: MessagePatch, index: usize) -> ChatResult<()> {
        let stage = "update-message";
        self.load().await;
        let message = {
            let mut state = self.state();
            state.ensure_ready(stage)?;
            let len = state.history.len();
            let message = state.history.get_mut(index).context(IndexOutOfRangeSnafu {
                stage,
                index: isize::try_from(index).unwrap_or(isize::MAX),
                len,
            })?;
            patch.apply(message);
            message.clone()
        };

        self.emit(ChatEvent::MessageUpdated { index, message });
        self.persist().await;
        Ok(())
    }

    /// Aborts any work in flight and stops all further persistence.
    pub fn destroy(&self) {
        let mut state = self.state();
        state.destroyed = true;
        state.cancel.cancel();
        state.title_cancel.cancel();
    }

    /// Resolves once the running title generation, if any, has finished.
    pub async fn wait_for_title(&self) {
        let task = self.state().title_job.as_ref().map(|job| job.task.clone());
        if let Some(task) = task {
            task.await;
        }
    }

    async fn run_exchange(&self, cancel: CancellationToken) -> ChatResult<()> {
        let title_task = self.state().title_job.as_ref().map(|job| job.task.clone());
        if let Some(task) = title_task {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        }

        let outcome = if cancel.is_cancelled() {
            ExchangeOutcome {
                result: Err(ApiError::aborted("exchange-cancelled-before-send")),
                violation: None,
            }
        } else {
            self.drive_adapter(&cancel).await
        };
        self.finish_exchange(&cancel, outcome).await
    }

    async fn drive_adapter(&self, cancel: &CancellationToken) -> ExchangeOutcome {
        let (history, api_params) = {
            let state = self.state();
            (state.history.clone(), state.shape.api_params.clone())
        };
        // A child token lets a protocol violation stop the adapter without looking like an abort.
        let adapter_cancel = cancel.child_token();
        let (sink, mut deltas) = delta_channel();
        let options = SendOptions::new(adapter_cancel.clone(), sink).with_params(api_params);

        tracing::debug!(
            endpoint_id = %self.inner.api.endpoint_id(),
            history_len = history.len(),
            "starting chat exchange"
        );

        let mut send = match &self.inner.api {
            ChatApi::Completion(api) => api.send_conversation(history, options),
            ChatApi::Conversation(api) => {
                let text = history
                    .last()
                    .map(|message| message.content.clone())
                    .unwrap_or_default();
                api.send_message(text, options)
            }
        };

        let mut violation = None;
        let result = loop {
            tokio::select! {
                biased;
                Some(item) = deltas.recv() => {
                    self.accept_delta(item, &mut violation, &adapter_cancel);
                }
                result = &mut send => break result,
            }
        };
        while let Ok(item) = deltas.try_recv() {
            self.accept_delta(item, &mut violation, &adapter_cancel);
        }

        ExchangeOutcome { result, violation }
    }

    fn accept_delta(
        &self,
        item: StreamDelta,
        violation: &mut Option<ChatError>,
        adapter_cancel: &CancellationToken,
    ) {
        if violation.is_some() {
            return;
        }

        self.emit(ChatEvent::MessageDelta {
            delta: item.delta.clone(),
            response: item.response.clone(),
        });

        let committed = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.pending_message.is_none() {
                let Some(role) = item.delta.role else {
                    *violation = Some(MissingRoleSnafu { stage: "accept-delta" }.build());
                    adapter_cancel.cancel();
                    return;
                };
                state.pending_message = Some(PendingMessage::new(role));
            }
            let Some(pending) = state.pending_message.as_mut() else {
                return;
            };
            pending.merge(item.delta, item.response.id.as_deref());

            if item.response.pending {
                return;
            }
            let Some(pending) = state.pending_message.take() else {
                return;
            };
            match pending.finish("accept-terminal-delta") {
                Ok(message) => {
                    state.history.push(message.clone());
                    state.answered = true;
                    message
                }
                Err(error) => {
                    *violation = Some(error);
                    adapter_cancel.cancel();
                    return;
                }
            }
        };

        self.emit(ChatEvent::MessageEnd {
            message: Some(committed),
            response: item.response,
        });
    }

    async fn finish_exchange(
        &self,
        cancel: &CancellationToken,
        outcome: ExchangeOutcome,
    ) -> ChatResult<()> {
        let caller_aborted = cancel.is_cancelled();
        let ExchangeOutcome { result, violation } = outcome;

        let (closing, error) = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.phase = ExchangePhase::Finalizing;

            let had_content = state.answered
                || state
                    .pending_message
                    .as_ref()
                    .is_some_and(PendingMessage::has_content);
            let mut error = match result {
                Ok(()) => None,
                Err(_) if caller_aborted || violation.is_some() => None,
                Err(error) if error.is_abort() && had_content => None,
                Err(error) if error.is_abort() => Some(ApiError::ServerClosedConnection {
                    stage: "exchange-closed-before-content",
                }),
                Err(error) => Some(error),
            };

            // Streams that end without a terminal delta are closed out here.
            let mut closing = state.pending_message.take().map(|pending| {
                let id = pending.id.clone();
                let message = if violation.is_none() && pending.has_content() {
                    pending.finish("close-pending-message").ok()
                } else {
                    None
                };
                (message, id)
            });
            if let Some((Some(message), _)) = &closing {
                state.history.push(message.clone());
                state.answered = true;
            }

            if !state.answered {
                if error.is_none() && !caller_aborted && violation.is_none() {
                    error = Some(ApiError::ServerClosedConnection {
                        stage: "exchange-finished-without-message",
                    });
                }
                closing.get_or_insert((None, None));
            }

            state.last_error = error.clone();
            state.last_exchange_aborted = caller_aborted;
            (closing, error)
        };

        if let Some((message, id)) = closing {
            let mut response = ResponseEnvelope::complete();
            response.id = id;
            if caller_aborted {
                response = response.aborted();
            }
            self.emit(ChatEvent::MessageEnd { message, response });
        }
        if let Some(error) = &error {
            tracing::warn!(
                endpoint_id = %self.inner.api.endpoint_id(),
                error = %error,
                "chat exchange failed"
            );
            self.emit(ChatEvent::Error(error.clone()));
        }

        self.persist().await;
        self.state().phase = ExchangePhase::Idle;
        self.emit(ChatEvent::ExchangeFinished {
            aborted: caller_aborted,
        });
        tracing::debug!(
            endpoint_id = %self.inner.api.endpoint_id(),
            aborted = caller_aborted,
            failed = error.is_some(),
            "chat exchange finished"
        );

        self.maybe_generate_title();
        match violation {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    fn maybe_generate_title(&self) {
        let mut state = self.state();
        if state.destroyed
            || state.custom_title.is_some()
            || state.last_exchange_aborted
            || state.is_title_running()
            || !self.inner.titles.should_generate(state.history.len())
        {
            return;
        }

        let history = state.history.clone();
        let api_params = state.shape.api_params.clone();
        let epoch = state.title_epoch;
        let cancel = state.title_cancel.child_token();
        let service = self.clone();
        let generation_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            service
                .generate_title(history, api_params, epoch, generation_cancel)
                .await;
        });
        let abort_handle = handle.abort_handle();

        let task: BoxFuture<'static, ()> = async move {
            if let Err(error) = handle.await {
                tracing::warn!(error = %error, "title generation task failed");
            }
        }
        .boxed();
        state.title_job = Some(TitleJob {
            task: task.shared(),
            handle: abort_handle,
            cancel,
        });
    }

    async fn generate_title(
        &self,
        history: Vec<ChatMessage>,
        api_params: Params,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let generated = self
            .inner
            .titles
            .generate(&self.inner.api, &history, api_params, &cancel)
            .await;

        let title = match generated {
            Ok(title) if !title.is_empty() => title,
            Ok(_) => {
                tracing::debug!("title generation produced an empty title");
                return;
            }
            Err(error) => {
                tracing::debug!(error = %error, "title generation failed");
                return;
            }
        };

        // Held across the check and the save so a concurrent `clear` forgets after us.
        let _gate = self.inner.store_gate.lock().await;
        let changed = {
            let mut state = self.state();
            if state.title_epoch != epoch {
                tracing::debug!("discarding a title generated before the chat was cleared");
                false
            } else if state.destroyed || state.custom_title.is_some() {
                false
            } else {
                replace_if_changed(&mut state.title, Some(title))
            }
        };
        if changed {
            self.emit(ChatEvent::TitleChanged(self.title()));
            self.persist_gated().await;
        }
    }

    fn adapter_can_regenerate(&self) -> bool {
        match &self.inner.api {
            ChatApi::Completion(_) => true,
            ChatApi::Conversation(api) => api.can_regenerate(),
        }
    }

    async fn trim_remote(&self, index: usize) -> Result<(), ApiError> {
        match &self.inner.api {
            ChatApi::Completion(_) => Ok(()),
            ChatApi::Conversation(api) => api.remove_messages_after(index).await,
        }
    }

    fn update_shape(&self, update: impl FnOnce(&mut ServiceShape) -> bool) -> bool {
        let changed = update(&mut self.state().shape);
        if changed {
            self.emit(ChatEvent::ShapeChanged);
        }
        changed
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        formatter
            .debug_struct("ChatService")
            .field("name", &state.shape.name)
            .field("api", &self.inner.api)
            .field("moment", &state.moment)
            .field("phase", &state.phase)
            .field("history_len", &state.history.len())
            .finish()
    }
}

pub(crate) fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// Resolves a regeneration index: an existing, non-root entry answering a user message.
fn regenerate_start(
    history: &[ChatMessage],
    index: isize,
    stage: &'static str,
) -> ChatResult<usize> {
    let len = history.len();
    ensure!(len > 0, EmptyHistorySnafu { stage });

    let resolved = if index < 0 {
        len.checked_sub(index.unsigned_abs())
    } else {
        usize::try_from(index).ok().filter(|resolved| *resolved < len)
    };
    let start = resolved.context(IndexOutOfRangeSnafu { stage, index, len })?;
    ensure!(start > 0, RegenerateRootSnafu { stage });
    ensure!(
        history[start - 1].role == ChatRole::User,
        NothingToRegenerateSnafu {
            stage,
            details: "the entry does not answer a user message",
        }
    );
    Ok(start)
}

#[cfg(test)]
mod tests;
