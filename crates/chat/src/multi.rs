use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chorus_llm::{ApiRegistry, ChatApi, Params};
use chorus_storage::HistoryKeeper;
use snafu::{OptionExt, ensure};
use tokio::sync::broadcast;

use crate::error::{ChatResult, IndexOutOfRangeSnafu, UnknownApiSnafu};
use crate::events::MultiChatsEvent;
use crate::record::{ChatRecord, MultiChatsServiceRecord, ServiceShape, non_empty};
use crate::service::{ChatService, ChatServiceOptions, replace_if_changed};
use crate::title::TitleSettings;

const EVENT_CAPACITY: usize = 64;

pub struct MultiChatsOptions {
    pub shape: ServiceShape,
    pub api: ChatApi,
    pub keeper: Arc<dyn HistoryKeeper>,
    pub title_settings: TitleSettings,
}

impl MultiChatsOptions {
    pub fn new(name: impl Into<String>, api: ChatApi, keeper: Arc<dyn HistoryKeeper>) -> Self {
        Self {
            shape: ServiceShape::new(name),
            api,
            keeper,
            title_settings: TitleSettings::default(),
        }
    }

    pub fn with_shape(mut self, shape: ServiceShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_title_settings(mut self, title_settings: TitleSettings) -> Self {
        self.title_settings = title_settings;
        self
    }
}

/// Ordered, most-recent-first collection of conversations sharing one API shape.
///
/// Never empty: removing the last conversation immediately creates a blank one.
#[derive(Clone)]
pub struct MultiChatsService {
    inner: Arc<MultiChatsInner>,
}

struct MultiChatsInner {
    api: ChatApi,
    keeper: Arc<dyn HistoryKeeper>,
    title_settings: TitleSettings,
    events: broadcast::Sender<MultiChatsEvent>,
    state: Mutex<MultiChatsState>,
}

struct MultiChatsState {
    shape: ServiceShape,
    chats: Vec<ChatService>,
}

impl MultiChatsService {
    pub fn new(options: MultiChatsOptions) -> Self {
        let service = Self::empty(options);
        {
            let mut state = service.state();
            let chat = service.build_chat(&state.shape, None);
            state.chats.push(chat);
        }
        service
    }

    pub fn from_record(
        record: &MultiChatsServiceRecord,
        registry: &ApiRegistry,
        keeper: Arc<dyn HistoryKeeper>,
        title_settings: TitleSettings,
    ) -> ChatResult<Self> {
        let api = registry.get(&record.api).context(UnknownApiSnafu {
            stage: "multi-chats-from-record",
            endpoint_id: record.api.clone(),
        })?;

        let shape = ServiceShape {
            name: record.name.clone(),
            icon: record.icon.clone(),
            api_params: record.api_params.clone().unwrap_or_default(),
            params: record.params.clone().unwrap_or_default(),
        };
        let service = Self::empty(
            MultiChatsOptions::new(record.name.clone(), api.clone(), keeper)
                .with_shape(shape)
                .with_title_settings(title_settings),
        );

        {
            let mut state = service.state();
            let mut chats = record
                .chats
                .iter()
                .map(|chat| service.build_chat(&state.shape, Some(chat.clone())))
                .collect::<Vec<_>>();
            if chats.is_empty() {
                chats.push(service.build_chat(&state.shape, None));
            }
            state.chats = chats;
        }

        tracing::debug!(
            name = %record.name,
            chats = record.chats.len(),
            "restored conversation collection"
        );
        Ok(service)
    }

    fn empty(options: MultiChatsOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MultiChatsInner {
                api: options.api,
                keeper: options.keeper,
                title_settings: options.title_settings,
                events,
                state: Mutex::new(MultiChatsState {
                    shape: options.shape,
                    chats: Vec::new(),
                }),
            }),
        }
    }

    pub fn to_record(&self) -> MultiChatsServiceRecord {
        let state = self.state();
        let chats = state
            .chats
            .iter()
            .map(|chat| {
                let shape = chat.shape();
                ChatRecord {
                    moment: chat.moment(),
                    title: chat.title(),
                    api_params: (shape.api_params != state.shape.api_params)
                        .then(|| shape.api_params.clone()),
                    params: (shape.params != state.shape.params).then(|| shape.params.clone()),
                }
            })
            .collect();

        MultiChatsServiceRecord {
            name: state.shape.name.clone(),
            api: self.inner.api.endpoint_id().to_string(),
            icon: state.shape.icon.clone(),
            api_params: non_empty(&state.shape.api_params),
            params: non_empty(&state.shape.params),
            chats,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MultiChatsEvent> {
        self.inner.events.subscribe()
    }

    pub fn api(&self) -> &ChatApi {
        &self.inner.api
    }

    pub fn shape(&self) -> ServiceShape {
        self.state().shape.clone()
    }

    pub fn chats(&self) -> Vec<ChatService> {
        self.state().chats.clone()
    }

    pub fn chat_at(&self, index: usize) -> Option<ChatService> {
        self.state().chats.get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().chats.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.state().chats.is_empty()
    }

    /// Adds a blank conversation at the front and returns it.
    pub fn create_chat(&self) -> ChatService {
        let chat = {
            let mut state = self.state();
            let chat = self.build_chat(&state.shape, None);
            state.chats.insert(0, chat.clone());
            chat
        };
        self.emit(MultiChatsEvent::ChatCreated { index: 0 });
        chat
    }

    /// Destroys the conversation at `index` and forgets its history.
    pub async fn remove_chat_at(&self, index: usize) -> ChatResult<()> {
        let (removed, replaced) = {
            let mut state = self.state();
            let len = state.chats.len();
            ensure!(
                index < len,
                IndexOutOfRangeSnafu {
                    stage: "remove-chat-at",
                    index: isize::try_from(index).unwrap_or(isize::MAX),
                    len,
                }
            );
            let removed = state.chats.remove(index);
            let replaced = state.chats.is_empty();
            if replaced {
                let chat = self.build_chat(&state.shape, None);
                state.chats.push(chat);
            }
            (removed, replaced)
        };

        removed.destroy();
        self.emit(MultiChatsEvent::ChatRemoved { index });
        if replaced {
            self.emit(MultiChatsEvent::ChatCreated { index: 0 });
        }
        removed.forget_history().await;
        Ok(())
    }

    /// Destroys every conversation and starts over with a single blank one.
    pub async fn clear_chats(&self) {
        let removed = {
            let mut state = self.state();
            let chat = self.build_chat(&state.shape, None);
            std::mem::replace(&mut state.chats, vec![chat])
        };

        for chat in &removed {
            chat.destroy();
        }
        self.emit(MultiChatsEvent::ChatsCleared);
        for chat in &removed {
            chat.forget_history().await;
        }
    }

    pub fn set_name(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.fan_out(
            |shape| replace_if_changed(&mut shape.name, name.clone()),
            |chat| chat.set_name(name.clone()),
        )
    }

    pub fn set_icon(&self, icon: Option<String>) -> bool {
        self.fan_out(
            |shape| replace_if_changed(&mut shape.icon, icon.clone()),
            |chat| chat.set_icon(icon.clone()),
        )
    }

    pub fn set_api_params(&self, api_params: Params) -> bool {
        self.fan_out(
            |shape| replace_if_changed(&mut shape.api_params, api_params.clone()),
            |chat| chat.set_api_params(api_params.clone()),
        )
    }

    pub fn set_params(&self, params: Params) -> bool {
        self.fan_out(
            |shape| replace_if_changed(&mut shape.params, params.clone()),
            |chat| chat.set_params(params.clone()),
        )
    }

    /// Aborts and detaches every conversation.
    pub fn destroy(&self) {
        for chat in self.chats() {
            chat.destroy();
        }
    }

    fn fan_out(
        &self,
        update: impl FnOnce(&mut ServiceShape) -> bool,
        apply: impl Fn(&ChatService) -> bool,
    ) -> bool {
        let (changed, chats) = {
            let mut state = self.state();
            let changed = update(&mut state.shape);
            (changed, state.chats.clone())
        };
        if !changed {
            return false;
        }

        let touched = chats.iter().filter(|chat| apply(chat)).count();
        tracing::debug!(children = chats.len(), touched, "propagated shape change");
        self.emit(MultiChatsEvent::ShapeChanged);
        true
    }

    /// Builds a child on a forked API. `seed` carries a restored child's own values.
    fn build_chat(&self, shape: &ServiceShape, seed: Option<ChatRecord>) -> ChatService {
        let mut shape = shape.clone();
        let mut options = ChatServiceOptions::new(
            shape.name.clone(),
            self.inner.api.fork(),
            Arc::clone(&self.inner.keeper),
        )
        .with_title_settings(self.inner.title_settings.clone());

        if let Some(record) = seed {
            if let Some(api_params) = record.api_params {
                shape.api_params = api_params;
            }
            if let Some(params) = record.params {
                shape.params = params;
            }
            options = options.with_moment(record.moment).with_title(record.title);
        }
        ChatService::new(options.with_shape(shape))
    }

    fn emit(&self, event: MultiChatsEvent) {
        let _ = self.inner.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, MultiChatsState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
