use std::sync::Arc;

use chorus_llm::{ApiError, ApiRegistry, ChatApi, ChatLink, ChatMessage, ChatRole, MessageDelta};
use chorus_storage::{HistoryKeeper, MemoryHistoryKeeper, Moment};
use serde_json::json;
use tokio::sync::{Notify, broadcast};

use super::*;
use crate::testing::{
    ConversationScript, ScriptedCompletionApi, ScriptedConversationApi, Step, reply, streaming,
    terminal,
};

fn completion_chat(
    api: &Arc<ScriptedCompletionApi>,
    keeper: &Arc<MemoryHistoryKeeper>,
    title_settings: TitleSettings,
) -> ChatService {
    ChatService::new(
        ChatServiceOptions::new("ChatGPT", ChatApi::Completion(api.clone()), keeper.clone())
            .with_title_settings(title_settings),
    )
}

fn quiet_chat(api: &Arc<ScriptedCompletionApi>) -> (ChatService, Arc<MemoryHistoryKeeper>) {
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(api, &keeper, TitleSettings::disabled());
    (chat, keeper)
}

fn conversation_chat(script: &Arc<ConversationScript>) -> ChatService {
    let api = ScriptedConversationApi::new("bing", script.clone());
    ChatService::new(
        ChatServiceOptions::new(
            "Bing",
            ChatApi::Conversation(Arc::new(api)),
            Arc::new(MemoryHistoryKeeper::new()),
        )
        .with_title_settings(TitleSettings::disabled()),
    )
}

fn titled(min_history: usize) -> TitleSettings {
    TitleSettings {
        min_history,
        ..TitleSettings::default()
    }
}

fn assistant_delta(text: &str) -> MessageDelta {
    MessageDelta::role(ChatRole::Assistant).with_content(text)
}

fn drain(events: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

async fn stored_blob(keeper: &MemoryHistoryKeeper, chat: &ChatService) -> HistoryBlob {
    let moment = chat.moment().expect("moment assigned");
    let value = keeper.remember(&moment).await.expect("blob loads");
    serde_json::from_value(value).expect("blob parses")
}

#[tokio::test]
async fn streamed_reply_is_committed_to_history() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![
        streaming(assistant_delta("Hel")),
        terminal(MessageDelta::text("lo")),
    ]);
    let (chat, keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    chat.send_text("Hi").await.expect("send succeeds");

    assert_eq!(
        chat.history(),
        vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")]
    );
    assert!(!chat.is_pending());
    assert!(chat.pending_message().is_none());
    assert!(chat.last_error().is_none());
    assert_eq!(api.calls(), vec![vec![ChatMessage::user("Hi")]]);
    assert_eq!(stored_blob(&keeper, &chat).await.history, chat.history());

    let events = drain(&mut events);
    assert!(matches!(events[0], ChatEvent::UserMessage(_)));
    assert!(matches!(events[1], ChatEvent::MomentAssigned(_)));
    assert_eq!(events[2], ChatEvent::MessageBegin);
    assert!(matches!(events[3], ChatEvent::MessageDelta { .. }));
    assert!(matches!(events[4], ChatEvent::MessageDelta { .. }));
    assert_eq!(
        events[5],
        ChatEvent::MessageEnd {
            message: Some(ChatMessage::assistant("Hello")),
            response: ResponseEnvelope::complete(),
        }
    );
    assert_eq!(events[6], ChatEvent::ExchangeFinished { aborted: false });
    assert_eq!(events.len(), 7);
}

#[tokio::test]
async fn separate_terminal_delta_yields_exactly_one_entry() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![
        streaming(assistant_delta("Hel")),
        streaming(MessageDelta::text("lo")),
        terminal(MessageDelta::default()),
    ]);
    let (chat, _keeper) = quiet_chat(&api);

    chat.send_text("Hi").await.expect("send succeeds");

    assert_eq!(chat.history().len(), 2);
    assert_eq!(chat.history()[1], ChatMessage::assistant("Hello"));
}

#[tokio::test]
async fn second_send_while_pending_fails_without_side_effects() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let gate = Arc::new(Notify::new());
    api.push_script(vec![
        Step::Wait(gate.clone()),
        terminal(assistant_delta("done")),
    ]);
    let (chat, _keeper) = quiet_chat(&api);

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("first").await })
    };
    until(|| chat.is_pending()).await;

    let error = chat.send_text("second").await.expect_err("single flight");
    assert!(matches!(error, ChatError::SendWhilePending { .. }));
    assert!(error.is_state_violation());
    assert_eq!(chat.history(), vec![ChatMessage::user("first")]);

    gate.notify_one();
    running.await.expect("task joins").expect("first send succeeds");
    assert_eq!(api.calls().len(), 1);
    assert_eq!(
        chat.history(),
        vec![ChatMessage::user("first"), ChatMessage::assistant("done")]
    );
}

#[tokio::test]
async fn abort_after_partial_content_keeps_the_answer() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![
        streaming(assistant_delta("Partial answer ")),
        Step::WaitForCancel,
    ]);
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("Tell me").await })
    };
    until(|| chat.pending_message().is_some_and(|pending| pending.has_content())).await;
    chat.abort();
    chat.abort();
    running.await.expect("task joins").expect("abort is not an error");

    assert!(chat.last_error().is_none());
    assert!(chat.last_exchange_aborted());
    assert_eq!(
        chat.history(),
        vec![
            ChatMessage::user("Tell me"),
            ChatMessage::assistant("Partial answer")
        ]
    );
    let end = drain(&mut events)
        .into_iter()
        .find(|event| matches!(event, ChatEvent::MessageEnd { .. }))
        .expect("message end emitted");
    assert_eq!(
        end,
        ChatEvent::MessageEnd {
            message: Some(ChatMessage::assistant("Partial answer")),
            response: ResponseEnvelope::complete().aborted(),
        }
    );
}

#[tokio::test]
async fn abort_before_any_content_ends_quietly() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![Step::WaitForCancel]);
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("Hi").await })
    };
    until(|| chat.is_pending()).await;
    chat.abort();
    running.await.expect("task joins").expect("abort is not an error");

    assert!(chat.last_error().is_none());
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);
    let events = drain(&mut events);
    assert!(events.contains(&ChatEvent::MessageEnd {
        message: None,
        response: ResponseEnvelope::complete().aborted(),
    }));
    assert_eq!(
        events.last(),
        Some(&ChatEvent::ExchangeFinished { aborted: true })
    );
    assert!(!events.iter().any(|event| matches!(event, ChatEvent::Error(_))));
}

#[tokio::test]
async fn abort_when_idle_is_a_no_op() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    let (chat, _keeper) = quiet_chat(&api);

    chat.abort();
    chat.send_text("Hi").await.expect("send succeeds");

    assert!(!chat.last_exchange_aborted());
    assert_eq!(chat.history().len(), 2);
}

#[tokio::test]
async fn silent_stream_reports_a_closed_connection() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    chat.send_text("Hi").await.expect("errors are recorded, not returned");

    assert!(matches!(
        chat.last_error(),
        Some(ApiError::ServerClosedConnection { .. })
    ));
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);
    let events = drain(&mut events);
    assert!(events.contains(&ChatEvent::MessageEnd {
        message: None,
        response: ResponseEnvelope::complete(),
    }));
    assert!(events
        .iter()
        .any(|event| matches!(event, ChatEvent::Error(ApiError::ServerClosedConnection { .. }))));
}

#[tokio::test]
async fn adapter_failures_become_the_last_error() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![Step::Fail(ApiError::network("connect", "refused"))]);
    api.push_script(reply("Back online"));
    let (chat, _keeper) = quiet_chat(&api);

    chat.send_text("Hi").await.expect("errors are recorded, not returned");
    assert!(matches!(chat.last_error(), Some(ApiError::Network { .. })));
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);

    chat.regenerate_last_response()
        .await
        .expect("resend succeeds");
    assert!(chat.last_error().is_none(), "next exchange clears the error");
    assert_eq!(chat.history().len(), 2);
}

#[tokio::test]
async fn failure_after_partial_content_keeps_both() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![
        streaming(assistant_delta("Half")),
        Step::Fail(ApiError::network("stream", "reset")),
    ]);
    let (chat, _keeper) = quiet_chat(&api);

    chat.send_text("Hi").await.expect("errors are recorded, not returned");

    assert!(matches!(chat.last_error(), Some(ApiError::Network { .. })));
    assert_eq!(chat.history()[1], ChatMessage::assistant("Half"));
}

#[tokio::test]
async fn adapter_side_cancellation_depends_on_received_content() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![Step::Fail(ApiError::aborted("stream"))]);
    api.push_script(vec![
        streaming(assistant_delta("Stopped early")),
        Step::Fail(ApiError::aborted("stream")),
    ]);
    let (chat, _keeper) = quiet_chat(&api);

    chat.send_text("one").await.expect("send returns");
    assert!(matches!(
        chat.last_error(),
        Some(ApiError::ServerClosedConnection { .. })
    ));

    chat.regenerate_last_response().await.expect("send returns");
    assert!(chat.last_error().is_none());
    assert!(!chat.last_exchange_aborted());
    assert_eq!(chat.history()[1], ChatMessage::assistant("Stopped early"));
}

#[tokio::test]
async fn first_delta_without_role_is_a_protocol_violation() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![streaming(MessageDelta::text("orphan"))]);
    let (chat, _keeper) = quiet_chat(&api);

    let error = chat.send_text("Hi").await.expect_err("violation surfaces");

    assert!(matches!(error, ChatError::MissingRole { .. }));
    assert!(error.is_protocol_violation());
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);
    assert!(chat.phase().is_idle());
    assert!(chat.pending_message().is_none());
}

#[tokio::test]
async fn terminal_delta_without_content_is_a_protocol_violation() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![terminal(MessageDelta::role(ChatRole::Assistant))]);
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    let error = chat.send_text("Hi").await.expect_err("violation surfaces");

    assert!(matches!(error, ChatError::IncompleteMessage { .. }));
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);
    assert!(chat.last_error().is_none());
    assert!(drain(&mut events).contains(&ChatEvent::MessageEnd {
        message: None,
        response: ResponseEnvelope::complete(),
    }));
}

#[tokio::test]
async fn steps_and_links_accumulate_across_deltas() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let docs = ChatLink::new("docs", "https://docs.example");
    api.push_script(vec![
        streaming(MessageDelta::role(ChatRole::Assistant).with_steps(vec!["search".to_string()])),
        streaming(MessageDelta::text("See").with_links(vec![docs.clone()])),
        terminal(MessageDelta::text(" docs").with_steps(vec!["read".to_string()])),
    ]);
    let (chat, _keeper) = quiet_chat(&api);

    chat.send_text("Where?").await.expect("send succeeds");

    assert_eq!(
        chat.history()[1],
        ChatMessage::assistant("See docs")
            .with_steps(vec!["search".to_string(), "read".to_string()])
            .with_links(vec![docs])
    );
}

#[tokio::test]
async fn unterminated_stream_is_closed_out() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![Step::Delta(
        assistant_delta("Unterminated "),
        ResponseEnvelope::streaming().with_id("remote-7"),
    )]);
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    chat.send_text("Hi").await.expect("send succeeds");

    assert!(chat.last_error().is_none());
    assert_eq!(chat.history()[1], ChatMessage::assistant("Unterminated"));
    assert!(drain(&mut events).contains(&ChatEvent::MessageEnd {
        message: Some(ChatMessage::assistant("Unterminated")),
        response: ResponseEnvelope::complete().with_id("remote-7"),
    }));
}

#[tokio::test]
async fn conversation_adapters_receive_only_the_newest_text() {
    let script = ConversationScript::new();
    script.push_script(reply("one"));
    script.push_script(reply("two"));
    let chat = conversation_chat(&script);

    chat.send_text("first").await.expect("send succeeds");
    chat.send_text("second").await.expect("send succeeds");

    assert_eq!(
        script.sent(),
        vec![(0, "first".to_string()), (0, "second".to_string())]
    );
    assert_eq!(chat.history().len(), 4);
}

#[tokio::test]
async fn regenerate_from_last_entry_reruns_the_exchange() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("B"));
    api.push_script(reply("B, again"));
    let (chat, _keeper) = quiet_chat(&api);
    chat.send_text("A").await.expect("send succeeds");
    let mut events = chat.subscribe();

    assert!(chat.can_regenerate_from(-1));
    chat.regenerate_from(-1).await.expect("regenerate succeeds");

    assert_eq!(
        chat.history(),
        vec![ChatMessage::user("A"), ChatMessage::assistant("B, again")]
    );
    assert_eq!(api.calls()[1], vec![ChatMessage::user("A")]);
    let events = drain(&mut events);
    assert_eq!(events[0], ChatEvent::HistoryRemoved { from_index: 1 });
    assert_eq!(events[1], ChatEvent::MessageBegin);
}

#[tokio::test]
async fn regenerate_from_rejects_invalid_indices() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let (chat, _keeper) = quiet_chat(&api);

    assert!(matches!(
        chat.regenerate_from(-1).await,
        Err(ChatError::EmptyHistory { .. })
    ));

    api.push_script(reply("B"));
    chat.send_text("A").await.expect("send succeeds");

    assert!(matches!(
        chat.regenerate_from(0).await,
        Err(ChatError::RegenerateRoot { .. })
    ));
    assert!(matches!(
        chat.regenerate_from(-2).await,
        Err(ChatError::RegenerateRoot { .. })
    ));
    assert!(matches!(
        chat.regenerate_from(2).await,
        Err(ChatError::IndexOutOfRange { index: 2, len: 2, .. })
    ));
    assert!(matches!(
        chat.regenerate_from(-3).await,
        Err(ChatError::IndexOutOfRange { .. })
    ));
    assert!(!chat.can_regenerate_from(0));
    assert_eq!(chat.history().len(), 2);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn session_adapters_must_support_dropping_turns() {
    let fixed = ConversationScript::new();
    fixed.push_script(reply("B"));
    let chat = conversation_chat(&fixed);
    chat.send_text("A").await.expect("send succeeds");

    assert!(!chat.can_regenerate_from(-1));
    assert!(matches!(
        chat.regenerate_last_response().await,
        Err(ChatError::NothingToRegenerate { .. })
    ));

    let flexible = ConversationScript::regenerating();
    flexible.push_script(reply("B"));
    flexible.push_script(reply("C"));
    let chat = conversation_chat(&flexible);
    chat.send_text("A").await.expect("send succeeds");

    chat.regenerate_last_response()
        .await
        .expect("regenerate succeeds");

    assert_eq!(flexible.removed(), vec![(0, 1)]);
    assert_eq!(
        chat.history(),
        vec![ChatMessage::user("A"), ChatMessage::assistant("C")]
    );
}

#[tokio::test]
async fn failed_remote_trim_leaves_the_last_exchange_untouched() {
    let script = ConversationScript::regenerating();
    script.push_script(reply("B"));
    script.push_script(vec![
        streaming(assistant_delta("Half")),
        Step::Fail(ApiError::network("test", "dropped")),
    ]);
    script.push_script(reply("D"));
    let chat = conversation_chat(&script);
    chat.send_text("A").await.expect("send succeeds");
    chat.send_text("C").await.expect("send resolves");
    assert!(matches!(chat.last_error(), Some(ApiError::Network { .. })));

    script.fail_next_removal(ApiError::api("test", "session expired"));
    assert!(matches!(
        chat.regenerate_from(-1).await,
        Err(ChatError::RemoteSession { .. })
    ));

    assert!(matches!(chat.last_error(), Some(ApiError::Network { .. })));
    assert!(!chat.last_exchange_aborted());
    assert!(!chat.is_pending());
    assert_eq!(chat.history().len(), 4);
    assert!(script.removed().is_empty());

    chat.regenerate_from(-1).await.expect("regenerate succeeds");
    assert_eq!(script.removed(), vec![(0, 3)]);
    assert!(chat.last_error().is_none());
    assert_eq!(chat.history()[3], ChatMessage::assistant("D"));
}

#[tokio::test]
async fn regenerate_last_response_needs_history() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let (chat, _keeper) = quiet_chat(&api);

    assert!(matches!(
        chat.regenerate_last_response().await,
        Err(ChatError::EmptyHistory { .. })
    ));
}

#[tokio::test]
async fn remove_messages_after_truncates_and_persists() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("one"));
    api.push_script(reply("two"));
    let (chat, keeper) = quiet_chat(&api);
    chat.send_text("a").await.expect("send succeeds");
    chat.send_text("b").await.expect("send succeeds");

    chat.remove_messages_after(2).await.expect("remove succeeds");

    assert_eq!(chat.history().len(), 2);
    assert_eq!(stored_blob(&keeper, &chat).await.history.len(), 2);
    assert!(matches!(
        chat.remove_messages_after(2).await,
        Err(ChatError::IndexOutOfRange { .. })
    ));
}

#[tokio::test]
async fn clear_wipes_history_and_forgets_the_blob() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = ChatService::new(
        ChatServiceOptions::new("ChatGPT", ChatApi::Completion(api.clone()), keeper.clone())
            .with_title(Some("Greeting".to_string()))
            .with_title_settings(TitleSettings::disabled()),
    );
    chat.send_text("Hi").await.expect("send succeeds");
    let moment = chat.moment().expect("moment assigned");
    assert!(keeper.contains(&moment));
    let mut events = chat.subscribe();

    chat.clear().await.expect("clear succeeds");

    assert!(chat.history().is_empty());
    assert!(chat.title().is_none());
    assert!(chat.last_error().is_none());
    assert_eq!(chat.moment(), Some(moment.clone()));
    assert!(!keeper.contains(&moment));
    assert_eq!(
        drain(&mut events),
        vec![ChatEvent::HistoryCleared, ChatEvent::TitleChanged(None)]
    );
}

#[tokio::test]
async fn clear_resets_the_remote_session() {
    let script = ConversationScript::new();
    script.push_script(reply("Hello"));
    let chat = conversation_chat(&script);
    chat.send_text("Hi").await.expect("send succeeds");

    chat.clear().await.expect("clear succeeds");

    assert_eq!(script.resets(), 1);
}

#[tokio::test]
async fn clear_is_rejected_while_pending() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![Step::WaitForCancel]);
    let (chat, _keeper) = quiet_chat(&api);

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("Hi").await })
    };
    until(|| chat.is_pending()).await;

    assert!(matches!(
        chat.clear().await,
        Err(ChatError::SendWhilePending { .. })
    ));
    assert!(matches!(
        chat.regenerate_from(-1).await,
        Err(ChatError::SendWhilePending { .. })
    ));
    chat.abort();
    running.await.expect("task joins").expect("abort is not an error");
    assert_eq!(chat.history(), vec![ChatMessage::user("Hi")]);
}

#[tokio::test]
async fn update_message_edits_in_place() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Helo"));
    let (chat, keeper) = quiet_chat(&api);
    chat.send_text("Hi").await.expect("send succeeds");
    let mut events = chat.subscribe();

    chat.update_message(MessagePatch::content("Hello"), 1)
        .await
        .expect("update succeeds");

    assert_eq!(chat.history()[1], ChatMessage::assistant("Hello"));
    assert_eq!(stored_blob(&keeper, &chat).await.history[1].content, "Hello");
    assert_eq!(
        drain(&mut events),
        vec![ChatEvent::MessageUpdated {
            index: 1,
            message: ChatMessage::assistant("Hello"),
        }]
    );
    assert!(matches!(
        chat.update_message(MessagePatch::content("x"), 9).await,
        Err(ChatError::IndexOutOfRange { .. })
    ));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn record_round_trip_restores_history_and_titles() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = ChatService::new(
        ChatServiceOptions::new("ChatGPT", ChatApi::Completion(api.clone()), keeper.clone())
            .with_title(Some("Greeting".to_string()))
            .with_title_settings(TitleSettings::disabled()),
    );
    chat.send_text("Hi").await.expect("send succeeds");
    chat.set_custom_title(Some("  Mine ".to_string())).await;

    let record = chat.to_record();
    let raw = serde_json::to_string(&record).expect("record serializes");
    let record: ChatServiceRecord = serde_json::from_str(&raw).expect("record parses");
    let mut registry = ApiRegistry::new();
    registry.register(ChatApi::Completion(api.clone()));

    let restored =
        ChatService::from_record(&record, &registry, keeper.clone(), TitleSettings::disabled())
            .expect("record restores");
    assert!(!restored.is_loaded());
    restored.load().await;

    assert_eq!(restored.history(), chat.history());
    assert_eq!(restored.title().as_deref(), Some("Mine"));
    assert_eq!(restored.generated_title().as_deref(), Some("Greeting"));
    assert_eq!(restored.custom_title(), chat.custom_title());
    assert_eq!(restored.moment(), chat.moment());
}

#[tokio::test]
async fn unknown_api_in_record_is_rejected() {
    let record = ChatServiceRecord {
        name: "Gone".to_string(),
        api: "missing".to_string(),
        icon: None,
        api_params: None,
        params: None,
        moment: None,
    };

    let result = ChatService::from_record(
        &record,
        &ApiRegistry::new(),
        Arc::new(MemoryHistoryKeeper::new()),
        TitleSettings::disabled(),
    );

    assert!(matches!(result, Err(ChatError::UnknownApi { .. })));
}

#[tokio::test]
async fn sending_rehydrates_persisted_history_first() {
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let moment = Moment::parse("saved-chat").expect("valid moment");
    keeper
        .save(
            &moment,
            json!({
                "title": "Old",
                "history": [
                    { "role": "user", "content": "earlier" },
                    { "role": "assistant", "content": "reply" },
                ],
            }),
        )
        .await
        .expect("seed blob");
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("more"));
    let chat = ChatService::new(
        ChatServiceOptions::new("ChatGPT", ChatApi::Completion(api.clone()), keeper.clone())
            .with_moment(Some(moment))
            .with_title_settings(TitleSettings::disabled()),
    );
    assert!(chat.history().is_empty());

    chat.send_text("again").await.expect("send succeeds");

    assert_eq!(chat.title().as_deref(), Some("Old"));
    assert_eq!(chat.history().len(), 4);
    assert_eq!(api.calls()[0].len(), 3);
    assert_eq!(stored_blob(&keeper, &chat).await.history.len(), 4);
}

#[tokio::test]
async fn custom_title_is_never_overridden() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("one"));
    api.push_script(reply("two"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(0));

    chat.set_custom_title(Some("Mine".to_string())).await;
    chat.send_text("a").await.expect("send succeeds");
    chat.wait_for_title().await;
    chat.send_text("b").await.expect("send succeeds");
    chat.wait_for_title().await;

    assert_eq!(chat.title().as_deref(), Some("Mine"));
    assert_eq!(api.calls().len(), 2, "no title request while a custom title is set");
}

#[tokio::test]
async fn generated_title_is_cleaned_and_persisted() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    api.push_script(reply("\"Greeting.\""));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    chat.send_text("Hi").await.expect("send succeeds");
    chat.wait_for_title().await;

    assert_eq!(chat.title().as_deref(), Some("Greeting"));
    assert_eq!(stored_blob(&keeper, &chat).await.title.as_deref(), Some("Greeting"));
    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].len(), 1);
    assert_eq!(chat.history().len(), 2, "title exchange leaves history alone");
}

#[tokio::test]
async fn next_exchange_waits_for_running_title_generation() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let gate = Arc::new(Notify::new());
    api.push_script(reply("Hello"));
    api.push_script(vec![Step::Wait(gate.clone()), terminal(assistant_delta("Topic"))]);
    api.push_script(reply("Again"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    chat.send_text("Hi").await.expect("send succeeds");
    until(|| api.calls().len() == 2).await;
    assert!(chat.is_title_generating());

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("More").await })
    };
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(api.calls().len(), 2, "primary exchange waits for the title");

    gate.notify_one();
    running.await.expect("task joins").expect("send succeeds");

    assert_eq!(chat.generated_title().as_deref(), Some("Topic"));
    assert_eq!(api.calls()[2].len(), 3);
    assert_eq!(chat.history()[3], ChatMessage::assistant("Again"));
}

#[tokio::test]
async fn rate_limited_adapters_get_local_titles() {
    let api = Arc::new(ScriptedCompletionApi::new("slow").rate_limited());
    api.push_script(reply("Hello there old friend"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(
        &api,
        &keeper,
        TitleSettings {
            min_history: 1,
            local_words: 2,
            ..TitleSettings::default()
        },
    );

    chat.send_text("Hi").await.expect("send succeeds");
    chat.wait_for_title().await;

    assert_eq!(chat.title().as_deref(), Some("Hello there"));
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn conversation_titles_use_a_disposable_session() {
    let script = ConversationScript::deleting();
    script.push_script(reply("Answer"));
    script.push_script(reply("Topic"));
    let chat = ChatService::new(
        ChatServiceOptions::new(
            "Bing",
            ChatApi::Conversation(Arc::new(ScriptedConversationApi::new("bing", script.clone()))),
            Arc::new(MemoryHistoryKeeper::new()),
        )
        .with_title_settings(titled(1)),
    );

    chat.send_text("Question").await.expect("send succeeds");
    chat.wait_for_title().await;

    let sent = script.sent();
    assert_eq!(sent[0], (0, "Question".to_string()));
    assert_ne!(sent[1].0, 0);
    assert_eq!(script.deleted_sessions(), vec![sent[1].0]);
    assert_eq!(chat.title().as_deref(), Some("Topic"));
}

#[tokio::test]
async fn title_failures_are_swallowed() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    api.push_script(vec![Step::Fail(ApiError::network("title", "down"))]);
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    chat.send_text("Hi").await.expect("send succeeds");
    chat.wait_for_title().await;

    assert!(chat.title().is_none());
    assert!(chat.last_error().is_none());
}

#[tokio::test]
async fn aborted_exchanges_do_not_trigger_titles() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(vec![streaming(assistant_delta("Partial")), Step::WaitForCancel]);
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    let running = {
        let chat = chat.clone();
        tokio::spawn(async move { chat.send_text("Hi").await })
    };
    until(|| chat.pending_message().is_some()).await;
    chat.abort();
    running.await.expect("task joins").expect("abort is not an error");

    assert!(!chat.is_title_generating());
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn title_flag_drops_once_the_title_lands() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    api.push_script(reply("Hello"));
    api.push_script(reply("Topic"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    chat.send_text("Hi").await.expect("send succeeds");
    until(|| chat.generated_title().is_some()).await;
    until(|| !chat.is_title_generating()).await;

    assert_eq!(chat.generated_title().as_deref(), Some("Topic"));
    assert_eq!(api.calls().len(), 2);
}

#[tokio::test]
async fn clear_cancels_a_title_still_being_generated() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let gate = Arc::new(Notify::new());
    api.push_script(reply("Hello"));
    api.push_script(vec![Step::Wait(gate.clone()), terminal(assistant_delta("Topic"))]);
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));

    chat.send_text("Hi").await.expect("send succeeds");
    until(|| api.calls().len() == 2).await;
    let moment = chat.moment().expect("moment assigned");

    chat.clear().await.expect("clear succeeds");
    gate.notify_one();
    chat.wait_for_title().await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert!(chat.title().is_none());
    assert!(chat.history().is_empty());
    assert!(!chat.is_title_generating());
    assert!(!keeper.contains(&moment), "cleared history must stay deleted");
}

#[tokio::test]
async fn titles_finished_after_clear_are_discarded() {
    // Local titles ignore cancellation, so only the clear epoch can stop them.
    let api = Arc::new(ScriptedCompletionApi::new("slow").rate_limited());
    api.push_script(reply("Hello there"));
    let keeper = Arc::new(MemoryHistoryKeeper::new());
    let chat = completion_chat(&api, &keeper, titled(1));
    let mut events = chat.subscribe();

    chat.send_text("Hi").await.expect("send succeeds");
    let moment = chat.moment().expect("moment assigned");
    chat.clear().await.expect("clear succeeds");
    chat.wait_for_title().await;

    assert!(chat.title().is_none());
    assert!(!keeper.contains(&moment));
    let events = drain(&mut events);
    let cleared = events
        .iter()
        .position(|event| *event == ChatEvent::HistoryCleared)
        .expect("cleared event");
    assert!(
        events[cleared..]
            .iter()
            .all(|event| !matches!(event, ChatEvent::TitleChanged(Some(_))))
    );
}

#[tokio::test]
async fn shape_changes_are_suppressed_when_unchanged() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let (chat, _keeper) = quiet_chat(&api);
    let mut events = chat.subscribe();

    assert!(!chat.set_name("ChatGPT"));
    assert!(chat.set_name("Assistant"));
    assert!(chat.set_icon(Some("robot".to_string())));
    assert!(!chat.set_icon(Some("robot".to_string())));

    assert_eq!(
        drain(&mut events),
        vec![ChatEvent::ShapeChanged, ChatEvent::ShapeChanged]
    );
    assert_eq!(chat.to_record().name, "Assistant");
    assert_eq!(chat.to_record().icon.as_deref(), Some("robot"));
}

#[tokio::test]
async fn destroyed_services_reject_work_and_stop_persisting() {
    let api = Arc::new(ScriptedCompletionApi::new("gpt"));
    let (chat, keeper) = quiet_chat(&api);

    chat.destroy();

    assert!(matches!(
        chat.send_text("Hi").await,
        Err(ChatError::ServiceDestroyed { .. })
    ));
    chat.persist().await;
    assert!(keeper.is_empty());
    assert!(api.calls().is_empty());
}
