mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{Harness, ScriptedModel};
use moments::conversation::{prompts, ResponseType};
use moments::session::{
    ChannelSink, CloseReason, SessionError, SessionEvent, SessionManager, TurnContext,
};
use moments::store::SessionStore;
use tokio::sync::mpsc::UnboundedReceiver;

const TICK: Duration = Duration::from_secs(60);

async fn started(h: &Harness, minutes: u32) -> (SessionManager, UnboundedReceiver<SessionEvent>, i64) {
    let (_, session_id) = h.new_session("ana", minutes);
    let (sink, events) = ChannelSink::new();
    let session = SessionManager::open(h.services(), session_id, Arc::new(sink))
        .await
        .unwrap();
    session.start_session().await.unwrap();
    (session, events, session_id)
}

/// Wait just past the next clock tick.
async fn one_tick() {
    tokio::time::sleep(TICK + Duration::from_secs(1)).await;
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn streamed_text(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Token(t) => Some(t.as_str()),
            _ => None,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn no_warning_when_starting_at_warning_threshold() {
    let h = Harness::new(ScriptedModel::new());
    let (session, mut events, session_id) = started(&h, 5).await;

    one_tick().await;

    assert_eq!(session.remaining_minutes(), 4);
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.store.load_session(session_id).unwrap().time_left, 4);
    session.end_session().await;
}

#[tokio::test(start_paused = true)]
async fn warning_fires_once_when_reaching_threshold() {
    let h = Harness::new(ScriptedModel::new());
    let (session, mut events, session_id) = started(&h, 6).await;

    one_tick().await;

    assert_eq!(session.remaining_minutes(), 5);
    let first = drain(&mut events);
    let warning = prompts::ending_soon("ana", 5);
    assert_eq!(streamed_text(&first), warning);
    assert_eq!(
        first.last(),
        Some(&SessionEvent::StreamComplete(ResponseType::Message))
    );
    let state = session.snapshot().await;
    assert!(state.conversation_context.contains(&warning));
    let saved = h.store.messages(session_id).unwrap();
    assert_eq!(saved.last().map(|m| m.content.as_str()), Some(warning.as_str()));

    one_tick().await;

    assert_eq!(session.remaining_minutes(), 4);
    assert!(drain(&mut events).is_empty());
    session.end_session().await;
}

#[tokio::test(start_paused = true)]
async fn clock_running_out_finalizes_and_closes() {
    let h = Harness::new(ScriptedModel::new().structured("SessionTopicsJson", r#"{"topics": []}"#));
    let (session, mut events, session_id) = started(&h, 1).await;

    one_tick().await;

    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("session never closed")
            .expect("sink dropped");
        let closed = matches!(event, SessionEvent::Closed(_));
        received.push(event);
        if closed {
            break;
        }
    }

    let goodbye = prompts::goodbye_fallback("ana");
    assert_eq!(streamed_text(&received), goodbye);
    assert_eq!(received.last(), Some(&SessionEvent::Closed(CloseReason::TimedOut)));
    assert!(session.is_ended());
    assert_eq!(session.remaining_minutes(), 0);

    let record = h.store.load_session(session_id).unwrap();
    assert!(record.ended);
    assert_eq!(record.time_left, 0);
    assert_eq!(record.summary.as_deref(), Some(prompts::NO_TOPICS_SUMMARY));

    // A late user end gets the same goodbye and no second close.
    assert_eq!(session.end_session().await, goodbye);
    assert!(drain(&mut events).is_empty());
    assert_eq!(h.model.structured_modes("SessionTopicsJson").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_opened_without_time_left_is_finalized() {
    let h = Harness::new(ScriptedModel::new().structured("SessionTopicsJson", r#"{"topics": []}"#));
    let (_, session_id) = h.new_session("ana", 0);
    let (sink, mut events) = ChannelSink::new();
    let session = SessionManager::open(h.services(), session_id, Arc::new(sink))
        .await
        .unwrap();

    let err = session.start_session().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Ended(id)) if *id == session_id
    ));
    assert!(session.is_ended());

    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("session never closed")
            .expect("sink dropped");
        let closed = matches!(event, SessionEvent::Closed(_));
        received.push(event);
        if closed {
            break;
        }
    }
    assert_eq!(streamed_text(&received), prompts::goodbye_fallback("ana"));
    assert_eq!(received.last(), Some(&SessionEvent::Closed(CloseReason::TimedOut)));

    let turn = session.run_turn("hello", TurnContext::default()).await;
    assert!(turn.unwrap_err().downcast_ref::<SessionError>().is_some());

    let record = h.store.load_session(session_id).unwrap();
    assert!(record.ended);
    assert_eq!(record.summary.as_deref(), Some(prompts::NO_TOPICS_SUMMARY));
    assert_eq!(h.model.structured_modes("SessionTopicsJson").len(), 1);
}
