//! Session lifecycle: opening message, serialized turns, the background
//! clock and the one-time finalization when the session ends.
//!
//! A [`SessionManager`] owns one live session. Turns and finalization both
//! take the per-session state lock, so they never interleave. The clock never
//! touches conversation state: when time runs out it flips the `ended` flag
//! and submits a finalize job to the session's worker task, which
//! finalizes, streams the goodbye and closes the sink.

mod finalize;
pub mod sink;
pub mod timer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, OnceCell};

use crate::config::MomentsConfig;
use crate::conversation::prompts;
use crate::conversation::{
    ConversationState, DialogueController, LogCoordinator, PotentialTopic, ResponseType,
    TopicConfirmation, TopicCoordinator, TurnReport,
};
use crate::embedding::EmbeddingProvider;
use crate::index::VectorIndex;
use crate::llm::LanguageModel;
use crate::store::{Role, SessionStore};
use crate::util::blocking;

pub use sink::{stream_message, ChannelSink, CloseReason, EventSink, SessionEvent};
pub use timer::{SessionTimer, TimeListener};

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn SessionStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub model: Arc<dyn LanguageModel>,
    pub config: Arc<MomentsConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} has already ended")]
    Ended(i64),
}

/// Side-channel input that arrives with a user message.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub topic_confirmation: Option<TopicConfirmation>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    pub response_type: ResponseType,
    pub report: TurnReport,
}

enum SessionJob {
    /// Persist an assistant message produced outside a turn.
    RecordAssistant(String),
    Finalize(CloseReason),
}

struct Live {
    state: ConversationState,
    dialogue: DialogueController,
}

struct SessionInner {
    session_id: i64,
    user_id: i64,
    username: String,
    first_session: bool,
    services: Services,
    sink: Arc<dyn EventSink>,
    live: Mutex<Live>,
    ended: AtomicBool,
    warned: AtomicBool,
    goodbye: OnceCell<String>,
    timer: SessionTimer,
    jobs: mpsc::UnboundedSender<SessionJob>,
}

pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Load the session record and spawn the session's job worker.
    pub async fn open(services: Services, session_id: i64, sink: Arc<dyn EventSink>) -> Result<Self> {
        let store = Arc::clone(&services.store);
        let record = blocking(move || store.load_session(session_id))
            .await
            .with_context(|| format!("failed to load session {session_id}"))?;

        let mut state = ConversationState::new(record.id, record.user_id, record.username.clone());
        state.chars_since_last_topic_check = record.chars_since_check;
        state.potential_topic = PotentialTopic::from_stored(&record.potential_topic);
        state.saved_query = record.saved_query.clone();
        state.character = record.character.clone();
        state.asked_questions = record.asked_questions.clone();

        let config = &services.config;
        let topics = TopicCoordinator::new(
            Arc::clone(&services.index),
            Arc::clone(&services.store),
            Arc::clone(&services.embedder),
            Arc::clone(&services.model),
            config,
        );
        let logs = LogCoordinator::new(
            Arc::clone(&services.index),
            Arc::clone(&services.embedder),
            config,
        );
        let dialogue = DialogueController::new(
            topics,
            logs,
            Arc::clone(&services.embedder),
            Arc::clone(&services.model),
            config,
        );
        let timer = SessionTimer::new(
            record.time_left,
            Duration::from_secs(config.session.tick_seconds),
        );

        // A session closed earlier has nothing left to finalize.
        let goodbye = OnceCell::new_with(
            record
                .ended
                .then(|| prompts::goodbye_fallback(&record.username)),
        );
        let (jobs, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            session_id: record.id,
            user_id: record.user_id,
            username: record.username,
            first_session: record.first_session,
            services,
            sink,
            live: Mutex::new(Live { state, dialogue }),
            ended: AtomicBool::new(record.ended),
            warned: AtomicBool::new(false),
            goodbye,
            timer,
            jobs,
        });
        tokio::spawn(run_jobs(Arc::downgrade(&inner), rx));

        Ok(Self { inner })
    }

    pub fn session_id(&self) -> i64 {
        self.inner.session_id
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.inner.timer.remaining()
    }

    /// Copy of the live conversation state.
    pub async fn snapshot(&self) -> ConversationState {
        self.inner.live.lock().await.state.clone()
    }

    /// Load history and start the clock. Returns the opening message on the
    /// session's first turn, `None` when resuming. A session with no time left
    /// is finalized in the background and reported as [`SessionError::Ended`].
    pub async fn start_session(&self) -> Result<Option<String>> {
        let inner = &self.inner;
        if self.is_ended() {
            return Err(SessionError::Ended(inner.session_id).into());
        }
        let store = &inner.services.store;
        let (session_id, user_id) = (inner.session_id, inner.user_id);

        let messages = {
            let store = Arc::clone(store);
            blocking(move || store.messages(session_id)).await?
        };
        let profile_character = {
            let store = Arc::clone(store);
            blocking(move || store.character(user_id)).await?
        };
        let previous_summary = {
            let store = Arc::clone(store);
            blocking(move || store.previous_summary(user_id, session_id))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(session_id, error = %e, "could not load previous summary");
                    None
                })
        };

        let mut live = inner.live.lock().await;
        let Live { state, dialogue } = &mut *live;
        state.load_transcript(&messages);
        if state.character.trim().is_empty() {
            state.character = profile_character;
        }
        state.previous_summary = previous_summary;
        if let Err(e) = dialogue.topics_mut().load_session_topics(state).await {
            tracing::warn!(session_id, error = %e, "could not restore session topics");
        }

        // Time ran out while nobody was connected; close it the way the clock would.
        if inner.timer.remaining() == 0 {
            if !inner.ended.swap(true, Ordering::SeqCst) {
                tracing::info!(session_id, "session opened with no time left");
                if inner.jobs.send(SessionJob::Finalize(CloseReason::TimedOut)).is_err() {
                    tracing::error!(session_id, "session worker is gone, cannot finalize");
                }
            }
            return Err(SessionError::Ended(session_id).into());
        }

        inner.timer.start_monitoring(Arc::new(SessionClock {
            inner: Arc::downgrade(inner),
        }));
        tracing::info!(
            session_id,
            user_id,
            remaining = inner.timer.remaining(),
            resumed = !messages.is_empty(),
            "session started"
        );

        if !messages.is_empty() {
            return Ok(None);
        }

        let mut opening = if inner.first_session {
            prompts::first_time_intro(&inner.username)
        } else {
            prompts::returning_intro(&inner.username, state.previous_summary.as_deref())
        };
        let limit = inner.services.config.session.opening_topic_limit;
        let active = {
            let store = Arc::clone(store);
            blocking(move || store.active_topics(user_id, limit)).await
        };
        match active {
            Ok(topics) => {
                let names: Vec<String> = topics.into_iter().map(|t| t.name).collect();
                if let Some(list) = prompts::active_topics_list(&names) {
                    opening.push_str("\n\n");
                    opening.push_str(&list);
                }
            }
            Err(e) => tracing::warn!(session_id, error = %e, "could not list active topics"),
        }

        state.add_response(&opening);
        inner.persist_message(Role::Assistant, &opening).await;
        Ok(Some(opening))
    }

    /// Process one user message.
    pub async fn run_turn(&self, query: &str, context: TurnContext) -> Result<TurnOutcome> {
        let inner = &self.inner;
        if self.is_ended() {
            return Err(SessionError::Ended(inner.session_id).into());
        }
        let mut live = inner.live.lock().await;
        // The clock may have ended the session while we waited for the lock.
        if self.is_ended() {
            return Err(SessionError::Ended(inner.session_id).into());
        }

        let Live { state, dialogue } = &mut *live;
        if let Some(confirmation) = context.topic_confirmation {
            state.topic_confirmation = confirmation;
        }
        state.add_message(query);
        inner.persist_message(Role::User, query).await;

        let report = dialogue.run_turn(state).await?;

        inner.persist_message(Role::Assistant, &state.response).await;
        inner.persist_turn_state(state, dialogue).await;

        Ok(TurnOutcome {
            response: state.response.clone(),
            response_type: state.response_type,
            report,
        })
    }

    /// End the session on the user's request. Idempotent: later calls, and a
    /// concurrent timeout, get the same goodbye without repeating any work.
    pub async fn end_session(&self) -> String {
        let inner = &self.inner;
        let first = !inner.ended.swap(true, Ordering::SeqCst);
        if first {
            tracing::info!(session_id = inner.session_id, "session ended by user");
        }
        inner.timer.stop_monitoring();
        let goodbye = inner.finish().await;
        if first {
            if let Err(e) = inner.sink.notify_close(CloseReason::Ended).await {
                tracing::warn!(session_id = inner.session_id, error = %e, "could not notify close");
            }
        }
        goodbye
    }
}

impl SessionInner {
    /// Finalize once; every caller receives the same goodbye.
    async fn finish(&self) -> String {
        self.goodbye
            .get_or_init(|| async { self.finalize().await })
            .await
            .clone()
    }

    async fn persist_message(&self, role: Role, content: &str) {
        let store = Arc::clone(&self.services.store);
        let session_id = self.session_id;
        let content = content.to_string();
        if let Err(e) = blocking(move || store.append_message(session_id, role, &content)).await {
            tracing::error!(session_id, role = %role, error = %e, "failed to save message");
        }
    }

    /// Write everything a reconnect needs to resume mid-conversation.
    async fn persist_turn_state(&self, state: &ConversationState, dialogue: &DialogueController) {
        let session_id = self.session_id;
        let fields = state.resumable_fields(dialogue.topics().cache().topics());
        let associations = dialogue.topics().associations(state);
        let log_ids: Vec<i64> = state.current_logs.iter().map(|l| l.log_id).collect();

        let store = Arc::clone(&self.services.store);
        let result = blocking(move || {
            store.save_resumable(session_id, &fields)?;
            store.sync_session_topics(session_id, &associations)?;
            store.link_session_logs(session_id, &log_ids)
        })
        .await;
        if let Err(e) = result {
            tracing::error!(session_id, error = %e, "failed to persist turn state");
        }
    }

    async fn handle(&self, job: SessionJob) {
        match job {
            SessionJob::RecordAssistant(text) => {
                self.persist_message(Role::Assistant, &text).await;
                self.live.lock().await.state.add_response(&text);
            }
            SessionJob::Finalize(reason) => {
                self.timer.stop_monitoring();
                let goodbye = self.finish().await;
                let sink = self.sink.as_ref();
                if let Err(e) = stream_message(sink, &goodbye, ResponseType::Message).await {
                    tracing::warn!(session_id = self.session_id, error = %e, "could not stream goodbye");
                }
                if let Err(e) = sink.notify_close(reason).await {
                    tracing::warn!(session_id = self.session_id, error = %e, "could not notify close");
                }
            }
        }
    }
}

async fn run_jobs(inner: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<SessionJob>) {
    while let Some(job) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(job).await;
    }
}

/// Clock listener for a live session.
struct SessionClock {
    inner: Weak<SessionInner>,
}

#[async_trait]
impl TimeListener for SessionClock {
    async fn on_time_update(&self, _elapsed_minutes: u32, remaining: u32) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.ended.load(Ordering::SeqCst) {
            return;
        }
        let session_id = inner.session_id;

        let store = Arc::clone(&inner.services.store);
        if let Err(e) = blocking(move || store.set_time_left(session_id, remaining)).await {
            tracing::warn!(session_id, error = %e, "failed to persist remaining time");
        }

        let warning_minutes = inner.services.config.session.warning_minutes;
        if remaining == warning_minutes && !inner.warned.swap(true, Ordering::SeqCst) {
            let message = prompts::ending_soon(&inner.username, warning_minutes);
            tracing::info!(session_id, remaining, "session ending soon");
            if let Err(e) = stream_message(inner.sink.as_ref(), &message, ResponseType::Message).await {
                tracing::warn!(session_id, error = %e, "could not stream ending-soon warning");
            }
            if inner.jobs.send(SessionJob::RecordAssistant(message)).is_err() {
                tracing::error!(session_id, "session worker is gone, cannot record warning");
            }
        }

        if remaining == 0 && !inner.ended.swap(true, Ordering::SeqCst) {
            tracing::info!(session_id, "session time is up");
            if inner.jobs.send(SessionJob::Finalize(CloseReason::TimedOut)).is_err() {
                tracing::error!(session_id, "session worker is gone, cannot finalize");
            }
        }
    }
}
