//! Terminal transport for a chat session.
//!
//! Lines typed on stdin become turns; `/yes` and `/no` answer a topic
//! suggestion, `/end` finishes the session. Events pushed by the session
//! outside a turn (the ending-soon warning, the timeout goodbye) are printed
//! as they arrive.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use moments::config::MomentsConfig;
use moments::conversation::{ResponseType, TopicConfirmation};
use moments::db;
use moments::embedding::{self, EmbeddingProvider};
use moments::index::SqliteVectorIndex;
use moments::llm::OpenAiChatModel;
use moments::session::{
    ChannelSink, SessionError, SessionEvent, SessionManager, Services, TurnContext,
};
use moments::store::SqliteStore;

/// Open the database and build the shared collaborators.
fn setup_services(config: MomentsConfig) -> Result<(Services, Arc<SqliteStore>)> {
    let db_path = config.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    match db::migrations::get_embedding_model(&conn)? {
        Some(stored) if stored != config.embedding.model => tracing::warn!(
            stored = %stored,
            configured = %config.embedding.model,
            "embedding model changed, stored vectors may not be comparable"
        ),
        Some(_) => {}
        None => db::migrations::set_embedding_model(&conn, &config.embedding.model)?,
    }

    let db = Arc::new(Mutex::new(conn));
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    tracing::info!("embedding provider ready");
    let model = Arc::new(OpenAiChatModel::from_config(&config.llm)?);

    let store = Arc::new(SqliteStore::new(Arc::clone(&db)));
    let services = Services {
        store: store.clone(),
        index: Arc::new(SqliteVectorIndex::new(db)),
        embedder,
        model,
        config: Arc::new(config),
    };
    Ok((services, store))
}

pub async fn chat(config: MomentsConfig, username: &str, minutes: Option<u32>) -> Result<()> {
    let minutes = minutes.unwrap_or(config.session.default_minutes);
    let (services, store) = setup_services(config)?;

    let user_id = store.find_or_create_user(username)?;
    let session_id = match store.open_session(user_id)? {
        Some(id) => id,
        None => store.create_session(user_id, minutes)?,
    };

    let (sink, mut events) = ChannelSink::new();
    let session = SessionManager::open(services, session_id, Arc::new(sink)).await?;
    match session.start_session().await {
        Ok(Some(opening)) => println!("{opening}\n"),
        Ok(None) => println!(
            "Resuming your session ({} minutes left).\n",
            session.remaining_minutes()
        ),
        Err(e) if e.downcast_ref::<SessionError>().is_some() => {
            println!("This session has no time left.");
            drain(&mut events).await;
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    println!("(type /end to finish the session)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    println!();
                    println!("{}", session.end_session().await);
                    break;
                };
                let (text, confirmation) = match line.trim() {
                    "" => continue,
                    "/end" => {
                        println!("{}", session.end_session().await);
                        break;
                    }
                    "/yes" => ("yes", Some(TopicConfirmation::from_code(1))),
                    "/no" => ("no", Some(TopicConfirmation::from_code(0))),
                    other => (other, None),
                };
                let context = TurnContext { topic_confirmation: confirmation };
                match session.run_turn(text, context).await {
                    Ok(outcome) => {
                        println!("\n{}\n", outcome.response);
                        if outcome.response_type == ResponseType::Topic {
                            println!("(/yes to keep track of this topic, /no to skip it)");
                        }
                    }
                    Err(e) if e.downcast_ref::<SessionError>().is_some() => {
                        drain(&mut events).await;
                        break;
                    }
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            event = events.recv() => {
                if !print_event(event) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn prompt() -> Result<()> {
    print!("> ");
    std::io::stdout().flush().context("failed to flush stdout")
}

/// Print one session event. Returns false once the session is closed.
fn print_event(event: Option<SessionEvent>) -> bool {
    match event {
        Some(SessionEvent::Token(token)) => {
            print!("{token}");
            let _ = std::io::stdout().flush();
            true
        }
        Some(SessionEvent::StreamComplete(_)) => {
            println!("\n");
            true
        }
        Some(SessionEvent::Error(message)) => {
            eprintln!("error: {message}");
            true
        }
        Some(SessionEvent::Closed(reason)) => {
            println!("[session closed: {reason:?}]");
            false
        }
        None => false,
    }
}

/// Print whatever the session still has to say after it ended.
async fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    while print_event(events.recv().await) {}
}
