use std::sync::{Arc, Mutex};

use anyhow::Result;

use moments::config::MomentsConfig;
use moments::store::{SessionStore, SqliteStore};

/// Print a user's most recent session logs.
pub fn logs(config: &MomentsConfig, username: &str, limit: usize) -> Result<()> {
    let conn = moments::db::open_database(config.resolved_db_path())?;
    let store = SqliteStore::new(Arc::new(Mutex::new(conn)));

    let Some(user_id) = store.find_user(username)? else {
        println!("No user named `{username}`.");
        return Ok(());
    };

    let logs = store.recent_logs(user_id, limit)?;
    if logs.is_empty() {
        println!("{username} has no session logs yet.");
        return Ok(());
    }

    for log in &logs {
        println!(
            "── {} · {} (session {}) ──",
            log.created_at.format("%Y-%m-%d %H:%M"),
            log.topic_name,
            log.session_id
        );
        println!("{}", log.text);
        println!();
    }
    Ok(())
}
