use std::sync::{Arc, Mutex};

use anyhow::Result;

use moments::config::MomentsConfig;
use moments::store::{SessionStore, SqliteStore};

const LISTED_TOPICS: usize = 50;

/// Print a user's active topics, most recently updated first.
pub fn topics(config: &MomentsConfig, username: &str) -> Result<()> {
    let conn = moments::db::open_database(config.resolved_db_path())?;
    let store = SqliteStore::new(Arc::new(Mutex::new(conn)));

    let Some(user_id) = store.find_user(username)? else {
        println!("No user named `{username}`.");
        return Ok(());
    };

    let topics = store.active_topics(user_id, LISTED_TOPICS)?;
    if topics.is_empty() {
        println!("{username} has no topics yet.");
        return Ok(());
    }

    println!("Topics for {username}");
    println!("{}", "=".repeat(40));
    for topic in &topics {
        println!(
            "  [{}] {}  (updated {})",
            topic.id,
            topic.name,
            topic.updated_at.format("%Y-%m-%d")
        );
        if !topic.description.is_empty() {
            println!("      {}", topic.description);
        }
    }
    Ok(())
}
