use std::sync::{Arc, Mutex};

use moments::db;
use moments::store::{SessionStore, SqliteStore};
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("moments.db");
    assert!(!db_path.exists());

    let conn = db::open_database(&db_path).unwrap();

    assert!(db_path.exists());
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn health_check_counts_rows() {
    let db = Arc::new(Mutex::new(db::open_memory_database().unwrap()));
    let store = SqliteStore::new(Arc::clone(&db));
    let user_id = store.find_or_create_user("ana").unwrap();
    store.create_session(user_id, 30).unwrap();
    let ended = store.create_session(user_id, 30).unwrap();
    store.set_time_left(ended, 0).unwrap();

    let conn = db.lock().unwrap();
    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert_eq!(report.user_count, 1);
    assert_eq!(report.session_count, 2);
    assert_eq!(report.open_session_count, 2);
    assert_eq!(report.topic_count, 0);
    assert_eq!(report.log_vectors, 0);
}

#[test]
fn busy_timeout_is_set() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");

    let conn = db::open_database(&db_path).unwrap();

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
}

#[test]
fn data_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("moments.db");

    let session_id = {
        let store = SqliteStore::new(Arc::new(Mutex::new(db::open_database(&db_path).unwrap())));
        let user_id = store.find_or_create_user("ana").unwrap();
        let session_id = store.create_session(user_id, 20).unwrap();
        store.set_time_left(session_id, 12).unwrap();
        session_id
    };

    let store = SqliteStore::new(Arc::new(Mutex::new(db::open_database(&db_path).unwrap())));
    let record = store.load_session(session_id).unwrap();
    assert_eq!(record.username, "ana");
    assert_eq!(record.time_left, 12);
    assert!(!record.ended);
}
