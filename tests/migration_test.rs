mod helpers;

use moments::db;
use moments::db::migrations::{
    get_embedding_model, get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION,
};

#[test]
fn fresh_db_migrates_to_current_version() {
    let db = helpers::test_db();
    let conn = db.lock().unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn migration_adds_embedding_model_key() {
    let db = helpers::test_db();
    let conn = db.lock().unwrap();
    let model = get_embedding_model(&conn).unwrap();
    assert_eq!(model, Some("all-MiniLM-L6-v2".to_string()));
}

#[test]
fn migrations_are_idempotent() {
    let db = helpers::test_db();
    let conn = db.lock().unwrap();
    run_migrations(&conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn manual_v1_db_upgrades_correctly() {
    db::load_sqlite_vec();
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), 1);
    assert!(get_embedding_model(&conn).unwrap().is_none());

    run_migrations(&conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    assert!(get_embedding_model(&conn).unwrap().is_some());
    // v3 column is usable
    conn.execute(
        "INSERT INTO users (username, created_at) VALUES ('ana', '2026-01-01T00:00:00Z')",
        [],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO sessions (user_id, time_left, asked_questions, created_at, updated_at) \
         VALUES (1, 30, '[\"What changed?\"]', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        [],
    )
    .unwrap();
}
