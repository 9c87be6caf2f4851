//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use moments::config::MomentsConfig;
use moments::db;

pub fn doctor(config: &MomentsConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `moments chat --user <name>` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Moments Health Report");
    println!("=====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Embedding model:");
    println!(
        "  Stored:          {}",
        report.embedding_model.as_deref().unwrap_or("(not set)")
    );
    println!("  Configured:      {}", config.embedding.model);
    match report.embedding_model.as_deref() {
        Some(stored) if stored != config.embedding.model => {
            println!("  WARNING: model mismatch! Stored vectors were made by another model.");
        }
        Some(_) => println!("  Status:          OK (match)"),
        None => {}
    }
    println!();
    println!("Row counts:");
    println!("  Users:           {}", report.user_count);
    println!(
        "  Sessions:        {} ({} open)",
        report.session_count, report.open_session_count
    );
    println!("  Topics:          {}", report.topic_count);
    println!("  Logs:            {}", report.log_count);
    println!();
    println!("Vector index:");
    println!("  Topic vectors:   {}", report.topic_vectors);
    println!("  Log vectors:     {}", report.log_vectors);
    if report.topic_vectors < report.topic_count || report.log_vectors < report.log_count {
        println!("  WARNING: some rows have no vector and will not be retrieved.");
    }
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery: restore from a backup, e.g. cp backup.db ~/.moments/moments.db");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
