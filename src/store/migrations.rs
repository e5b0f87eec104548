//! Version-tracked migrations for the libSQL snapshot mirror.
//!
//! Versions are recorded in `schema_versions`; only newer migrations run.

use libsql::Connection;

use crate::error::StoreError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "output_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS output_records (
                original_index INTEGER PRIMARY KEY,
                keyword TEXT NOT NULL,
                native_keyword TEXT NOT NULL,
                turl TEXT,
                mercari_url TEXT,
                yahoo_url TEXT,
                listing_link TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        "#,
    },
    Migration {
        version: 2,
        name: "output_records_keyword_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_output_records_keyword ON output_records(keyword);
        "#,
    },
];

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_versions (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

fn migration_err(context: impl std::fmt::Display, e: libsql::Error) -> StoreError {
    StoreError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version. Each migration and its
/// version row commit together.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(VERSION_TABLE, ())
        .await
        .map_err(|e| migration_err("creating schema_versions", e))?;

    let applied = schema_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");
        let label = format!("migration {} ({})", migration.version, migration.name);

        let tx = conn.transaction().await.map_err(|e| migration_err(&label, e))?;
        tx.execute_batch(migration.sql)
            .await
            .map_err(|e| migration_err(&label, e))?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| migration_err(&label, e))?;
        tx.commit().await.map_err(|e| migration_err(&label, e))?;
    }
    Ok(())
}

/// Highest applied version, 0 for a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| migration_err("reading schema version", e))?;
    match rows.next().await.map_err(|e| migration_err("reading schema version", e))? {
        Some(row) => row.get::<i64>(0).map_err(|e| migration_err("reading schema version", e)),
        None => Ok(0),
    }
}
