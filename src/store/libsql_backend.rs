//! libSQL mirror of the output snapshot.
//!
//! Each flush upserts every row by original index inside one transaction,
//! so the table always matches the latest snapshot.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::output::OutputRecord;
use crate::store::traits::PersistentStore;

pub struct LibSqlSnapshotStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlSnapshotStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Snapshot database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Database(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Database(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Read every stored row ordered by index.
    #[cfg(test)]
    async fn load(&self) -> Result<Vec<(usize, OutputRecord)>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT original_index, keyword, native_keyword, turl,
                        mercari_url, yahoo_url, listing_link
                 FROM output_records ORDER BY original_index",
                (),
            )
            .await
            .map_err(|e| StoreError::Database(format!("load: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Database(format!("load row: {e}")))?
        {
            let parse = |e: libsql::Error| StoreError::Database(format!("load row parse: {e}"));
            let index: i64 = row.get(0).map_err(parse)?;
            out.push((
                index as usize,
                OutputRecord {
                    keyword: row.get(1).map_err(parse)?,
                    native_keyword: row.get(2).map_err(parse)?,
                    turl: row.get(3).map_err(parse)?,
                    mercari_url: row.get(4).map_err(parse)?,
                    yahoo_url: row.get(5).map_err(parse)?,
                    listing_link: row.get(6).map_err(parse)?,
                },
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl PersistentStore for LibSqlSnapshotStore {
    async fn flush(&self, snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StoreError::Database(format!("begin: {e}")))?;

        for (index, record) in snapshot {
            tx.execute(
                "INSERT INTO output_records
                    (original_index, keyword, native_keyword, turl,
                     mercari_url, yahoo_url, listing_link, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
                 ON CONFLICT(original_index) DO UPDATE SET
                    keyword = excluded.keyword,
                    native_keyword = excluded.native_keyword,
                    turl = excluded.turl,
                    mercari_url = excluded.mercari_url,
                    yahoo_url = excluded.yahoo_url,
                    listing_link = excluded.listing_link,
                    updated_at = excluded.updated_at",
                params![
                    *index as i64,
                    record.keyword.clone(),
                    record.native_keyword.clone(),
                    record.turl.clone(),
                    record.mercari_url.clone(),
                    record.yahoo_url.clone(),
                    record.listing_link.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Database(format!("upsert {index}: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(format!("commit: {e}")))?;
        Ok(())
    }
}
