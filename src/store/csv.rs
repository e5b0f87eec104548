//! CSV snapshot file, rewritten in full on every flush.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};

use crate::error::StoreError;
use crate::store::output::OutputRecord;
use crate::store::traits::PersistentStore;

pub const CSV_HEADER: [&str; 6] = ["Identity", "JP Keyword", "TURL", "MURL", "YURL", "eBay Page"];

/// Writes the snapshot as CSV to a fixed path.
#[derive(Debug, Clone)]
pub struct CsvSnapshotStore {
    path: PathBuf,
}

impl CsvSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `output_<JST timestamp>.csv` inside `dir`.
    pub fn timestamped(dir: &Path, now: DateTime<Utc>) -> Self {
        Self::new(dir.join(format!("output_{}.csv", jst_stamp(now))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Filename-safe Japan Standard Time stamp, e.g. `11-7-2024-9-05-33-PM-JST`.
pub fn jst_stamp(now: DateTime<Utc>) -> String {
    const FORMAT: &str = "%-m-%-d-%Y-%-I-%M-%S-%p-JST";
    match FixedOffset::east_opt(9 * 3600) {
        Some(jst) => now.with_timezone(&jst).format(FORMAT).to_string(),
        None => now.format(FORMAT).to_string(),
    }
}

/// Quote a field when it contains a delimiter, quote, or line break.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Render rows as CSV text with a header line.
pub fn render(snapshot: &[(usize, OutputRecord)]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for (_, record) in snapshot {
        let fields = [
            record.keyword.as_str(),
            record.native_keyword.as_str(),
            record.turl.as_deref().unwrap_or_default(),
            record.mercari_url.as_deref().unwrap_or_default(),
            record.yahoo_url.as_deref().unwrap_or_default(),
            record.listing_link.as_str(),
        ];
        let line: Vec<String> = fields.iter().map(|f| escape(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

#[async_trait]
impl PersistentStore for CsvSnapshotStore {
    async fn flush(&self, snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write then rename so readers never see a half-written file.
        let tmp = self.path.with_extension("csv.tmp");
        tokio::fs::write(&tmp, render(snapshot)).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
