//! Pipeline stage actions.
//!
//! Link discovery is a sequential pagination walk over identities. Every
//! other stage is a [`StageAction`](crate::dispatch::StageAction) driven by
//! a worker pool and retry coordinator.

pub mod enrichment;
pub mod keywords;
pub mod links;
pub mod turl;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::{Task, TaskSink};
use crate::error::TaskError;
use crate::store::{OutputRecord, OutputStore};

pub use enrichment::{Catalog, CatalogSearchAction};
pub use keywords::{FieldLookupAction, KeywordFilter, TitleAction, TranslateAction, Translation};
pub use links::{LinkDiscovery, LinkReport, LinkSelectors, PageCursor, modify_search_url};
pub use turl::{TurlAction, TurlSelectors};

/// One keyword on its way through TURL generation and enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordEntry {
    /// Keyword typed into the research search box.
    pub keyword: String,
    /// Keyword typed into the native-language catalogs.
    pub native_keyword: String,
    pub listing_link: String,
}

/// Timings shared by the browser-driven stages.
#[derive(Debug, Clone, Copy)]
pub struct PageTimings {
    pub navigation: std::time::Duration,
    pub element: std::time::Duration,
    /// Short pause between UI interactions.
    pub settle: std::time::Duration,
}

impl Default for PageTimings {
    fn default() -> Self {
        use std::time::Duration;
        Self {
            navigation: Duration::from_secs(120),
            element: Duration::from_secs(60),
            settle: Duration::from_secs(1),
        }
    }
}

impl PageTimings {
    /// All waits short and no settling, for scripted pages.
    pub fn immediate() -> Self {
        use std::time::Duration;
        Self {
            navigation: Duration::from_secs(1),
            element: Duration::from_secs(1),
            settle: Duration::ZERO,
        }
    }
}

/// Category switch on the research search panel.
pub(crate) const RESEARCH_TOGGLE: &str = concat!(
    "input[aria-labelledby='category-selector-panel__right-switch-label']",
    "[type='checkbox'][role='switch'].switch__control",
);

/// Second entry of the research date dropdown.
pub(crate) const RESEARCH_DATE_OPTION: &str = concat!(
    ".search-panel .search-input-panel__date-dropdown .menu-button__button",
    " + span > div > div:nth-of-type(2)",
);

const CHROME_ERROR_PREFIX: &str = "chrome-error://chromewebdata/";

/// A captured URL must not be the browser's own error page.
pub(crate) fn checked_url(url: String) -> Result<String, TaskError> {
    if url.contains(CHROME_ERROR_PREFIX) {
        Err(TaskError::Transient(format!("browser error page instead of results: {url}")))
    } else if url.is_empty() {
        Err(TaskError::Transient("page has no URL".into()))
    } else {
        Ok(url)
    }
}

// ── Output sink ─────────────────────────────────────────────────────

/// Which output column a stage fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Turl,
    MercariUrl,
    YahooUrl,
}

impl RecordField {
    pub fn apply(self, record: &mut OutputRecord, entry: &KeywordEntry, url: &str) {
        match self {
            Self::Turl => {
                record.keyword = entry.keyword.clone();
                record.native_keyword = entry.native_keyword.clone();
                record.listing_link = entry.listing_link.clone();
                record.turl = Some(url.to_string());
            }
            Self::MercariUrl => record.mercari_url = Some(url.to_string()),
            Self::YahooUrl => record.yahoo_url = Some(url.to_string()),
        }
    }
}

/// Writes each captured URL into the output store and flushes.
pub struct RecordSink {
    store: Arc<OutputStore>,
    field: RecordField,
}

impl RecordSink {
    pub fn new(store: Arc<OutputStore>, field: RecordField) -> Self {
        Self { store, field }
    }
}

#[async_trait]
impl TaskSink<KeywordEntry, String> for RecordSink {
    async fn accept(&self, task: &Task<KeywordEntry>, output: &String) {
        let field = self.field;
        self.store
            .upsert(task.original_index, |record| field.apply(record, &task.payload, output))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> KeywordEntry {
        KeywordEntry {
            keyword: "CSM OOO DRIVER".into(),
            native_keyword: "CSMオーズドライバー".into(),
            listing_link: "https://www.ebay.com/itm/1".into(),
        }
    }

    #[test]
    fn chrome_error_pages_are_transient() {
        let err = checked_url("chrome-error://chromewebdata/".into()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            checked_url("https://jp.mercari.com/search?keyword=x".into()).unwrap(),
            "https://jp.mercari.com/search?keyword=x"
        );
    }

    #[tokio::test]
    async fn sinks_fill_disjoint_columns() {
        let store = Arc::new(OutputStore::in_memory());
        let task = Task::new(4, entry());

        RecordSink::new(store.clone(), RecordField::Turl)
            .accept(&task, &"https://turl".to_string())
            .await;
        RecordSink::new(store.clone(), RecordField::YahooUrl)
            .accept(&task, &"https://yahoo".to_string())
            .await;

        let record = store.get(4).unwrap();
        assert_eq!(record.keyword, "CSM OOO DRIVER");
        assert_eq!(record.turl.as_deref(), Some("https://turl"));
        assert_eq!(record.yahoo_url.as_deref(), Some("https://yahoo"));
        assert!(record.mercari_url.is_none());
        assert_eq!(store.len(), 1);
    }
}
