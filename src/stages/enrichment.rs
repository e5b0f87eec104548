//! Catalog enrichment: search a native-language marketplace for each
//! keyword and keep the search URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatch::{StageAction, Task};
use crate::error::TaskError;
use crate::session::{RateLimitDetector, Session, TextNoticeDetector, WaitCondition};
use crate::stages::{KeywordEntry, RecordField, checked_url};

/// The external catalogs searched during enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Catalog {
    Mercari,
    Yahoo,
}

impl Catalog {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mercari => "mercari",
            Self::Yahoo => "yahoo",
        }
    }

    pub fn search_input(self) -> &'static str {
        match self {
            Self::Mercari => "input.sc-f808c747-2.fMmsZy",
            Self::Yahoo => "#yschsp",
        }
    }

    /// Output column this catalog fills.
    pub fn field(self) -> RecordField {
        match self {
            Self::Mercari => RecordField::MercariUrl,
            Self::Yahoo => RecordField::YahooUrl,
        }
    }
}

/// Searches one catalog for a keyword's native form.
pub struct CatalogSearchAction {
    catalog: Catalog,
    base_url: String,
    search_input: String,
    navigation: Duration,
    input_wait: Duration,
    detector: Arc<dyn RateLimitDetector>,
}

impl CatalogSearchAction {
    pub fn new(catalog: Catalog, base_url: impl Into<String>) -> Self {
        Self {
            catalog,
            base_url: base_url.into(),
            search_input: catalog.search_input().to_string(),
            navigation: Duration::from_secs(60),
            input_wait: Duration::from_secs(30),
            detector: Arc::new(TextNoticeDetector::default()),
        }
    }

    pub fn with_search_input(mut self, selector: impl Into<String>) -> Self {
        self.search_input = selector.into();
        self
    }

    pub fn with_timeouts(mut self, navigation: Duration, input_wait: Duration) -> Self {
        self.navigation = navigation;
        self.input_wait = input_wait;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn RateLimitDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn catalog(&self) -> Catalog {
        self.catalog
    }
}

#[async_trait]
impl StageAction for CatalogSearchAction {
    type Payload = KeywordEntry;
    type Output = String;

    fn name(&self) -> &str {
        self.catalog.name()
    }

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<KeywordEntry>,
    ) -> Result<String, TaskError> {
        session
            .navigate(&self.base_url, WaitCondition::NetworkIdle, self.navigation)
            .await?;
        if let Some(notice) = self.detector.detect(session).await? {
            return Err(TaskError::RateLimited(notice));
        }

        session.wait_for(&self.search_input, self.input_wait).await?;
        session
            .type_text(&self.search_input, &task.payload.native_keyword)
            .await?;
        session.press_enter(&self.search_input).await?;
        session.wait_for_navigation(self.navigation).await?;

        let url = checked_url(session.current_url().await?)?;
        debug!(
            catalog = self.catalog.name(),
            index = task.original_index,
            keyword = %task.payload.native_keyword,
            url = %url,
            "Captured catalog URL"
        );
        Ok(url)
    }
}
