//! TURL generation: run a filtered research search per keyword and keep
//! the resulting URL.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::dispatch::{StageAction, Task};
use crate::error::TaskError;
use crate::session::{RateLimitDetector, Session, TextNoticeDetector, WaitCondition};
use crate::stages::{
    KeywordEntry, PageTimings, RESEARCH_DATE_OPTION, RESEARCH_TOGGLE, checked_url,
};

/// Research search form selectors.
#[derive(Debug, Clone)]
pub struct TurlSelectors {
    pub toggle: String,
    pub keyword_input: String,
    pub date_option: String,
    /// Notices shown in place of a navigation: a failed search or the daily limit.
    pub notice: String,
}

impl Default for TurlSelectors {
    fn default() -> Self {
        Self {
            toggle: RESEARCH_TOGGLE.into(),
            keyword_input: "#s0-1-0-0-20-2-11-13-3-8-1-0-0-1-4-3-0-0-10-4-17-textbox".into(),
            date_option: RESEARCH_DATE_OPTION.into(),
            notice: ".page-notice__main, .alert.al-p1".into(),
        }
    }
}

/// Drives the research form for one keyword and captures the URL.
pub struct TurlAction {
    base_url: String,
    selectors: TurlSelectors,
    timings: PageTimings,
    detector: Arc<dyn RateLimitDetector>,
}

impl TurlAction {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            selectors: TurlSelectors::default(),
            timings: PageTimings::default(),
            detector: Arc::new(TextNoticeDetector::default()),
        }
    }

    pub fn with_selectors(mut self, selectors: TurlSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_timings(mut self, timings: PageTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn RateLimitDetector>) -> Self {
        self.detector = detector;
        self
    }

    async fn check_limit(&self, session: &mut dyn Session) -> Result<(), TaskError> {
        match self.detector.detect(session).await? {
            Some(notice) => Err(TaskError::RateLimited(notice)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StageAction for TurlAction {
    type Payload = KeywordEntry;
    type Output = String;

    fn name(&self) -> &str {
        "turl"
    }

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<KeywordEntry>,
    ) -> Result<String, TaskError> {
        let s = &self.selectors;
        let t = &self.timings;

        session
            .navigate(&self.base_url, WaitCondition::NetworkIdle, t.navigation)
            .await?;
        self.check_limit(session).await?;

        session.wait_for(&s.toggle, t.navigation).await?;
        session.click(&s.toggle).await?;
        session.wait_for(&s.keyword_input, t.element).await?;

        tokio::time::sleep(t.settle).await;
        session.click(&s.date_option).await?;
        tokio::time::sleep(t.settle * 2).await;

        session.type_text(&s.keyword_input, &task.payload.keyword).await?;
        tokio::time::sleep(t.settle).await;
        session.press_enter(&s.keyword_input).await?;

        // Either the results load or the page shows a notice in place.
        session.wait_for_navigation_or(&s.notice, t.element).await?;
        self.check_limit(session).await?;

        let url = checked_url(session.current_url().await?)?;
        debug!(
            index = task.original_index,
            keyword = %task.payload.keyword,
            url = %url,
            "Captured TURL"
        );
        Ok(url)
    }
}
