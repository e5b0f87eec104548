//! Link discovery over the paginated research results.
//!
//! Pagination is a single cursor shared across identities: one identity
//! walks pages until the "next" button is disabled, and if it gives up at
//! page P the next healthy identity resumes from page P.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{Instrument, error, info, info_span, warn};

use crate::dispatch::{BreakerBoard, LocalRetry};
use crate::error::SessionError;
use crate::identity::Identity;
use crate::session::{RateLimitDetector, Session, SessionFactory, TextNoticeDetector, WaitCondition};
use crate::stages::{PageTimings, RESEARCH_DATE_OPTION, RESEARCH_TOGGLE};

const PAGE_SIZE: u32 = 50;

static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"offset=\d+").unwrap());
static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"limit=\d+").unwrap());

/// Point a research URL at `page` (1-based) by rewriting `offset` and `limit`.
///
/// Parameters missing from the URL are appended.
pub fn modify_search_url(search_url: &str, page: u32) -> String {
    let offset = format!("offset={}", page.saturating_sub(1) * PAGE_SIZE);
    let limit = format!("limit={PAGE_SIZE}");

    let mut url = search_url.to_string();
    for (re, replacement) in [(&*OFFSET_RE, &offset), (&*LIMIT_RE, &limit)] {
        if re.is_match(&url) {
            url = re.replace(&url, replacement.as_str()).into_owned();
        } else {
            let sep = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{sep}{replacement}");
        }
    }
    url
}

// ── Cursor ──────────────────────────────────────────────────────────

/// Page counter for one discovery run. Zero means the last page was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    page: u32,
    visited: Vec<u32>,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            page: 1,
            visited: Vec::new(),
        }
    }
}

impl PageCursor {
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn is_finished(&self) -> bool {
        self.page == 0
    }

    /// Pages whose links were collected, in order.
    pub fn visited(&self) -> &[u32] {
        &self.visited
    }

    /// Where an identity starting now should begin.
    pub fn resume_url(&self, search_url: &str) -> String {
        if self.page <= 1 {
            search_url.to_string()
        } else {
            modify_search_url(search_url, self.page)
        }
    }

    fn collected(&mut self) {
        self.visited.push(self.page);
    }

    fn advance(&mut self) {
        self.page += 1;
    }

    fn finish(&mut self) {
        self.page = 0;
    }
}

// ── Selectors ───────────────────────────────────────────────────────

/// Research page selectors.
#[derive(Debug, Clone)]
pub struct LinkSelectors {
    pub toggle: String,
    pub date_option: String,
    pub research_button: String,
    pub row_link: String,
    pub notice: String,
    pub next_button: String,
    /// Notice text that means "refresh and try again".
    pub server_busy: String,
}

impl Default for LinkSelectors {
    fn default() -> Self {
        Self {
            toggle: RESEARCH_TOGGLE.into(),
            date_option: RESEARCH_DATE_OPTION.into(),
            research_button: "div.search-input-panel > button.search-input-panel__research-button"
                .into(),
            row_link: "a.research-table-row__link-row-anchor".into(),
            notice: ".page-notice__main h2".into(),
            next_button: "button.pagination__next".into(),
            server_busy: "Our server".into(),
        }
    }
}

// ── Discovery ───────────────────────────────────────────────────────

/// What link discovery produced.
#[derive(Debug, Clone, Default)]
pub struct LinkReport {
    /// Unique links in first-seen order.
    pub links: Vec<String>,
    pub cursor: PageCursor,
    /// Identities that opened a session, in order.
    pub identities_used: Vec<String>,
}

impl LinkReport {
    pub fn is_complete(&self) -> bool {
        self.cursor.is_finished()
    }
}

/// Why one identity stopped walking pages.
enum Stop {
    LastPage,
    Abandoned(String),
    RateLimited(String),
}

/// Walks the research result pages across identities.
pub struct LinkDiscovery {
    factory: Arc<dyn SessionFactory>,
    breakers: Arc<BreakerBoard>,
    detector: Arc<dyn RateLimitDetector>,
    selectors: LinkSelectors,
    timings: PageTimings,
    page_settle: Duration,
    max_refreshes: u32,
    results_retry: LocalRetry,
}

impl LinkDiscovery {
    pub fn new(factory: Arc<dyn SessionFactory>, breakers: Arc<BreakerBoard>) -> Self {
        Self {
            factory,
            breakers,
            detector: Arc::new(TextNoticeDetector::default()),
            selectors: LinkSelectors::default(),
            timings: PageTimings::default(),
            page_settle: Duration::from_secs(5),
            max_refreshes: 3,
            results_retry: LocalRetry::default(),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn RateLimitDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_selectors(mut self, selectors: LinkSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Override waits; `page_settle` is the pause before reading each page.
    pub fn with_timings(mut self, timings: PageTimings, page_settle: Duration) -> Self {
        self.timings = timings;
        self.page_settle = page_settle;
        self
    }

    /// Budget for waiting on the result rows before the identity gives up.
    pub fn with_results_retry(mut self, retry: LocalRetry) -> Self {
        self.results_retry = retry;
        self
    }

    /// Collect every listing link reachable from `search_url`.
    ///
    /// Identities are tried in order, skipping tripped breakers, until the
    /// last page has been read or no identity is left.
    pub async fn discover(&self, search_url: &str, identities: &[Identity]) -> LinkReport {
        let mut report = LinkReport::default();
        let mut seen = HashSet::new();

        for identity in identities {
            if report.cursor.is_finished() {
                break;
            }
            if self.breakers.is_tripped(&identity.id) {
                continue;
            }

            let url = report.cursor.resume_url(search_url);
            let span = info_span!("identity", identity = %identity.id);
            let mut session = match self.factory.open(identity).instrument(span.clone()).await {
                Ok(session) => session,
                Err(e) => {
                    error!(identity = %identity.id, error = %e, "Failed to open session");
                    continue;
                }
            };
            report.identities_used.push(identity.id.clone());

            let mut links = Vec::new();
            let stop = self
                .walk(session.as_mut(), &url, &mut report.cursor, &mut links)
                .instrument(span)
                .await;
            if let Err(e) = session.close().await {
                warn!(identity = %identity.id, error = %e, "Failed to close session");
            }

            let found = links.len();
            for link in links {
                if seen.insert(link.clone()) {
                    report.links.push(link);
                }
            }

            match stop {
                Stop::LastPage => {
                    info!(identity = %identity.id, found, "Reached the last page");
                }
                Stop::Abandoned(reason) => {
                    warn!(
                        identity = %identity.id,
                        page = report.cursor.page(),
                        reason = %reason,
                        "Identity abandoned pagination"
                    );
                }
                Stop::RateLimited(notice) => {
                    warn!(
                        identity = %identity.id,
                        notice = %notice,
                        "Rate limited during link discovery"
                    );
                    self.breakers.trip(&identity.id);
                }
            }
        }

        if report.cursor.is_finished() {
            info!(
                links = report.links.len(),
                pages = report.cursor.visited().len(),
                "Link discovery complete"
            );
        } else {
            warn!(
                links = report.links.len(),
                page = report.cursor.page(),
                "Link discovery ran out of identities"
            );
        }
        report
    }

    /// Run the research search at `url` and page through the results.
    async fn walk(
        &self,
        session: &mut dyn Session,
        url: &str,
        cursor: &mut PageCursor,
        links: &mut Vec<String>,
    ) -> Stop {
        match self.start_search(session, url).await {
            Ok(None) => {}
            Ok(Some(notice)) => return Stop::RateLimited(notice),
            Err(e) => return Stop::Abandoned(e.to_string()),
        }

        loop {
            if let Err(stop) = self.await_results(session).await {
                return stop;
            }
            tokio::time::sleep(self.page_settle).await;

            match session.read_attributes(&self.selectors.row_link, "href").await {
                Ok(found) => links.extend(found),
                Err(e) => return Stop::Abandoned(e.to_string()),
            }
            cursor.collected();

            match self.has_next(session).await {
                Ok(false) => {
                    cursor.finish();
                    return Stop::LastPage;
                }
                Ok(true) => {}
                Err(e) => return Stop::Abandoned(e.to_string()),
            }

            cursor.advance();
            info!(page = cursor.page(), "Moving to next page");
            let moved = match session.click(&self.selectors.next_button).await {
                Ok(()) => session.wait_for_navigation(self.timings.navigation).await,
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                return Stop::Abandoned(format!("next page navigation failed: {e}"));
            }
        }
    }

    /// Open the research page, set the filters, and submit.
    async fn start_search(
        &self,
        session: &mut dyn Session,
        url: &str,
    ) -> Result<Option<String>, SessionError> {
        session
            .navigate(url, WaitCondition::DomContentLoaded, self.timings.navigation)
            .await?;
        if let Some(notice) = self.detector.detect(session).await? {
            return Ok(Some(notice));
        }

        let s = &self.selectors;
        session.wait_for(&s.toggle, self.timings.element).await?;
        session.click(&s.toggle).await?;
        tokio::time::sleep(self.timings.settle).await;
        session.click(&s.date_option).await?;
        tokio::time::sleep(self.timings.settle * 2).await;
        session.click(&s.research_button).await?;
        Ok(None)
    }

    /// Wait for result rows, refreshing on a busy-server notice.
    async fn await_results(&self, session: &mut dyn Session) -> Result<(), Stop> {
        let s = &self.selectors;
        let mut refreshes = 0;
        loop {
            let matched = self
                .wait_for_results(session)
                .await
                .map_err(|e| Stop::Abandoned(format!("results never loaded: {e}")))?;
            if matched == 0 {
                return Ok(());
            }

            let notice = session
                .read_text(&s.notice)
                .await
                .map_err(|e| Stop::Abandoned(e.to_string()))?
                .unwrap_or_default();
            if !notice.contains(&s.server_busy) {
                return Err(Stop::Abandoned(format!("unexpected notice: {notice}")));
            }
            if refreshes >= self.max_refreshes {
                return Err(Stop::Abandoned(format!(
                    "server still busy after {refreshes} refreshes"
                )));
            }
            refreshes += 1;
            warn!(attempt = refreshes, "Server failed to respond, refreshing");
            session
                .reload(WaitCondition::DomContentLoaded, self.timings.navigation)
                .await
                .map_err(|e| Stop::Abandoned(e.to_string()))?;
        }
    }

    /// Wait for result rows or a notice, again after a pause if neither shows.
    async fn wait_for_results(&self, session: &mut dyn Session) -> Result<usize, SessionError> {
        let s = &self.selectors;
        let attempts = self.results_retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match session
                .wait_for_any(&[&s.row_link, &s.notice], self.timings.navigation)
                .await
            {
                Ok(matched) => return Ok(matched),
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Result rows not loaded, waiting again");
                    tokio::time::sleep(self.results_retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn has_next(&self, session: &mut dyn Session) -> Result<bool, SessionError> {
        let next = &self.selectors.next_button;
        let Some(disabled) = session.attribute(next, "disabled").await? else {
            return Ok(false);
        };
        if disabled.is_some() {
            return Ok(false);
        }
        let aria = session.attribute(next, "aria-disabled").await?.flatten();
        Ok(aria.as_deref() != Some("true"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testing::{ScriptedFactory, ScriptedSession};

    const SEARCH: &str =
        "https://www.ebay.com/sh/research?keywords=x&offset=0&limit=50&tabName=SOLD";

    fn results_page() -> ScriptedSession {
        let s = LinkSelectors::default();
        ScriptedSession::default()
            .with_present(&s.toggle)
            .with_present(&s.date_option)
            .with_present(&s.research_button)
            .with_attributes(
                &s.row_link,
                "href",
                &["https://item/1", "https://item/2", "https://item/1"],
            )
    }

    fn discovery(factory: ScriptedFactory, breakers: Arc<BreakerBoard>) -> LinkDiscovery {
        LinkDiscovery::new(Arc::new(factory), breakers)
            .with_timings(PageTimings::immediate(), Duration::ZERO)
            .with_results_retry(LocalRetry {
                attempts: 2,
                delay: Duration::ZERO,
            })
    }

    #[test]
    fn offset_and_limit_follow_the_page() {
        assert_eq!(
            modify_search_url(SEARCH, 3),
            "https://www.ebay.com/sh/research?keywords=x&offset=100&limit=50&tabName=SOLD"
        );
        assert_eq!(
            modify_search_url("https://r/search?q=x", 2),
            "https://r/search?q=x&offset=50&limit=50"
        );
    }

    #[test]
    fn cursor_resumes_from_its_page() {
        let mut cursor = PageCursor::default();
        assert_eq!(cursor.resume_url(SEARCH), SEARCH);
        cursor.advance();
        assert!(cursor.resume_url(SEARCH).contains("offset=50"));
    }

    #[tokio::test]
    async fn pagination_stops_when_next_is_disabled() {
        let next = LinkSelectors::default().next_button;
        let page = results_page().with_attribute_sequence(
            &next,
            "aria-disabled",
            &[Some("false"), Some("false"), Some("true")],
        );
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(page), breakers)
            .discover(SEARCH, &[Identity::new("a")])
            .await;

        assert!(report.is_complete());
        assert_eq!(report.cursor.visited(), &[1, 2, 3]);
        assert_eq!(report.cursor.page(), 0);
        let unique: HashSet<_> = report.links.iter().collect();
        assert_eq!(unique.len(), report.links.len());
        assert_eq!(report.links.len(), 2);
        assert_eq!(report.identities_used, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn missing_next_button_is_the_last_page() {
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(results_page()), breakers)
            .discover(SEARCH, &[Identity::new("a"), Identity::new("b")])
            .await;
        assert!(report.is_complete());
        assert_eq!(report.identities_used.len(), 1);
    }

    #[tokio::test]
    async fn busy_server_is_refreshed_then_abandoned() {
        let s = LinkSelectors::default();
        let page = ScriptedSession::default()
            .with_present(&s.toggle)
            .with_present(&s.date_option)
            .with_present(&s.research_button)
            .with_text(&s.notice, "Our server failed to respond");
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(page), breakers.clone())
            .discover(SEARCH, &[Identity::new("a"), Identity::new("b")])
            .await;

        assert!(!report.is_complete());
        assert_eq!(report.cursor.page(), 1);
        assert!(report.links.is_empty());
        // Both identities tried; neither is broken by a busy server.
        assert_eq!(report.identities_used.len(), 2);
        assert!(breakers.tripped().is_empty());
    }

    #[tokio::test]
    async fn slow_results_get_a_second_wait() {
        let row_link = LinkSelectors::default().row_link;
        let page = results_page().with_late(&row_link, 1);
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(page), breakers)
            .discover(SEARCH, &[Identity::new("a")])
            .await;

        assert!(report.is_complete());
        assert_eq!(report.cursor.visited(), &[1]);
        assert_eq!(report.links, ["https://item/1", "https://item/2"]);
    }

    #[tokio::test]
    async fn results_missing_twice_abandon_the_identity() {
        let row_link = LinkSelectors::default().row_link;
        let page = results_page().with_late(&row_link, 2);
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(page), breakers.clone())
            .discover(SEARCH, &[Identity::new("a")])
            .await;

        assert!(!report.is_complete());
        assert_eq!(report.cursor.page(), 1);
        assert!(report.cursor.visited().is_empty());
        assert!(report.links.is_empty());
        assert!(breakers.tripped().is_empty());
    }

    #[tokio::test]
    async fn tripped_and_unopenable_identities_are_skipped() {
        let mut factory = ScriptedFactory::new(results_page());
        factory.refuse.insert("b".into());
        let breakers = Arc::new(BreakerBoard::new());
        breakers.trip("a");

        let report = discovery(factory, breakers)
            .discover(SEARCH, &[Identity::new("a"), Identity::new("b"), Identity::new("c")])
            .await;
        assert!(report.is_complete());
        assert_eq!(report.identities_used, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn daily_limit_trips_the_breaker() {
        let page = results_page().with_text(".alert.al-p1", "Please try again tomorrow.");
        let breakers = Arc::new(BreakerBoard::new());
        let report = discovery(ScriptedFactory::new(page), breakers.clone())
            .discover(SEARCH, &[Identity::new("a")])
            .await;
        assert!(!report.is_complete());
        assert!(breakers.is_tripped("a"));
    }
}
