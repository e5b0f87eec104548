//! Browser session capability.
//!
//! A `Session` is one exclusively-owned page driven by a worker. Concrete
//! drivers live in `browser`; stage actions and the worker pool only ever
//! see these traits, so tests swap in scripted sessions.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::identity::{Cookie, Identity};

/// When a navigation counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    DomContentLoaded,
    NetworkIdle,
}

/// One browser page owned by a single worker.
///
/// Every waiting operation takes its own timeout and reports expiry as
/// `SessionError::Timeout`.
#[async_trait]
pub trait Session: Send {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<(), SessionError>;

    /// Reload the current page.
    async fn reload(&mut self, wait: WaitCondition, timeout: Duration) -> Result<(), SessionError>;

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Wait until any of `selectors` matches; returns the index of the first match.
    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<usize, SessionError>;

    /// Wait for the page URL to change from what it was when called.
    async fn wait_for_navigation(&mut self, timeout: Duration) -> Result<(), SessionError>;

    /// Race a navigation against `selector` appearing in place.
    ///
    /// Returns `true` when the selector showed up first.
    async fn wait_for_navigation_or(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, SessionError>;

    async fn click(&mut self, selector: &str) -> Result<(), SessionError>;

    /// Clear the input at `selector` and type `text` into it.
    async fn type_text(&mut self, selector: &str, text: &str) -> Result<(), SessionError>;

    async fn press_enter(&mut self, selector: &str) -> Result<(), SessionError>;

    /// Trimmed text of the first match, `None` when nothing matches.
    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError>;

    /// Value of `attribute` on every match, skipping elements without it.
    async fn read_attributes(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Vec<String>, SessionError>;

    /// For every `container` match, the trimmed text of the first match of
    /// each of `parts` inside it (empty when a part is missing).
    async fn read_fields(
        &mut self,
        container: &str,
        parts: &[&str],
    ) -> Result<Vec<Vec<String>>, SessionError>;

    /// Attribute of the first match; outer `None` means no element matched.
    async fn attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<Option<String>>, SessionError>;

    async fn current_url(&mut self) -> Result<String, SessionError>;

    async fn cookies(&mut self) -> Result<Vec<Cookie>, SessionError>;

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), SessionError>;

    /// Release the page. Safe to call more than once.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens sessions bound to an identity's proxy, fingerprint, and cookies.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, SessionError>;

    /// Open `count` sessions for one pool. Drivers that can share a browser
    /// process across pages override this.
    async fn open_many(
        &self,
        identity: &Identity,
        count: usize,
    ) -> Result<Vec<Box<dyn Session>>, SessionError> {
        let mut sessions = Vec::with_capacity(count);
        for _ in 0..count {
            match self.open(identity).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    close_all(&mut sessions).await;
                    return Err(e);
                }
            }
        }
        Ok(sessions)
    }
}

/// Close every session, logging rather than propagating failures.
pub async fn close_all(sessions: &mut [Box<dyn Session>]) {
    for session in sessions.iter_mut() {
        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close session");
        }
    }
}

// ── Rate-limit detection ────────────────────────────────────────────

/// Inspects the current page for a "stop for today" notice.
#[async_trait]
pub trait RateLimitDetector: Send + Sync {
    /// `Some(notice)` when the page tells this identity to stop.
    async fn detect(&self, session: &mut dyn Session) -> Result<Option<String>, SessionError>;
}

/// Detects a notice element containing a fixed phrase.
#[derive(Debug, Clone)]
pub struct TextNoticeDetector {
    pub selector: String,
    pub text: String,
}

impl Default for TextNoticeDetector {
    fn default() -> Self {
        Self {
            selector: ".alert.al-p1".into(),
            text: "try again tomorrow.".into(),
        }
    }
}

#[async_trait]
impl RateLimitDetector for TextNoticeDetector {
    async fn detect(&self, session: &mut dyn Session) -> Result<Option<String>, SessionError> {
        let notice = session.read_text(&self.selector).await?;
        Ok(notice.filter(|text| text.contains(&self.text)))
    }
}

// ── Detached sessions ───────────────────────────────────────────────

/// Factory for workers that never touch a browser (e.g. translation).
///
/// Every page operation fails with `SessionError::Unsupported`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSessions;

struct DetachedSession;

fn unsupported<T>(operation: &str) -> Result<T, SessionError> {
    Err(SessionError::Unsupported(operation.to_string()))
}

#[async_trait]
impl Session for DetachedSession {
    async fn navigate(
        &mut self,
        _: &str,
        _: WaitCondition,
        _: Duration,
    ) -> Result<(), SessionError> {
        unsupported("navigate")
    }

    async fn reload(&mut self, _: WaitCondition, _: Duration) -> Result<(), SessionError> {
        unsupported("reload")
    }

    async fn wait_for(&mut self, _: &str, _: Duration) -> Result<(), SessionError> {
        unsupported("wait_for")
    }

    async fn wait_for_any(&mut self, _: &[&str], _: Duration) -> Result<usize, SessionError> {
        unsupported("wait_for_any")
    }

    async fn wait_for_navigation(&mut self, _: Duration) -> Result<(), SessionError> {
        unsupported("wait_for_navigation")
    }

    async fn wait_for_navigation_or(&mut self, _: &str, _: Duration) -> Result<bool, SessionError> {
        unsupported("wait_for_navigation_or")
    }

    async fn click(&mut self, _: &str) -> Result<(), SessionError> {
        unsupported("click")
    }

    async fn type_text(&mut self, _: &str, _: &str) -> Result<(), SessionError> {
        unsupported("type_text")
    }

    async fn press_enter(&mut self, _: &str) -> Result<(), SessionError> {
        unsupported("press_enter")
    }

    async fn read_text(&mut self, _: &str) -> Result<Option<String>, SessionError> {
        unsupported("read_text")
    }

    async fn read_attributes(&mut self, _: &str, _: &str) -> Result<Vec<String>, SessionError> {
        unsupported("read_attributes")
    }

    async fn read_fields(&mut self, _: &str, _: &[&str]) -> Result<Vec<Vec<String>>, SessionError> {
        unsupported("read_fields")
    }

    async fn attribute(
        &mut self,
        _: &str,
        _: &str,
    ) -> Result<Option<Option<String>>, SessionError> {
        unsupported("attribute")
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        unsupported("current_url")
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, SessionError> {
        Ok(Vec::new())
    }

    async fn set_cookies(&mut self, _: &[Cookie]) -> Result<(), SessionError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[async_trait]
impl SessionFactory for DetachedSessions {
    async fn open(&self, _identity: &Identity) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(DetachedSession))
    }
}
