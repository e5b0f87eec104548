//! Credential check: which identities still log in with their saved cookies.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::identity::Identity;
use crate::session::{SessionFactory, WaitCondition};

/// Element only shown to a logged-in user on the check page.
pub const LOGGED_IN_MARKER: &str = ".search-input-panel__research-button";

/// Opens one session per identity, installs its cookies, and waits for
/// the logged-in marker on the check page.
pub struct CredentialChecker {
    factory: Arc<dyn SessionFactory>,
    check_url: String,
    marker: String,
    attempts: u32,
    backoff_unit: Duration,
    chunk_size: usize,
    navigate_timeout: Duration,
    marker_timeout: Duration,
}

impl CredentialChecker {
    pub fn new(factory: Arc<dyn SessionFactory>, check_url: impl Into<String>) -> Self {
        Self {
            factory,
            check_url: check_url.into(),
            marker: LOGGED_IN_MARKER.to_string(),
            attempts: 3,
            backoff_unit: Duration::from_secs(2),
            chunk_size: 5,
            navigate_timeout: Duration::from_secs(120),
            marker_timeout: Duration::from_secs(30),
        }
    }

    /// Delay unit between attempts; attempt `n` waits `n * unit`.
    pub fn with_backoff(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Identities that passed, in input order.
    ///
    /// Identities without saved cookies are skipped without opening a
    /// session. Checks run concurrently in chunks.
    pub async fn healthy(&self, identities: &[Identity]) -> Vec<Identity> {
        let mut passed = Vec::new();
        for chunk in identities.chunks(self.chunk_size.max(1)) {
            let results = join_all(chunk.iter().map(|identity| self.check(identity))).await;
            passed.extend(
                chunk
                    .iter()
                    .zip(results)
                    .filter(|(_, ok)| *ok)
                    .map(|(identity, _)| identity.clone()),
            );
        }
        info!(checked = identities.len(), healthy = passed.len(), "Credential check finished");
        passed
    }

    async fn check(&self, identity: &Identity) -> bool {
        if identity.cookies.is_empty() {
            info!(identity = %identity.id, "No cookies saved, skipping");
            return false;
        }

        for attempt in 1..=self.attempts {
            match self.attempt(identity).await {
                Ok(()) => {
                    info!(identity = %identity.id, attempt, "Logged in");
                    return true;
                }
                Err(e) => {
                    warn!(identity = %identity.id, attempt, error = %e, "Credential check failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff_unit * attempt).await;
                    }
                }
            }
        }
        false
    }

    async fn attempt(&self, identity: &Identity) -> Result<(), SessionError> {
        let mut session = self.factory.open(identity).await?;
        let result = async {
            session.set_cookies(&identity.cookies).await?;
            session
                .navigate(&self.check_url, WaitCondition::DomContentLoaded, self.navigate_timeout)
                .await?;
            session.wait_for(&self.marker, self.marker_timeout).await
        }
        .await;
        if let Err(e) = session.close().await {
            warn!(identity = %identity.id, error = %e, "Failed to close check session");
        }
        result
    }
}
