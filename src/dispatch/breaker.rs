//! Per-identity circuit breakers for one run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::warn;

use crate::identity::Identity;

/// Latch set once when an identity is told to stop. Never reset.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    tripped: AtomicBool,
}

impl CircuitBreaker {
    /// Trip the breaker. Returns `true` only for the call that tripped it.
    pub fn trip(&self) -> bool {
        self.tripped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// All breakers of a run, keyed by identity id.
#[derive(Debug, Default)]
pub struct BreakerBoard {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The breaker for `identity_id`, created on first use.
    pub fn breaker(&self, identity_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(identity_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn trip(&self, identity_id: &str) {
        if self.breaker(identity_id).trip() {
            warn!(identity = %identity_id, "Circuit breaker tripped");
        }
    }

    pub fn is_tripped(&self, identity_id: &str) -> bool {
        self.breakers
            .get(identity_id)
            .is_some_and(|b| b.is_tripped())
    }

    /// Identities whose breaker has not tripped, in input order.
    pub fn healthy(&self, identities: &[Identity]) -> Vec<Identity> {
        identities
            .iter()
            .filter(|i| !self.is_tripped(&i.id))
            .cloned()
            .collect()
    }

    /// Ids of tripped identities, sorted.
    pub fn tripped(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.value().is_tripped())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }
}
