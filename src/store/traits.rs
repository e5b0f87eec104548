//! Durable snapshot sinks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::StoreError;
use crate::store::output::OutputRecord;

/// Writes a full output snapshot to durable storage.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn flush(&self, snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError>;
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl PersistentStore for NullStore {
    async fn flush(&self, _snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Flushes to every inner store; reports the first failure after trying all.
pub struct FanoutStore {
    stores: Vec<Arc<dyn PersistentStore>>,
}

impl FanoutStore {
    pub fn new(stores: Vec<Arc<dyn PersistentStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl PersistentStore for FanoutStore {
    async fn flush(&self, snapshot: &[(usize, OutputRecord)]) -> Result<(), StoreError> {
        let mut first_error = None;
        for store in &self.stores {
            if let Err(e) = store.flush(snapshot).await {
                warn!(error = %e, "Snapshot sink failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
