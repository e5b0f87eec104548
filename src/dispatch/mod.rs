//! Task distribution, worker pools, and retry rounds.
//!
//! A stage hands its tasks to a [`RetryCoordinator`], which partitions them
//! over the healthy identities ([`distribute`]), runs one [`WorkerPool`] per
//! identity, and repeats over whatever failed until the round cap. Circuit
//! breakers ([`BreakerBoard`]) keep rate-limited identities out of every
//! later round of the run.

pub mod breaker;
pub mod coordinator;
pub mod distributor;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod task;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::session::Session;

pub use breaker::{BreakerBoard, CircuitBreaker};
pub use coordinator::{RetryCoordinator, StageReport};
pub use distributor::{WorkAssignment, distribute};
pub use pool::{PoolReport, WorkerPool};
pub use queue::TaskQueue;
pub use retry::LocalRetry;
pub use task::{FailedSet, Task, index_tasks};

/// The stage-specific work done for one task on one worker's session.
#[async_trait]
pub trait StageAction: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Short stage name used in logs.
    fn name(&self) -> &str;

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<Self::Payload>,
    ) -> Result<Self::Output, TaskError>;
}

/// Receives each success as it happens, before the worker moves on.
#[async_trait]
pub trait TaskSink<P, O>: Send + Sync {
    async fn accept(&self, task: &Task<P>, output: &O);
}
