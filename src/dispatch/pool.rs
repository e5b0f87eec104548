//! Per-identity worker pool.
//!
//! K workers, one session each, drain a shared queue. A rate limit trips
//! the identity's breaker and evacuates whatever is still queued.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::PoolSettings;
use crate::dispatch::breaker::CircuitBreaker;
use crate::dispatch::distributor::WorkAssignment;
use crate::dispatch::queue::TaskQueue;
use crate::dispatch::task::Task;
use crate::dispatch::{StageAction, TaskSink};
use crate::session::{Session, SessionFactory, close_all};

/// What one pool did with its assignment.
#[derive(Debug, Clone)]
pub struct PoolReport<P, O> {
    pub identity: String,
    pub succeeded: Vec<(usize, O)>,
    pub failed: Vec<Task<P>>,
    /// Whether this pool tripped the identity's breaker.
    pub broken: bool,
}

impl<P, O> PoolReport<P, O> {
    fn empty(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            broken: false,
        }
    }
}

struct WorkerOutcome<P, O> {
    succeeded: Vec<(usize, O)>,
    failed: Vec<Task<P>>,
    broken: bool,
}

/// Runs one stage action over one identity's assignment.
pub struct WorkerPool<A: StageAction> {
    action: Arc<A>,
    factory: Arc<dyn SessionFactory>,
    settings: PoolSettings,
    sink: Option<Arc<dyn TaskSink<A::Payload, A::Output>>>,
}

impl<A: StageAction> WorkerPool<A> {
    pub fn new(action: Arc<A>, factory: Arc<dyn SessionFactory>, settings: PoolSettings) -> Self {
        Self {
            action,
            factory,
            settings,
            sink: None,
        }
    }

    /// Report every success to `sink` before the worker paces and moves on.
    pub fn with_sink(mut self, sink: Arc<dyn TaskSink<A::Payload, A::Output>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    /// Work through `assignment` with up to K concurrent workers.
    ///
    /// Every task of the assignment ends up in exactly one of `succeeded`
    /// or `failed`. Sessions are closed before returning.
    pub async fn run(
        &self,
        assignment: WorkAssignment<A::Payload>,
        breaker: Arc<CircuitBreaker>,
    ) -> PoolReport<A::Payload, A::Output> {
        let identity = assignment.identity;
        let mut report = PoolReport::empty(&identity.id);
        if assignment.tasks.is_empty() {
            return report;
        }
        if breaker.is_tripped() {
            report.failed = assignment.tasks;
            return report;
        }

        let workers = self.settings.workers_per_identity.max(1).min(assignment.tasks.len());
        let mut sessions = match self.factory.open_many(&identity, workers).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(identity = %identity.id, error = %e, "Failed to open sessions");
                report.failed = assignment.tasks;
                return report;
            }
        };

        info!(
            identity = %identity.id,
            stage = self.action.name(),
            tasks = assignment.tasks.len(),
            workers = sessions.len(),
            "Pool started"
        );

        let queue = TaskQueue::new(assignment.tasks);
        let outcomes = join_all(sessions.iter_mut().enumerate().map(|(worker, session)| {
            self.worker(session.as_mut(), &queue, &breaker)
                .instrument(info_span!("worker", worker))
        }))
        .await;
        close_all(&mut sessions).await;

        for outcome in outcomes {
            report.succeeded.extend(outcome.succeeded);
            report.failed.extend(outcome.failed);
            report.broken |= outcome.broken;
        }
        // Anything still queued (no worker left to pull it) counts as failed.
        report.failed.extend(queue.drain().await);

        info!(
            identity = %identity.id,
            stage = self.action.name(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            broken = report.broken,
            "Pool finished"
        );
        report
    }

    async fn worker(
        &self,
        session: &mut dyn Session,
        queue: &TaskQueue<A::Payload>,
        breaker: &CircuitBreaker,
    ) -> WorkerOutcome<A::Payload, A::Output> {
        let mut outcome = WorkerOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
            broken: false,
        };

        while !breaker.is_tripped() {
            let Some(task) = queue.pop().await else {
                break;
            };

            let result = self
                .settings
                .local_retry
                .execute(self.action.as_ref(), session, &task, self.settings.task_timeout)
                .await;

            match result {
                Ok(output) => {
                    debug!(
                        index = task.original_index,
                        stage = self.action.name(),
                        "Task succeeded"
                    );
                    if let Some(sink) = &self.sink {
                        sink.accept(&task, &output).await;
                    }
                    outcome.succeeded.push((task.original_index, output));
                    tokio::time::sleep(self.settings.pacing).await;
                }
                Err(e) if e.is_rate_limit() => {
                    warn!(
                        index = task.original_index,
                        error = %e,
                        "Rate limited, evacuating queue"
                    );
                    breaker.trip();
                    outcome.broken = true;
                    outcome.failed.push(task);
                    outcome.failed.extend(queue.drain().await);
                    break;
                }
                Err(e) => {
                    warn!(index = task.original_index, error = %e, "Task failed");
                    outcome.failed.push(task);
                }
            }
        }
        outcome
    }
}
