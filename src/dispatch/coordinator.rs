//! Bounded retry rounds across identities.
//!
//! Round 1 distributes the stage input; each later round redistributes only
//! what failed (plus anything that went missing) over identities whose
//! breaker is still closed. Stops at the round cap.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{Instrument, Span, error, info, info_span, warn};

use crate::dispatch::breaker::BreakerBoard;
use crate::dispatch::distributor::distribute;
use crate::dispatch::pool::WorkerPool;
use crate::dispatch::task::{FailedSet, Task};
use crate::dispatch::StageAction;
use crate::error::DistributionError;
use crate::identity::Identity;

/// Outcome of one stage.
///
/// Every submitted index is in exactly one of `resolved` or `unresolved`.
#[derive(Debug, Clone)]
pub struct StageReport<P, O> {
    pub resolved: BTreeMap<usize, O>,
    pub unresolved: Vec<Task<P>>,
    pub rounds: u32,
    /// Identities whose breaker was tripped when the stage ended.
    pub broken: Vec<String>,
}

impl<P, O> StageReport<P, O> {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Drives a [`WorkerPool`] through up to `max_rounds` distribution rounds.
pub struct RetryCoordinator<A: StageAction> {
    pool: Arc<WorkerPool<A>>,
    breakers: Arc<BreakerBoard>,
    max_rounds: u32,
    span: Span,
}

impl<A: StageAction> RetryCoordinator<A> {
    pub fn new(pool: WorkerPool<A>, breakers: Arc<BreakerBoard>, max_rounds: u32) -> Self {
        let span = info_span!("stage", stage = pool.action().name());
        Self {
            pool: Arc::new(pool),
            breakers,
            max_rounds,
            span,
        }
    }

    /// Log under `span` instead of a fresh stage span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn run(
        &self,
        tasks: Vec<Task<A::Payload>>,
        identities: &[Identity],
    ) -> StageReport<A::Payload, A::Output> {
        self.rounds(tasks, identities).instrument(self.span.clone()).await
    }

    async fn rounds(
        &self,
        tasks: Vec<Task<A::Payload>>,
        identities: &[Identity],
    ) -> StageReport<A::Payload, A::Output> {
        let mut submitted = FailedSet::new();
        submitted.extend(tasks);
        let submitted: BTreeMap<usize, Task<A::Payload>> = submitted
            .into_tasks()
            .into_iter()
            .map(|t| (t.original_index, t))
            .collect();

        let mut resolved: BTreeMap<usize, A::Output> = BTreeMap::new();
        let mut pending: Vec<Task<A::Payload>> = submitted.values().cloned().collect();
        let mut rounds = 0;

        while !pending.is_empty() && rounds < self.max_rounds {
            let healthy = self.breakers.healthy(identities);
            let assignments = match distribute(std::mem::take(&mut pending), &healthy) {
                Ok(assignments) => assignments,
                Err(DistributionError::NoIdentities) => {
                    warn!(round = rounds + 1, "No healthy identities left");
                    pending = self.outstanding(&submitted, &resolved, FailedSet::new());
                    break;
                }
                Err(DistributionError::NoTasks) => break,
            };
            rounds += 1;
            info!(
                round = rounds,
                identities = healthy.len(),
                tasks = assignments.iter().map(|a| a.tasks.len()).sum::<usize>(),
                "Starting round"
            );

            let mut set = JoinSet::new();
            for assignment in assignments {
                let pool = Arc::clone(&self.pool);
                let breaker = self.breakers.breaker(&assignment.identity.id);
                let span = info_span!("identity", identity = %assignment.identity.id);
                set.spawn(async move { pool.run(assignment, breaker).await }.instrument(span));
            }

            let mut failed = FailedSet::new();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(report) => {
                        resolved.extend(report.succeeded);
                        failed.extend(report.failed);
                    }
                    // Its tasks resurface below as missed.
                    Err(e) => error!(error = %e, "Worker pool task aborted"),
                }
            }

            pending = self.outstanding(&submitted, &resolved, failed);
            if !pending.is_empty() {
                info!(round = rounds, remaining = pending.len(), "Round finished with failures");
            }
        }

        let broken: Vec<String> = identities
            .iter()
            .filter(|i| self.breakers.is_tripped(&i.id))
            .map(|i| i.id.clone())
            .collect();

        if pending.is_empty() {
            info!(resolved = resolved.len(), rounds, "Stage complete");
        } else {
            warn!(
                resolved = resolved.len(),
                unresolved = pending.len(),
                rounds,
                "Stage finished with unresolved tasks"
            );
        }

        StageReport {
            resolved,
            unresolved: pending,
            rounds,
            broken,
        }
    }

    /// Failed tasks not resolved elsewhere, plus submitted indices that are
    /// in neither the resolved map nor the failed set.
    fn outstanding(
        &self,
        submitted: &BTreeMap<usize, Task<A::Payload>>,
        resolved: &BTreeMap<usize, A::Output>,
        mut failed: FailedSet<A::Payload>,
    ) -> Vec<Task<A::Payload>> {
        failed.retain(|index| !resolved.contains_key(&index));

        let missed: Vec<Task<A::Payload>> = submitted
            .iter()
            .filter(|(index, _)| !resolved.contains_key(*index) && !failed.contains(**index))
            .map(|(_, task)| task.clone())
            .collect();
        if !missed.is_empty() {
            warn!(missed = missed.len(), "Reconciled tasks missing from both results and failures");
        }
        failed.extend(missed);
        failed.into_tasks()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::PoolSettings;
    use crate::dispatch::LocalRetry;
    use crate::dispatch::task::index_tasks;
    use crate::error::TaskError;
    use crate::session::Session;
    use crate::testing::{ScriptedFactory, ScriptedSession};

    /// Counts attempts per index and fails on script.
    #[derive(Default)]
    struct Tracker {
        seen: Mutex<Vec<(usize, u32)>>,
        rate_limit: HashMap<usize, &'static str>,
        always_fail: Vec<usize>,
        round: Mutex<HashMap<usize, u32>>,
    }

    #[async_trait]
    impl StageAction for Tracker {
        type Payload = &'static str;
        type Output = String;

        fn name(&self) -> &str {
            "track"
        }

        async fn execute(
            &self,
            session: &mut dyn Session,
            task: &Task<&'static str>,
        ) -> Result<String, TaskError> {
            let who = session.current_url().await.unwrap_or_default();
            let attempt = {
                let mut round = self.round.lock().unwrap();
                let n = round.entry(task.original_index).or_insert(0);
                *n += 1;
                *n
            };
            self.seen.lock().unwrap().push((task.original_index, attempt));
            if self.always_fail.contains(&task.original_index) {
                return Err(TaskError::Failed("never".into()));
            }
            if self.rate_limit.get(&task.original_index) == Some(&"first") && attempt == 1 {
                return Err(TaskError::RateLimited("try again tomorrow.".into()));
            }
            Ok(format!("{}{}", task.payload, who))
        }
    }

    fn pool(action: Tracker) -> WorkerPool<Tracker> {
        pool_with(action, ScriptedFactory::new(ScriptedSession::default()))
    }

    fn pool_with<A: StageAction>(action: A, factory: ScriptedFactory) -> WorkerPool<A> {
        let settings = PoolSettings {
            workers_per_identity: 1,
            pacing: Duration::ZERO,
            local_retry: LocalRetry {
                attempts: 1,
                delay: Duration::ZERO,
            },
            task_timeout: Duration::from_secs(5),
            max_rounds: 3,
        };
        WorkerPool::new(Arc::new(action), Arc::new(factory), settings)
    }

    fn identities() -> Vec<Identity> {
        vec![Identity::new("one"), Identity::new("two")]
    }

    #[tokio::test]
    async fn single_round_when_everything_succeeds() {
        let breakers = Arc::new(BreakerBoard::new());
        let coordinator = RetryCoordinator::new(pool(Tracker::default()), breakers, 3);
        let report = coordinator
            .run(index_tasks(["a", "b", "c", "d", "e"]), &identities())
            .await;
        assert_eq!(report.rounds, 1);
        assert_eq!(report.resolved.len(), 5);
        assert!(report.is_complete());
        assert!(report.broken.is_empty());
    }

    #[tokio::test]
    async fn broken_identity_is_excluded_from_later_rounds() {
        // "two" owns indices 3 and 4; its first attempt at 3 is rate limited.
        let action = Tracker {
            rate_limit: [(3, "first")].into(),
            ..Default::default()
        };
        let breakers = Arc::new(BreakerBoard::new());
        let coordinator = RetryCoordinator::new(pool(action), breakers.clone(), 3);
        let report = coordinator
            .run(index_tasks(["a", "b", "c", "d", "e"]), &identities())
            .await;

        assert_eq!(report.rounds, 2);
        assert_eq!(report.resolved.len(), 5);
        assert_eq!(report.broken, ["two"]);
        assert!(breakers.is_tripped("two"));
        assert!(!breakers.is_tripped("one"));
    }

    /// Records which identity ran each attempt; `limited` is told to stop
    /// for the day on every task, `hopeless` never succeeds.
    struct ByIdentity {
        runs: Mutex<Vec<(String, usize)>>,
        limited: &'static str,
        hopeless: usize,
    }

    #[async_trait]
    impl StageAction for ByIdentity {
        type Payload = usize;
        type Output = String;

        fn name(&self) -> &str {
            "by-identity"
        }

        async fn execute(
            &self,
            session: &mut dyn Session,
            task: &Task<usize>,
        ) -> Result<String, TaskError> {
            let who = session.current_url().await?;
            self.runs.lock().unwrap().push((who.clone(), task.original_index));
            if who == self.limited {
                return Err(TaskError::RateLimited("try again tomorrow.".into()));
            }
            if task.original_index == self.hopeless {
                return Err(TaskError::Failed("never".into()));
            }
            Ok(who)
        }
    }

    #[tokio::test]
    async fn tripped_identity_gets_nothing_in_later_rounds() {
        let factory = ["one", "two", "three"]
            .into_iter()
            .fold(ScriptedFactory::new(ScriptedSession::default()), |f, id| {
                f.with_identity(id, ScriptedSession::default().at(id))
            });
        let action = ByIdentity {
            runs: Mutex::new(Vec::new()),
            limited: "two",
            hopeless: 0,
        };
        let identities = vec![Identity::new("one"), Identity::new("two"), Identity::new("three")];
        let breakers = Arc::new(BreakerBoard::new());
        let coordinator = RetryCoordinator::new(pool_with(action, factory), breakers, 3);
        let report = coordinator.run(index_tasks(0..9), &identities).await;

        // Index 0 keeps the stage going through all three rounds.
        assert_eq!(report.rounds, 3);
        assert_eq!(report.broken, ["two"]);
        let unresolved: Vec<_> = report.unresolved.iter().map(|t| t.original_index).collect();
        assert_eq!(unresolved, [0]);

        // "two" owned 3..6 in round 1, ran one of them, and nothing after.
        let runs = coordinator.pool.action().runs.lock().unwrap().clone();
        let by_two: Vec<usize> = runs
            .iter()
            .filter(|(who, _)| who == "two")
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(by_two, [3]);
        for index in 3..6 {
            assert!(report.resolved[&index] == "one" || report.resolved[&index] == "three");
        }
        assert_eq!(runs.iter().filter(|(_, i)| *i == 0).count(), 3);
    }

    #[tokio::test]
    async fn never_runs_more_than_the_round_cap() {
        let action = Tracker {
            always_fail: vec![1],
            ..Default::default()
        };
        let coordinator = RetryCoordinator::new(pool(action), Arc::new(BreakerBoard::new()), 3);
        let report = coordinator.run(index_tasks(["a", "b", "c"]), &identities()).await;

        assert_eq!(report.rounds, 3);
        assert_eq!(report.resolved.len(), 2);
        let unresolved: Vec<_> = report.unresolved.iter().map(|t| t.original_index).collect();
        assert_eq!(unresolved, [1]);

        let seen = coordinator.pool.action().seen.lock().unwrap().clone();
        let attempts = seen.iter().filter(|(i, _)| *i == 1).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn no_healthy_identities_leaves_everything_unresolved() {
        let breakers = Arc::new(BreakerBoard::new());
        breakers.trip("one");
        breakers.trip("two");
        let coordinator = RetryCoordinator::new(pool(Tracker::default()), breakers, 3);
        let report = coordinator.run(index_tasks(["a", "b"]), &identities()).await;

        assert_eq!(report.rounds, 0);
        assert!(report.resolved.is_empty());
        assert_eq!(report.unresolved.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_input_indices_run_once() {
        let breakers = Arc::new(BreakerBoard::new());
        let coordinator = RetryCoordinator::new(pool(Tracker::default()), breakers, 3);
        let tasks = vec![Task::new(0, "a"), Task::new(0, "a"), Task::new(1, "b")];
        let report = coordinator.run(tasks, &identities()).await;

        assert_eq!(report.resolved.len(), 2);
        assert_eq!(coordinator.pool.action().seen.lock().unwrap().len(), 2);
    }
}
