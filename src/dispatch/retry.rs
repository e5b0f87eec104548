//! Local retry: same worker, same session, small fixed budget.

use std::time::Duration;

use tracing::warn;

use crate::dispatch::StageAction;
use crate::dispatch::task::Task;
use crate::error::TaskError;
use crate::session::Session;

/// Attempt budget and fixed delay for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LocalRetry {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_millis(20_000),
        }
    }
}

impl LocalRetry {
    /// Run `action` for `task` until it succeeds or the budget runs out.
    ///
    /// Each attempt is bounded by `timeout`; expiry counts as transient.
    /// A rate limit is returned immediately and never retried here.
    /// Non-transient failures are returned without retrying.
    pub async fn execute<A: StageAction>(
        &self,
        action: &A,
        session: &mut dyn Session,
        task: &Task<A::Payload>,
        timeout: Duration,
    ) -> Result<A::Output, TaskError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(timeout, action.execute(session, task)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Transient(format!(
                    "{} attempt timed out after {timeout:?}",
                    action.name()
                ))),
            };

            match outcome {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        stage = action.name(),
                        index = task.original_index,
                        attempt,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
