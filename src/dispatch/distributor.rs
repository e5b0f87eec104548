//! Fair, contiguous partition of tasks across identities.

use crate::dispatch::task::Task;
use crate::error::DistributionError;
use crate::identity::Identity;

/// The tasks one identity works on for a single round.
#[derive(Debug, Clone)]
pub struct WorkAssignment<P> {
    pub identity: Identity,
    pub tasks: Vec<Task<P>>,
}

/// Split `tasks` into one contiguous slice per identity.
///
/// With `base = N / M` and `extra = N % M`, the first `extra` identities
/// receive `base + 1` tasks and the rest `base`. Deterministic for the same
/// ordered inputs. Identities may receive zero tasks when `N < M`.
pub fn distribute<P>(
    tasks: Vec<Task<P>>,
    identities: &[Identity],
) -> Result<Vec<WorkAssignment<P>>, DistributionError> {
    if identities.is_empty() {
        return Err(DistributionError::NoIdentities);
    }
    if tasks.is_empty() {
        return Err(DistributionError::NoTasks);
    }

    let m = identities.len();
    let base = tasks.len() / m;
    let extra = tasks.len() % m;

    let mut remaining = tasks.into_iter();
    let assignments = identities
        .iter()
        .enumerate()
        .map(|(i, identity)| {
            let take = base + usize::from(i < extra);
            WorkAssignment {
                identity: identity.clone(),
                tasks: remaining.by_ref().take(take).collect(),
            }
        })
        .collect();
    Ok(assignments)
}
