//! Tasks and the per-round failed set.

use std::collections::BTreeMap;

/// One unit of work carrying the index it was given at stage entry.
///
/// `original_index` is the only key used to join results across stages
/// and retry rounds. A retried task is the same value sent again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<P> {
    pub original_index: usize,
    pub payload: P,
}

impl<P> Task<P> {
    pub fn new(original_index: usize, payload: P) -> Self {
        Self {
            original_index,
            payload,
        }
    }
}

/// Assign consecutive indices, starting at zero, to stage input.
pub fn index_tasks<P>(payloads: impl IntoIterator<Item = P>) -> Vec<Task<P>> {
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| Task::new(i, payload))
        .collect()
}

/// Tasks that failed in a round, deduplicated by `original_index`.
#[derive(Debug, Clone)]
pub struct FailedSet<P> {
    tasks: BTreeMap<usize, Task<P>>,
}

impl<P> Default for FailedSet<P> {
    fn default() -> Self {
        Self {
            tasks: BTreeMap::new(),
        }
    }
}

impl<P> FailedSet<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; a second failure for the same index is ignored.
    pub fn insert(&mut self, task: Task<P>) {
        self.tasks.entry(task.original_index).or_insert(task);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.tasks.contains_key(&index)
    }

    /// Drop every task whose index `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(usize) -> bool) {
        self.tasks.retain(|index, _| keep(*index));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks ordered by index.
    pub fn into_tasks(self) -> Vec<Task<P>> {
        self.tasks.into_values().collect()
    }
}

impl<P> Extend<Task<P>> for FailedSet<P> {
    fn extend<I: IntoIterator<Item = Task<P>>>(&mut self, iter: I) {
        for task in iter {
            self.insert(task);
        }
    }
}
