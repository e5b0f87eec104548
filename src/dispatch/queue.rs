//! Shared task queue drained by one pool's workers.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::dispatch::task::Task;

/// FIFO queue with atomic pop. No task is handed to two workers.
#[derive(Debug)]
pub struct TaskQueue<P> {
    inner: Mutex<VecDeque<Task<P>>>,
}

impl<P> TaskQueue<P> {
    pub fn new(tasks: Vec<Task<P>>) -> Self {
        Self {
            inner: Mutex::new(tasks.into()),
        }
    }

    pub async fn pop(&self) -> Option<Task<P>> {
        self.inner.lock().await.pop_front()
    }

    /// Take every queued task, leaving the queue empty.
    pub async fn drain(&self) -> Vec<Task<P>> {
        self.inner.lock().await.drain(..).collect()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::task::index_tasks;

    #[tokio::test]
    async fn pops_in_order_then_drains() {
        let queue = TaskQueue::new(index_tasks(["a", "b", "c"]));
        assert_eq!(queue.pop().await.unwrap().payload, "a");
        let rest = queue.drain().await;
        assert_eq!(rest.len(), 2);
        assert!(queue.pop().await.is_none());
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_pops_never_duplicate() {
        let queue = Arc::new(TaskQueue::new(index_tasks(0..200)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(task) = queue.pop().await {
                    got.push(task.original_index);
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.await.unwrap() {
                assert!(seen.insert(index), "index {index} popped twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
