//! Two identities, five tasks: a transient failure recovered locally, a
//! rate limit that breaks one identity, and the leftover reassigned in the
//! next round.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use listing_harvester::config::PoolSettings;
use listing_harvester::dispatch::{
    BreakerBoard, LocalRetry, RetryCoordinator, StageAction, Task, TaskSink, WorkerPool,
    index_tasks,
};
use listing_harvester::error::{SessionError, TaskError};
use listing_harvester::identity::{Cookie, Identity};
use listing_harvester::session::{Session, SessionFactory, WaitCondition};
use listing_harvester::stages::{KeywordEntry, RecordField, RecordSink};
use listing_harvester::store::OutputStore;

/// A session that only knows which identity opened it.
struct TaggedSession {
    identity: String,
}

#[async_trait]
impl Session for TaggedSession {
    async fn navigate(
        &mut self,
        _: &str,
        _: WaitCondition,
        _: Duration,
    ) -> Result<(), SessionError> {
        Ok(())
    }
    async fn reload(&mut self, _: WaitCondition, _: Duration) -> Result<(), SessionError> {
        Ok(())
    }
    async fn wait_for(&mut self, _: &str, _: Duration) -> Result<(), SessionError> {
        Ok(())
    }
    async fn wait_for_any(&mut self, _: &[&str], _: Duration) -> Result<usize, SessionError> {
        Ok(0)
    }
    async fn wait_for_navigation(&mut self, _: Duration) -> Result<(), SessionError> {
        Ok(())
    }
    async fn wait_for_navigation_or(&mut self, _: &str, _: Duration) -> Result<bool, SessionError> {
        Ok(false)
    }
    async fn click(&mut self, _: &str) -> Result<(), SessionError> {
        Ok(())
    }
    async fn type_text(&mut self, _: &str, _: &str) -> Result<(), SessionError> {
        Ok(())
    }
    async fn press_enter(&mut self, _: &str) -> Result<(), SessionError> {
        Ok(())
    }
    async fn read_text(&mut self, _: &str) -> Result<Option<String>, SessionError> {
        Ok(None)
    }
    async fn read_attributes(&mut self, _: &str, _: &str) -> Result<Vec<String>, SessionError> {
        Ok(Vec::new())
    }
    async fn read_fields(&mut self, _: &str, _: &[&str]) -> Result<Vec<Vec<String>>, SessionError> {
        Ok(Vec::new())
    }
    async fn attribute(
        &mut self,
        _: &str,
        _: &str,
    ) -> Result<Option<Option<String>>, SessionError> {
        Ok(None)
    }
    async fn current_url(&mut self) -> Result<String, SessionError> {
        Ok(self.identity.clone())
    }
    async fn cookies(&mut self) -> Result<Vec<Cookie>, SessionError> {
        Ok(Vec::new())
    }
    async fn set_cookies(&mut self, _: &[Cookie]) -> Result<(), SessionError> {
        Ok(())
    }
    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct TaggedSessions;

#[async_trait]
impl SessionFactory for TaggedSessions {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, SessionError> {
        Ok(Box::new(TaggedSession {
            identity: identity.id.clone(),
        }))
    }
}

/// Scripted TURL stand-in: `one` stumbles once on index 2, `two` hits the
/// daily limit on its second task.
struct ScriptedTurl {
    store: Arc<OutputStore>,
    attempts: Mutex<Vec<(String, usize)>>,
    /// Store size observed when a task first ran in a later round.
    size_at_reassignment: Mutex<Option<usize>>,
}

#[async_trait]
impl StageAction for ScriptedTurl {
    type Payload = KeywordEntry;
    type Output = String;

    fn name(&self) -> &str {
        "turl"
    }

    async fn execute(
        &self,
        session: &mut dyn Session,
        task: &Task<KeywordEntry>,
    ) -> Result<String, TaskError> {
        let identity = session.current_url().await?;
        let index = task.original_index;
        let prior = {
            let mut attempts = self.attempts.lock().unwrap();
            let prior = attempts.iter().filter(|(_, i)| *i == index).count();
            attempts.push((identity.clone(), index));
            prior
        };

        match (identity.as_str(), index, prior) {
            ("one", 2, 0) => Err(TaskError::Transient("navigation timed out".into())),
            ("two", 4, _) => Err(TaskError::RateLimited("Please try again tomorrow.".into())),
            ("one", 4, _) => {
                *self.size_at_reassignment.lock().unwrap() = Some(self.store.len());
                Ok(format!("https://turl/{index}"))
            }
            _ => Ok(format!("https://turl/{index}")),
        }
    }
}

fn entries() -> Vec<KeywordEntry> {
    (0..5)
        .map(|i| KeywordEntry {
            keyword: format!("keyword {i}"),
            native_keyword: format!("キーワード{i}"),
            listing_link: format!("https://item/{i}"),
        })
        .collect()
}

#[tokio::test]
async fn rate_limited_identity_is_replaced_by_the_healthy_one() {
    let store = Arc::new(OutputStore::in_memory());
    let action = Arc::new(ScriptedTurl {
        store: Arc::clone(&store),
        attempts: Mutex::new(Vec::new()),
        size_at_reassignment: Mutex::new(None),
    });
    let settings = PoolSettings {
        workers_per_identity: 1,
        pacing: Duration::ZERO,
        local_retry: LocalRetry {
            attempts: 2,
            delay: Duration::from_millis(5),
        },
        task_timeout: Duration::from_secs(5),
        max_rounds: 3,
    };
    let sink: Arc<dyn TaskSink<KeywordEntry, String>> =
        Arc::new(RecordSink::new(Arc::clone(&store), RecordField::Turl));
    let max_rounds = settings.max_rounds;
    let pool =
        WorkerPool::new(Arc::clone(&action), Arc::new(TaggedSessions), settings).with_sink(sink);

    let breakers = Arc::new(BreakerBoard::new());
    let identities = vec![Identity::new("one"), Identity::new("two")];
    let report = RetryCoordinator::new(pool, Arc::clone(&breakers), max_rounds)
        .run(index_tasks(entries()), &identities)
        .await;

    assert!(report.is_complete());
    assert_eq!(report.rounds, 2);
    assert_eq!(report.broken, ["two"]);
    assert!(breakers.is_tripped("two"));

    // Round 1 left exactly the rate-limited index behind.
    assert_eq!(*action.size_at_reassignment.lock().unwrap(), Some(4));

    // Index 2 was retried locally by the same identity.
    let attempts = action.attempts.lock().unwrap().clone();
    let on_two: Vec<_> = attempts.iter().filter(|(_, i)| *i == 2).collect();
    assert_eq!(on_two.len(), 2);
    assert!(on_two.iter().all(|(who, _)| who == "one"));

    // Index 4 went to "two" once, then to "one" alone.
    let on_four: Vec<&str> = attempts
        .iter()
        .filter(|(_, i)| *i == 4)
        .map(|(who, _)| who.as_str())
        .collect();
    assert_eq!(on_four, ["two", "one"]);

    assert_eq!(store.len(), 5);
    for index in 0..5 {
        let record = store.get(index).unwrap();
        assert_eq!(record.turl, Some(format!("https://turl/{index}")));
        assert_eq!(record.listing_link, format!("https://item/{index}"));
    }
}
