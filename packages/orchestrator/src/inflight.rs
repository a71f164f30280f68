// ABOUTME: Keyed registry of running background tasks that deduplicates concurrent requests
// ABOUTME: A second request for a busy key joins the existing task instead of starting another

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::AbortHandle;

use crate::error::{OrchestratorError, SharedError};

pub type SharedTask<T> = Shared<BoxFuture<'static, Result<T, SharedError>>>;

struct Entry<T: Clone> {
    id: u64,
    task: SharedTask<T>,
    abort: AbortHandle,
    started_at: Instant,
}

type Entries<K, T> = Arc<Mutex<HashMap<K, Entry<T>>>>;

/// Tasks run on the runtime independently of whoever awaits them, so dropping a waiter
/// (for example on a timeout) never cancels the work itself.
pub struct InFlight<K, T: Clone> {
    entries: Entries<K, T>,
    next_id: Arc<AtomicU64>,
}

impl<K, T: Clone> Clone for InFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<K, T: Clone> Default for InFlight<K, T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Removes the registry entry when the task finishes, panics or is aborted.
struct RemoveOnDrop<K: Eq + Hash, T: Clone> {
    entries: Entries<K, T>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, T: Clone> Drop for RemoveOnDrop<K, T> {
    fn drop(&mut self) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.get(&self.key).map(|e| e.id) == Some(self.id) {
            entries.remove(&self.key);
        }
    }
}

impl<K, T> InFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<T>>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start `make()` for `key` unless a task for it is already running.
    /// Returns the task and whether it was joined rather than started.
    pub fn run<F, Fut>(&self, key: K, make: F) -> (SharedTask<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    {
        // Held across spawn + insert so the task cannot finish before its entry exists
        let mut entries = self.lock();
        if let Some(entry) = entries.get(&key) {
            return (entry.task.clone(), true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = RemoveOnDrop {
            entries: self.entries.clone(),
            key: key.clone(),
            id,
        };
        let work = make();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await
        });
        let abort = handle.abort_handle();

        let task = async move {
            match handle.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) if e.is_cancelled() => {
                    Err(Arc::new(OrchestratorError::TaskAborted("cancelled".into())))
                }
                Err(e) => Err(Arc::new(OrchestratorError::TaskAborted(format!(
                    "panicked: {}",
                    e
                )))),
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key,
            Entry {
                id,
                task: task.clone(),
                abort,
                started_at: Instant::now(),
            },
        );
        (task, false)
    }

    pub fn get(&self, key: &K) -> Option<SharedTask<T>> {
        self.lock().get(key).map(|e| e.task.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn started_at(&self, key: &K) -> Option<Instant> {
        self.lock().get(key).map(|e| e.started_at)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort the task for `key`. Waiters receive `TaskAborted`.
    pub fn abort(&self, key: &K) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        let drained: Vec<Entry<T>> = self.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_runs_share_one_task() {
        let inflight: InFlight<String, usize> = InFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let counter = runs.clone();
        let (first, joined_first) = inflight.run("s1".to_string(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(7)
        });

        let counter = runs.clone();
        let (second, joined_second) = inflight.run("s1".to_string(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        });

        assert!(!joined_first);
        assert!(joined_second);
        assert_eq!(inflight.len(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 7);
        assert_eq!(second.await.unwrap(), 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_removed_after_completion_without_waiters() {
        let inflight: InFlight<String, ()> = InFlight::new();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let (_task, _) = inflight.run("s1".to_string(), move || async move {
            let _ = done_tx.send(());
            Ok(())
        });

        done_rx.await.unwrap();
        for _ in 0..50 {
            if inflight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(inflight.is_empty());

        let (again, joined) = inflight.run("s1".to_string(), || async { Ok(()) });
        assert!(!joined);
        again.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let inflight: InFlight<String, ()> = InFlight::new();
        let (task, _) = inflight.run("p1".to_string(), || async {
            Err(OrchestratorError::NoContainerDefinitions("p1".into()))
        });
        let joined = inflight.get(&"p1".to_string());

        let err = task.await.unwrap_err();
        assert!(err.is_structural());
        if let Some(joined) = joined {
            assert!(joined.await.unwrap_err().is_structural());
        }
    }

    #[tokio::test]
    async fn test_abort_cancels_task() {
        let inflight: InFlight<String, ()> = InFlight::new();
        let (task, _) = inflight.run("s1".to_string(), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        assert!(inflight.started_at(&"s1".to_string()).is_some());
        assert!(inflight.abort(&"s1".to_string()));
        assert!(!inflight.abort(&"s1".to_string()));

        let err = task.await.unwrap_err();
        assert!(matches!(*err, OrchestratorError::TaskAborted(_)));
        assert!(!inflight.contains(&"s1".to_string()));
    }
}
