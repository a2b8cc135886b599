use parking_lot::Mutex;
use std::{collections::HashMap, fmt::Debug, future::Future, hash::Hash, sync::Arc};
use tokio::sync::watch;

type Slot<T> = watch::Receiver<Option<T>>;
type Table<K, T> = Arc<Mutex<HashMap<K, Slot<T>>>>;

/// Makes sure that for any key there is at most one job in progress. Whoever asks for the same key while the job is
/// running gets attached to it instead of starting another one.
///
/// Jobs run in their own tasks. Waiters may come and go; dropping an [`InFlight`] handle never cancels the job, and
/// the job's outcome is delivered to everybody still waiting when it completes. The table lock is only held for
/// bookkeeping, never across a job.
pub struct Coalescer<K, T>
where
    K: Debug + Hash + Clone + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    in_flight: Table<K, T>,
}

impl<K, T> Coalescer<K, T>
where
    K: Debug + Hash + Clone + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach to the job for `key`, or start one using `job` if there is none. `job` is only invoked when a new job
    /// is started. Must be called within a Tokio runtime.
    pub fn run_exclusive<F, Fut>(&self, key: K, job: F) -> InFlight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = {
            let mut table = self.in_flight.lock();
            if let Some(rx) = table.get(&key) {
                return InFlight {
                    rx:     rx.clone(),
                    leader: false,
                };
            }
            let (tx, rx) = watch::channel(None);
            table.insert(key.clone(), rx.clone());
            (tx, rx)
        };

        // The registration must go away even if the job panics, or the key would stay blocked forever.
        let registration = Registration {
            key,
            table: Arc::clone(&self.in_flight),
        };
        let fut = job();

        tokio::spawn(async move {
            let outcome = fut.await;
            // Deregister before waking anyone up.
            drop(registration);
            tx.send_replace(Some(outcome));
        });

        InFlight { rx, leader: true }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Number of jobs currently in progress.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for Coalescer<K, T>
where
    K: Debug + Hash + Clone + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct Registration<K, T>
where
    K: Hash + Eq,
{
    key:   K,
    table: Table<K, T>,
}

impl<K, T> Drop for Registration<K, T>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}

/// A handle on a running or completed job.
#[derive(Debug)]
pub struct InFlight<T> {
    rx:     Slot<T>,
    leader: bool,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `true` if this handle started the job, `false` if it joined one already in progress.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the job's outcome. `None` means the job died without producing one.
    pub async fn wait(mut self) -> Option<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_job() {
        let coalescer = Arc::new(Coalescer::<String, u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let calls = calls.clone();
            let release = release.clone();
            handles.push(coalescer.run_exclusive("acme".to_string(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                42
            }));
        }

        assert_eq!(handles.iter().filter(|h| h.is_leader()).count(), 1);
        assert!(coalescer.is_in_flight(&"acme".to_string()));

        // Give the job a chance to start waiting before releasing it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();

        for handle in handles {
            assert_eq!(handle.wait().await, Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coalescer.is_empty());
    }

    #[tokio::test]
    async fn test_keys_do_not_block_each_other() {
        let coalescer = Coalescer::<String, &'static str>::new();
        let never = Arc::new(Notify::new());

        let blocked = never.clone();
        let _stuck = coalescer.run_exclusive("slow".to_string(), move || async move {
            blocked.notified().await;
            "slow"
        });
        let fast = coalescer.run_exclusive("fast".to_string(), || async { "fast" });

        let outcome = tokio::time::timeout(Duration::from_secs(1), fast.wait()).await;
        assert_eq!(outcome.unwrap(), Some("fast"));
        assert!(coalescer.is_in_flight(&"slow".to_string()));
        assert_eq!(coalescer.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiters_do_not_cancel() {
        let coalescer = Coalescer::<String, u64>::new();
        let done = Arc::new(AtomicUsize::new(0));

        let counter = done.clone();
        let first = coalescer.run_exclusive("acme".to_string(), move || async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            7
        });
        drop(first);

        let second = coalescer.run_exclusive("acme".to_string(), || async { 0 });
        assert!(!second.is_leader());
        assert_eq!(second.wait().await, Some(7));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    async fn explode() -> u64 {
        panic!("aggregation blew up")
    }

    #[tokio::test]
    async fn test_registration_removed_on_panic() {
        let coalescer = Coalescer::<String, u64>::new();

        let doomed = coalescer.run_exclusive("acme".to_string(), explode);
        assert_eq!(doomed.wait().await, None);

        // Deregistration happens during unwinding, which may lag behind the waiter a little.
        for _ in 0..100 {
            if !coalescer.is_in_flight(&"acme".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let retry = coalescer.run_exclusive("acme".to_string(), || async { 1 });
        assert!(retry.is_leader());
        assert_eq!(retry.wait().await, Some(1));
    }
}
