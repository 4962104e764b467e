//! Duplicate-load suppression.
//!
//! When several tasks ask for the same key at once, only one of them runs
//! the loader; the rest wait on the same in-flight work and receive a clone
//! of its result. The in-flight entry is removed as soon as the executing
//! caller finishes, so the next burst loads again: this is coalescing, not
//! caching.

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

type SharedLoad<T> = Shared<BoxFuture<'static, T>>;

/// Coalesces concurrent loads of the same key into one execution.
///
/// # Example
///
/// ```
/// use meshcache::SingleFlight;
///
/// # async fn example() {
/// let flight: SingleFlight<String> = SingleFlight::new();
/// let value = flight
///     .run("user:1", || async { "loaded".to_string() })
///     .await;
/// assert_eq!(value, "loaded");
/// # }
/// ```
pub struct SingleFlight<T: Clone> {
    // Weak handles: a call abandoned by every waiter must not satisfy
    // later callers.
    calls: Mutex<HashMap<String, WeakShared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty group of in-flight calls.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `load` for `key`, unless a call for the same key is already in
    /// flight, in which case the in-flight result is awaited and returned.
    ///
    /// The internal lock is released before any await; waiting for a
    /// result never blocks callers working on other keys.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (shared, leader) = {
            let mut calls = self.calls.lock();
            match calls.get(key).and_then(WeakShared::upgrade) {
                Some(existing) => (existing, false),
                None => {
                    let shared: SharedLoad<T> = load().boxed().shared();
                    let weak = shared.downgrade().expect("freshly created shared future");
                    calls.insert(key.to_string(), weak);
                    (shared, true)
                }
            }
        };

        // The leader keeps `shared` alive across the await so the map
        // entry stays upgradeable until it is removed below; the entry it
        // removes is therefore always its own.
        let result = shared.clone().await;

        if leader {
            self.calls.lock().remove(key);
        }
        drop(shared);
        result
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ByteView;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_burst_executes_once() {
        let flight: Arc<SingleFlight<Option<ByteView>>> = Arc::new(SingleFlight::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let flight = flight.clone();
            let invocations = invocations.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                flight
                    .run("key1", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Some(ByteView::from("value1"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.expect("task completed");
            assert_eq!(value, Some(ByteView::from("value1")));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn reruns_after_burst_completes() {
        let flight: SingleFlight<u64> = SingleFlight::new();
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let invocations = invocations.clone();
            let got = flight
                .run("k", move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    7
                })
                .await;
            assert_eq!(got, 7);
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_keys_do_not_coalesce() {
        let flight: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let flight = flight.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("key{i}");
                let produced = key.clone();
                flight
                    .run(&key, move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        produced
                    })
                    .await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.expect("task completed"), format!("key{i}"));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn waiters_observe_the_leaders_outcome() {
        let flight: Arc<SingleFlight<Option<ByteView>>> = Arc::new(SingleFlight::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = flight.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("missing", move || async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        None
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("task completed"), None);
        }
    }
}
