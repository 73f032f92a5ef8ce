//! Single-flight cache of account-set chains, keyed by handle.
//!
//! The first caller for a handle launches the computation on its own task;
//! every later caller waits on a oneshot for the same result. Results, ok or
//! error, stay in the cache until explicitly invalidated.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::chain::ChainData;
use crate::error::ExitError;
use crate::types::Handle;

/// Result shared by every waiter on a handle.
pub type ChainResult = Result<Arc<ChainData>, ExitError>;

enum CacheEntry {
    Pending(Vec<oneshot::Sender<ChainResult>>),
    Ready(ChainResult),
}

type Entries = Arc<Mutex<HashMap<Handle, CacheEntry>>>;

/// Settles a pending entry. If dropped unsettled (the compute task panicked
/// or was aborted) the entry is settled with a server error.
struct Completion {
    entries: Entries,
    handle: Handle,
    settled: bool,
}

impl Completion {
    fn settle(&mut self, result: ChainResult) {
        self.settled = true;
        let waiters = {
            let mut entries = self.entries.lock();
            match entries.insert(self.handle.clone(), CacheEntry::Ready(result.clone())) {
                Some(CacheEntry::Pending(waiters)) => waiters,
                _ => Vec::new(),
            }
        };
        debug!(handle = %self.handle, waiters = waiters.len(), ok = result.is_ok(), "chain computation settled");
        for waiter in waiters {
            // A waiter that went away is simply skipped.
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.settled {
            warn!(handle = %self.handle, "chain computation aborted");
            self.settle(Err(ExitError::ServerError("chain computation aborted".into())));
        }
    }
}

/// Content-addressable chain cache.
#[derive(Clone, Default)]
pub struct ChainCache {
    entries: Entries,
}

impl ChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch `compute` for `handle` unless an entry already exists.
    ///
    /// Returns `true` if this call started the computation. Does not wait
    /// for the result. Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, handle: &Handle, compute: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ChainResult> + Send + 'static,
    {
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(handle) {
                return false;
            }
            entries.insert(handle.clone(), CacheEntry::Pending(Vec::new()));
        }

        debug!(handle = %handle, "chain computation started");
        // Settles the entry even if `compute` itself panics.
        let mut completion = Completion {
            entries: Arc::clone(&self.entries),
            handle: handle.clone(),
            settled: false,
        };
        let fut = compute();
        tokio::spawn(async move {
            let result = fut.await;
            completion.settle(result);
        });
        true
    }

    /// Wait for the entry of `handle`, computing it first if absent.
    pub async fn get_or_compute<F, Fut>(&self, handle: &Handle, compute: F) -> ChainResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ChainResult> + Send + 'static,
    {
        self.start(handle, compute);
        self.get(handle).await
    }

    /// Wait for an existing entry. Fails with `UnknownHandle` if the handle
    /// was never started.
    pub async fn get(&self, handle: &Handle) -> ChainResult {
        let rx = {
            let mut entries = self.entries.lock();
            match entries.get_mut(handle) {
                None => return Err(ExitError::UnknownHandle(handle.to_string())),
                Some(CacheEntry::Ready(result)) => return result.clone(),
                Some(CacheEntry::Pending(waiters)) => {
                    waiters.retain(|w| !w.is_closed());
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ExitError::ServerError("chain computation dropped".into())),
        }
    }

    /// The settled result for `handle`, if any.
    pub fn peek(&self, handle: &Handle) -> Option<ChainResult> {
        match self.entries.lock().get(handle) {
            Some(CacheEntry::Ready(result)) => Some(result.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.entries.lock().contains_key(handle)
    }

    pub fn is_pending(&self, handle: &Handle) -> bool {
        matches!(self.entries.lock().get(handle), Some(CacheEntry::Pending(_)))
    }

    /// Remove a failed entry so the next registration recomputes it.
    ///
    /// Pending and successful entries are left alone. Returns `true` if an
    /// entry was removed.
    pub fn invalidate(&self, handle: &Handle) -> bool {
        let mut entries = self.entries.lock();
        let failed = matches!(entries.get(handle), Some(CacheEntry::Ready(Err(_))));
        if failed {
            entries.remove(handle);
            debug!(handle = %handle, "failed chain entry invalidated");
        }
        failed
    }

    /// Invalidate a failed entry and start `compute` in its place.
    pub fn recompute<F, Fut>(&self, handle: &Handle, compute: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ChainResult> + Send + 'static,
    {
        self.invalidate(handle) && self.start(handle, compute)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn data(handle: &Handle) -> Arc<ChainData> {
        Arc::new(ChainData::new(handle.clone(), Vec::new(), 8))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = ChainCache::new();
        let handle = Handle::from_request("a,b");
        let calls = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let handle = handle.clone();
            let calls = Arc::clone(&calls);
            joins.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&handle, || {
                        let h = handle.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(data(&h))
                        }
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for j in joins {
            results.push(j.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], r));
        }
    }

    #[tokio::test]
    async fn unknown_handle_is_rejected() {
        let cache = ChainCache::new();
        let err = cache.get(&Handle::from("nope")).await.unwrap_err();
        assert_eq!(err, ExitError::UnknownHandle("nope".into()));
    }

    #[tokio::test]
    async fn failure_is_stored_for_future_waiters() {
        let cache = ChainCache::new();
        let handle = Handle::from("h");
        let err = cache
            .get_or_compute(&handle, || async { Err(ExitError::ServerError("boom".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ServerError");

        // No retry: a second compute is never invoked.
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let again = cache
            .get_or_compute(&handle, move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(ExitError::ServerError("other".into())) }
            })
            .await
            .unwrap_err();
        assert_eq!(again, err);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalidate_allows_recompute_after_failure() {
        let cache = ChainCache::new();
        let handle = Handle::from("h");
        let _ = cache
            .get_or_compute(&handle, || async { Err(ExitError::ServerError("boom".into())) })
            .await;

        let h = handle.clone();
        assert!(cache.recompute(&handle, move || async move { Ok(data(&h)) }));
        assert!(cache.get(&handle).await.is_ok());
        // Successful entries are not invalidated.
        assert!(!cache.invalidate(&handle));
    }

    #[tokio::test]
    async fn start_returns_before_completion() {
        let cache = ChainCache::new();
        let handle = Handle::from("slow");
        let (release, wait) = oneshot::channel::<()>();
        let h = handle.clone();
        assert!(cache.start(&handle, move || async move {
            let _ = wait.await;
            Ok(data(&h))
        }));
        assert!(cache.is_pending(&handle));
        assert!(cache.peek(&handle).is_none());
        assert!(!cache.start(&handle, || async { Err(ExitError::NoKeys) }));

        release.send(()).unwrap();
        assert!(cache.get(&handle).await.is_ok());
        assert!(!cache.is_pending(&handle));
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_cancel_computation() {
        let cache = ChainCache::new();
        let handle = Handle::from("c");
        let h = handle.clone();
        let waiter = {
            let cache = cache.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&handle, move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(data(&h))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();

        let result = cache.get(&handle).await.unwrap();
        assert_eq!(result.handle(), &handle);
    }

    #[tokio::test]
    async fn panicking_computation_settles_with_error() {
        let cache = ChainCache::new();
        let handle = Handle::from("p");
        let err = cache
            .get_or_compute(&handle, || async {
                if true {
                    panic!("compute failed");
                }
                Err(ExitError::NoKeys)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ServerError");
        assert!(cache.peek(&handle).unwrap().is_err());
    }

    #[tokio::test]
    async fn panic_while_creating_future_settles_with_error() {
        let cache = ChainCache::new();
        let handle = Handle::from("sync-panic");
        let started = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.start(&handle, || -> std::future::Ready<ChainResult> {
                panic!("could not build future")
            })
        }));
        assert!(started.is_err());
        assert!(!cache.is_pending(&handle));

        let err = tokio::time::timeout(Duration::from_secs(1), cache.get(&handle))
            .await
            .expect("waiter must not hang")
            .unwrap_err();
        assert_eq!(err.kind(), "ServerError");
    }
}
