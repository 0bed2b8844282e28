//! Generic checkout/return pooling with deferred, completion-gated release.
//!
//! An [`ObjectPool`] hands out shared references to reusable GPU-facing
//! objects (command buffers, queues, fences). Returning an object does not
//! make it available again until any GPU work referencing it has finished:
//! a background waiter blocks on the object's completion condition and the
//! object is folded back into the available set the next time someone calls
//! [`ObjectPool::check_futures`] (which every [`ObjectPool::acquire`] does
//! first). An object is always in exactly one of: available, checked out,
//! or pending return.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

use crate::error::{RhiError, RhiResult};

/// Contract an object must satisfy to live in an [`ObjectPool`].
pub trait Poolable: Send + Sync + 'static {
    /// Stable identity of the object within its pool.
    fn pool_key(&self) -> u64;

    /// Debug name, used in diagnostics.
    fn debug_label(&self) -> &str;

    /// Whether the object carries no outstanding GPU work and may be reused
    /// immediately. Non-blocking.
    fn is_idle(&self) -> RhiResult<bool>;

    /// Blocks until the object's completion condition holds. Runs on a
    /// background waiter thread, never on the returning caller.
    fn wait_ready(&self) -> RhiResult<()>;

    /// Prepares the object for its next checkout (fence reset, recording
    /// state rewind). Called exactly once per reinsert into the available
    /// set.
    fn recycle(&self) -> RhiResult<()>;
}

type Factory<T> = Box<dyn Fn() -> RhiResult<Arc<T>> + Send + Sync>;

struct Waiter<T> {
    key: u64,
    thread: JoinHandle<RhiResult<Arc<T>>>,
}

struct PoolInner<T: Poolable> {
    available: Vec<Arc<T>>,
    all: Vec<Arc<T>>,
    pending: HashSet<u64>,
    waiters: Vec<Waiter<T>>,
}

/// Thread-safe object pool with deferred release.
pub struct ObjectPool<T: Poolable> {
    label: String,
    factory: Option<Factory<T>>,
    /// Flipped off while a deferred return is being registered so acquirers
    /// never observe a half-updated available set.
    ready: AtomicBool,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates a pool. With a factory, [`acquire`](Self::acquire) grows the
    /// pool transparently when demand exceeds supply; without one the pool
    /// is a fixed registry populated via [`register`](Self::register).
    pub fn new(label: impl Into<String>, factory: Option<Factory<T>>) -> Self {
        Self {
            label: label.into(),
            factory,
            ready: AtomicBool::new(true),
            inner: Mutex::new(PoolInner {
                available: Vec::new(),
                all: Vec::new(),
                pending: HashSet::new(),
                waiters: Vec::new(),
            }),
        }
    }

    /// Adds a pre-built object to the registry and the available set.
    pub fn register(&self, object: Arc<T>) {
        let mut inner = self.lock();
        inner.all.push(object.clone());
        inner.available.push(object);
    }

    /// Checks out the first available object matching `selector`.
    ///
    /// Finished waiters are drained first. If nothing available matches and
    /// the pool has a factory, a new object is constructed (it lands in the
    /// registry and in the caller's hands). Without a factory: if no object
    /// in the registry can ever match, that is a configuration error; if
    /// matching objects exist but are all in flight, the call cooperatively
    /// waits for a deferred return to land.
    pub fn acquire<F>(&self, selector: F) -> RhiResult<Arc<T>>
    where
        F: Fn(&T) -> bool,
    {
        loop {
            while !self.ready.load(Ordering::Acquire) {
                std::thread::yield_now();
            }

            self.check_futures()?;

            let mut inner = self.lock();
            if let Some(pos) = inner.available.iter().position(|o| selector(o)) {
                let object = inner.available.swap_remove(pos);
                trace!("Pool '{}': handing out '{}'", self.label, object.debug_label());
                return Ok(object);
            }

            if let Some(factory) = &self.factory {
                let object = factory()?;
                debug_assert!(
                    selector(&object),
                    "pool '{}' factory produced an object its caller cannot use",
                    self.label
                );
                inner.all.push(object.clone());
                debug!(
                    "Pool '{}' grew to {} objects ('{}')",
                    self.label,
                    inner.all.len(),
                    object.debug_label()
                );
                return Ok(object);
            }

            if !inner.all.iter().any(|o| selector(o)) {
                return Err(RhiError::Configuration(format!(
                    "no object in pool '{}' can satisfy the request",
                    self.label
                )));
            }

            // Everything that matches is checked out or pending return.
            drop(inner);
            std::thread::yield_now();
        }
    }

    /// Returns an object to the pool.
    ///
    /// Objects with no outstanding GPU work are reinserted immediately.
    /// Otherwise a background waiter is spawned that blocks until the
    /// object's completion condition holds; the object becomes available
    /// again once a later `check_futures` folds it back. Returning an
    /// object that is already pending (or already available) is a no-op.
    pub fn release(&self, object: &Arc<T>) -> RhiResult<()> {
        let key = object.pool_key();

        if object.is_idle()? {
            let mut inner = self.lock();
            if Self::already_returned(&inner, key) {
                return Ok(());
            }
            Self::check_membership(&inner, key, &self.label, object)?;
            object.recycle()?;
            trace!("Pool '{}': '{}' reinserted", self.label, object.debug_label());
            inner.available.push(object.clone());
            return Ok(());
        }

        self.ready.store(false, Ordering::Release);
        let result = (|| {
            let mut inner = self.lock();
            if Self::already_returned(&inner, key) {
                return Ok(());
            }
            Self::check_membership(&inner, key, &self.label, object)?;
            inner.pending.insert(key);
            let waited = object.clone();
            let thread = std::thread::spawn(move || {
                waited.wait_ready()?;
                Ok(waited)
            });
            inner.waiters.push(Waiter { key, thread });
            trace!(
                "Pool '{}': '{}' pending return ({} waiters)",
                self.label,
                object.debug_label(),
                inner.waiters.len()
            );
            Ok(())
        })();
        self.ready.store(true, Ordering::Release);
        result
    }

    /// Joins waiters that have already finished and folds their objects back
    /// into the available set, bounding outstanding-waiter growth. Called at
    /// the start of every `acquire` and opportunistically by the frame loop.
    pub fn check_futures(&self) -> RhiResult<()> {
        let mut inner = self.lock();
        let mut i = 0;
        while i < inner.waiters.len() {
            if !inner.waiters[i].thread.is_finished() {
                i += 1;
                continue;
            }
            let waiter = inner.waiters.swap_remove(i);
            inner.pending.remove(&waiter.key);
            let object = waiter
                .thread
                .join()
                .map_err(|_| RhiError::InvalidState(format!("pool '{}' waiter panicked", self.label)))??;
            object.recycle()?;
            trace!(
                "Pool '{}': '{}' completed deferred return",
                self.label,
                object.debug_label()
            );
            inner.available.push(object);
        }
        Ok(())
    }

    /// Blocks until no deferred return remains in flight. Teardown helper,
    /// called after the device has gone (or is going) idle.
    pub fn drain(&self) -> RhiResult<()> {
        loop {
            self.check_futures()?;
            {
                let inner = self.lock();
                if inner.waiters.is_empty() && inner.pending.is_empty() {
                    return Ok(());
                }
            }
            std::thread::yield_now();
        }
    }

    /// Empties the registry, dropping every pooled object. Objects still
    /// checked out elsewhere survive through their own `Arc`s; the pool
    /// must be drained first.
    pub fn clear_all(&self) -> RhiResult<()> {
        let mut inner = self.lock();
        if !inner.waiters.is_empty() || !inner.pending.is_empty() {
            return Err(RhiError::InvalidState(format!(
                "pool '{}' cleared with returns still pending",
                self.label
            )));
        }
        inner.available.clear();
        inner.all.clear();
        Ok(())
    }

    pub fn all_len(&self) -> usize {
        self.lock().all.len()
    }

    pub fn available_len(&self) -> usize {
        self.lock().available.len()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn already_returned(inner: &PoolInner<T>, key: u64) -> bool {
        inner.pending.contains(&key) || inner.available.iter().any(|o| o.pool_key() == key)
    }

    fn check_membership(
        inner: &PoolInner<T>,
        key: u64,
        label: &str,
        object: &Arc<T>,
    ) -> RhiResult<()> {
        if inner.all.iter().any(|o| o.pool_key() == key) {
            Ok(())
        } else {
            Err(RhiError::InvalidState(format!(
                "'{}' does not belong to pool '{}'",
                object.debug_label(),
                label
            )))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    /// Pool item whose completion is flipped by the test.
    #[derive(Debug)]
    struct TestItem {
        key: u64,
        label: String,
        family: u32,
        busy: AtomicBool,
        recycles: AtomicU64,
    }

    impl TestItem {
        fn new(key: u64, family: u32) -> Arc<Self> {
            Arc::new(Self {
                key,
                label: format!("item_{}", key),
                family,
                busy: AtomicBool::new(false),
                recycles: AtomicU64::new(0),
            })
        }
    }

    impl Poolable for TestItem {
        fn pool_key(&self) -> u64 {
            self.key
        }
        fn debug_label(&self) -> &str {
            &self.label
        }
        fn is_idle(&self) -> RhiResult<bool> {
            Ok(!self.busy.load(Ordering::Acquire))
        }
        fn wait_ready(&self) -> RhiResult<()> {
            while self.busy.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
            Ok(())
        }
        fn recycle(&self) -> RhiResult<()> {
            self.recycles.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn grown_pool() -> ObjectPool<TestItem> {
        let counter = AtomicU64::new(0);
        ObjectPool::new(
            "test",
            Some(Box::new(move || {
                Ok(TestItem::new(counter.fetch_add(1, Ordering::Relaxed), 0))
            })),
        )
    }

    fn wait_until(pool: &ObjectPool<TestItem>, cond: impl Fn(&ObjectPool<TestItem>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond(pool) {
            pool.check_futures().unwrap();
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_no_premature_reuse() {
        // A busy object returned to the pool must not reappear until its
        // completion condition holds.
        let pool = grown_pool();
        let item = pool.acquire(|_| true).unwrap();
        item.busy.store(true, Ordering::Release);
        pool.release(&item).unwrap();

        // Keep every fresh object checked out so the pool cannot hand the
        // same one back twice.
        let mut held = Vec::new();
        for _ in 0..10 {
            let other = pool.acquire(|_| true).unwrap();
            assert_ne!(other.pool_key(), item.pool_key());
            held.push(other);
        }

        item.busy.store(false, Ordering::Release);
        wait_until(&pool, |p| p.pending_len() == 0);
        let recovered = pool.acquire(|i| i.pool_key() == item.pool_key()).unwrap();
        assert_eq!(recovered.pool_key(), item.pool_key());
    }

    #[test]
    fn test_growth_instead_of_failure() {
        // Demand beyond supply grows the pool instead of failing.
        let pool = grown_pool();
        let a = pool.acquire(|_| true).unwrap();
        pool.release(&a).unwrap();
        assert_eq!(pool.all_len(), 1);

        let _first = pool.acquire(|_| true).unwrap();
        let _second = pool.acquire(|_| true).unwrap();
        assert_eq!(pool.all_len(), 2);
    }

    #[test]
    fn test_selector_isolation() {
        // A selector never receives an object it rejected.
        let pool: ObjectPool<TestItem> = ObjectPool::new("families", None);
        pool.register(TestItem::new(1, 0));
        pool.register(TestItem::new(2, 1));
        for _ in 0..8 {
            let item = pool.acquire(|i| i.family == 1).unwrap();
            assert_eq!(item.family, 1);
            pool.release(&item).unwrap();
        }
    }

    #[test]
    fn test_unsatisfiable_selector_is_configuration_error() {
        let pool: ObjectPool<TestItem> = ObjectPool::new("fixed", None);
        pool.register(TestItem::new(1, 0));
        let err = pool.acquire(|i| i.family == 9).unwrap_err();
        assert!(matches!(err, RhiError::Configuration(_)));
    }

    #[test]
    fn test_idempotent_release() {
        // Releasing a pending object twice spawns one waiter and
        // reinserts the object exactly once.
        let pool = grown_pool();
        let item = pool.acquire(|_| true).unwrap();
        item.busy.store(true, Ordering::Release);
        pool.release(&item).unwrap();
        pool.release(&item).unwrap();
        assert_eq!(pool.pending_len(), 1);

        item.busy.store(false, Ordering::Release);
        wait_until(&pool, |p| p.pending_len() == 0);
        assert_eq!(pool.available_len(), 1);
        assert_eq!(item.recycles.load(Ordering::Relaxed), 1);

        // Releasing an already-available object is also a no-op.
        pool.release(&item).unwrap();
        assert_eq!(pool.available_len(), 1);
    }

    #[test]
    fn test_release_of_foreign_object_is_rejected() {
        let pool: ObjectPool<TestItem> = ObjectPool::new("strict", None);
        pool.register(TestItem::new(1, 0));
        let foreign = TestItem::new(99, 0);
        assert!(matches!(
            pool.release(&foreign),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_idle_release_recycles_once() {
        let pool = grown_pool();
        let item = pool.acquire(|_| true).unwrap();
        pool.release(&item).unwrap();
        assert_eq!(item.recycles.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drain_waits_for_pending_returns() {
        let pool = grown_pool();
        let item = pool.acquire(|_| true).unwrap();
        item.busy.store(true, Ordering::Release);
        pool.release(&item).unwrap();

        let flipper = {
            let item = item.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                item.busy.store(false, Ordering::Release);
            })
        };
        pool.drain().unwrap();
        flipper.join().unwrap();
        assert_eq!(pool.pending_len(), 0);
        assert_eq!(pool.available_len(), 1);
    }

    #[test]
    fn test_concurrent_checkout_is_exclusive() {
        // Two threads hammering acquire/release must never hold the same
        // object at the same time.
        let pool = Arc::new(grown_pool());
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let in_use = in_use.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let item = pool.acquire(|_| true).unwrap();
                    {
                        let mut set = in_use.lock().unwrap();
                        assert!(set.insert(item.pool_key()), "double checkout");
                    }
                    std::thread::yield_now();
                    {
                        let mut set = in_use.lock().unwrap();
                        set.remove(&item.pool_key());
                    }
                    pool.release(&item).unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
    }
}
