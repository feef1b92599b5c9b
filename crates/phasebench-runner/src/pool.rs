use crate::error::UnitError;
use anyhow::{bail, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub type HandleFactory<C> = Box<dyn Fn() -> Result<C, UnitError> + Send + Sync>;

/// Shares a capped set of backend clients between many workers.
///
/// Handles are created lazily until `max_handles` exist, then handed out
/// round-robin. Independently of which handle is used, at most
/// `max_concurrent_requests` calls are in flight across the whole pool.
pub struct ResourcePool<C> {
    max_handles: usize,
    factory: HandleFactory<C>,
    handles: Mutex<HandleSet<C>>,
    slots: Slots,
}

struct HandleSet<C> {
    items: Vec<Arc<C>>,
    cursor: usize,
}

impl<C> ResourcePool<C> {
    pub fn new(
        max_concurrent_requests: usize,
        max_handles: usize,
        factory: HandleFactory<C>,
    ) -> Result<Arc<Self>> {
        if max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be at least 1");
        }
        if max_handles == 0 {
            bail!("max_handles must be at least 1");
        }
        Ok(Arc::new(Self {
            max_handles,
            factory,
            handles: Mutex::new(HandleSet {
                items: Vec::new(),
                cursor: 0,
            }),
            slots: Slots::new(max_concurrent_requests),
        }))
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.slots.total
    }

    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    pub fn handle_count(&self) -> usize {
        lock_or_recover(&self.handles).items.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.total - *lock_or_recover(&self.slots.avail)
    }

    pub fn acquire_handle(self: &Arc<Self>) -> Result<PooledHandle<C>, UnitError> {
        let mut set = lock_or_recover(&self.handles);
        let handle = if set.items.len() < self.max_handles {
            let created = Arc::new((self.factory)()?);
            set.items.push(Arc::clone(&created));
            tracing::debug!(handles = set.items.len(), "created backend handle");
            created
        } else {
            let idx = set.cursor % set.items.len();
            set.cursor = (idx + 1) % set.items.len();
            Arc::clone(&set.items[idx])
        };
        Ok(PooledHandle {
            pool: Arc::clone(self),
            handle,
        })
    }

    pub fn call<T>(
        self: &Arc<Self>,
        f: impl FnOnce(&C) -> Result<T, UnitError>,
    ) -> Result<T, UnitError> {
        self.acquire_handle()?.call(f)
    }
}

pub struct PooledHandle<C> {
    pool: Arc<ResourcePool<C>>,
    handle: Arc<C>,
}

impl<C> PooledHandle<C> {
    pub fn call<T, E>(&self, f: impl FnOnce(&C) -> Result<T, E>) -> Result<T, E> {
        let _slot = self.pool.slots.acquire();
        f(&self.handle)
    }

    pub fn shares_handle_with(&self, other: &PooledHandle<C>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

struct Slots {
    total: usize,
    avail: Mutex<usize>,
    cv: Condvar,
}

impl Slots {
    fn new(total: usize) -> Self {
        Self {
            total,
            avail: Mutex::new(total),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> SlotGuard<'_> {
        let mut avail = lock_or_recover(&self.avail);
        while *avail == 0 {
            avail = match self.cv.wait(avail) {
                Ok(guard) => guard,
                Err(poison) => poison.into_inner(),
            };
        }
        *avail -= 1;
        SlotGuard { slots: self }
    }

    fn release(&self) {
        let mut avail = lock_or_recover(&self.avail);
        *avail += 1;
        debug_assert!(*avail <= self.total, "slot over-release");
        drop(avail);
        self.cv.notify_one();
    }
}

struct SlotGuard<'a> {
    slots: &'a Slots,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.release();
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn counting_pool(
        max_concurrent: usize,
        max_handles: usize,
    ) -> (Arc<ResourcePool<usize>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ResourcePool::new(
            max_concurrent,
            max_handles,
            Box::new(move || Ok::<_, UnitError>(counter.fetch_add(1, Ordering::SeqCst))),
        )
        .expect("pool");
        (pool, created)
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(ResourcePool::<()>::new(0, 1, Box::new(|| Ok::<(), UnitError>(()))).is_err());
        assert!(ResourcePool::<()>::new(1, 0, Box::new(|| Ok::<(), UnitError>(()))).is_err());
    }

    #[test]
    fn handles_are_capped_then_round_robined() {
        let (pool, created) = counting_pool(4, 3);
        let ids: Vec<usize> = (0..7)
            .map(|_| {
                pool.acquire_handle()
                    .expect("handle")
                    .call(|id| Ok::<_, UnitError>(*id))
                    .expect("call")
            })
            .collect();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.handle_count(), 3);
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn single_handle_is_shared() {
        let (pool, _) = counting_pool(2, 1);
        let a = pool.acquire_handle().expect("handle");
        let b = pool.acquire_handle().expect("handle");
        assert!(a.shares_handle_with(&b));
    }

    #[test]
    fn factory_failure_is_reported_and_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let pool = ResourcePool::new(
            1,
            1,
            Box::new(move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UnitError::api(None, "connection refused"))
                } else {
                    Ok(())
                }
            }),
        )
        .expect("pool");
        let err = pool.acquire_handle().err().expect("first acquire fails");
        assert_eq!(err, UnitError::api(None, "connection refused"));
        assert_eq!(pool.handle_count(), 0);
        assert!(pool.acquire_handle().is_ok());
        assert_eq!(pool.handle_count(), 1);
    }

    #[test]
    fn concurrent_uses_never_exceed_limit() {
        for k in 1..=4 {
            let (pool, _) = counting_pool(k, 2);
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    thread::spawn(move || {
                        pool.call(|_| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(5));
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                    })
                })
                .collect();
            for handle in handles {
                handle.join().expect("caller").expect("call");
            }
            assert!(peak.load(Ordering::SeqCst) <= k, "peak exceeded {}", k);
            assert_eq!(pool.in_flight(), 0);
        }
    }

    #[test]
    fn slot_is_released_on_error_and_panic() {
        let (pool, _) = counting_pool(1, 1);
        let res: Result<(), UnitError> =
            pool.call(|_| Err(UnitError::BackendTimeout("stalled".into())));
        assert!(res.is_err());
        assert_eq!(pool.in_flight(), 0);

        let panicking = Arc::clone(&pool);
        let joined = thread::spawn(move || {
            let _ = panicking.call(|_| -> Result<(), UnitError> { panic!("handle blew up") });
        })
        .join();
        assert!(joined.is_err());
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.call(|_| Ok(())).is_ok());
    }
}
