//! Bounded connection pool.
//!
//! At most `max` values exist at once (idle plus checked out). Checked-out
//! values come back through the [`Pooled`] guard: on drop they are returned to
//! the idle list, unless the guard was marked not reusable, in which case the
//! value is dropped and its slot freed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

type Factory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub acquired: usize,
    pub released: usize,
    pub discarded: usize,
    pub idle: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

/// A bounded pool for connection-like values.
pub struct Pool<T> {
    max: usize,
    factory: Factory<T>,
    idle: Mutex<Vec<T>>,
    available: Condvar,
    in_flight: AtomicUsize,
    counters: Counters,
}

/// A checked-out value. Returned to the pool on drop.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
    reusable: bool,
}

impl<T> Pool<T> {
    pub fn new<F>(max: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Arc::new(Self {
            max: max.max(1),
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            available: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            counters: Counters::default(),
        })
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<T>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out an idle value, creates one if below capacity, or waits up
    /// to `timeout` for a release.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Pooled<T>> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.lock_idle();
        loop {
            if let Some(item) = idle.pop() {
                return Ok(self.checkout(item));
            }

            if self.in_flight.load(Ordering::SeqCst) < self.max {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                drop(idle);
                return match (self.factory)() {
                    Ok(item) => {
                        self.counters.created.fetch_add(1, Ordering::SeqCst);
                        Ok(self.checkout(item))
                    }
                    Err(e) => {
                        self.in_flight.fetch_sub(1, Ordering::SeqCst);
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ConnectionUnavailable {
                    reason: format!(
                        "no connection available within {} ms ({} in use)",
                        timeout.as_millis(),
                        self.max
                    ),
                    statement: None,
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(idle, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            idle = guard;
        }
    }

    fn checkout(self: &Arc<Self>, item: T) -> Pooled<T> {
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Pooled {
            pool: Arc::clone(self),
            value: Some(item),
            reusable: true,
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::SeqCst),
            acquired: self.counters.acquired.load(Ordering::SeqCst),
            released: self.counters.released.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
            idle: self.lock_idle().len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    fn release(&self, item: T) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        self.lock_idle().push(item);
        self.available.notify_one();
    }

    fn discard(&self, item: T) {
        drop(item);
        self.counters.discarded.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// When false, the value is dropped instead of returned on drop.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Drops the value and frees its slot.
    pub fn discard(mut self) {
        if let Some(item) = self.value.take() {
            self.pool.discard(item);
        }
    }
}

impl<T> std::ops::Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .expect("pooled value is present until drop")
    }
}

impl<T> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .expect("pooled value is present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            if self.reusable {
                self.pool.release(item);
            } else {
                self.pool.discard(item);
            }
        }
    }
}
