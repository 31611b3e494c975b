//! Hierarchical sub-pools over the global arena.

use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::buffer::TupleBuffer;
use crate::error::BufferError;
use crate::manager::{BufferRecycler, Shared};

/// Acquisition surface shared by the global manager and its sub-pools.
/// Sources and worker contexts hold providers as trait objects.
pub trait BufferProvider: Send + Sync {
    /// Block until a buffer is available.
    fn get_buffer_blocking(&self) -> TupleBuffer;

    /// Block for at most `timeout`.
    fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError>;

    /// Return `None` immediately when the pool is drained.
    fn try_get_buffer(&self) -> Option<TupleBuffer>;

    fn available_buffers(&self) -> usize;

    fn buffer_size(&self) -> usize;
}

struct LocalState {
    shared: Arc<Shared>,
    cap: usize,
    fallback: bool,
    in_use: Mutex<usize>,
    returned: Condvar,
}

impl LocalState {
    /// Take one quota permit, waiting up to the deadline. `Ok(false)` means
    /// the quota is exhausted and the pool is configured to fall back.
    fn acquire_permit(&self, deadline: Option<Instant>) -> Result<bool, BufferError> {
        let mut in_use = self.in_use.lock();
        loop {
            if *in_use < self.cap {
                *in_use += 1;
                return Ok(true);
            }
            if self.fallback {
                return Ok(false);
            }
            match deadline {
                Some(deadline) => {
                    if self.returned.wait_until(&mut in_use, deadline).timed_out() {
                        return Err(BufferError::PoolExhausted(Duration::ZERO));
                    }
                }
                None => self.returned.wait(&mut in_use),
            }
        }
    }

    fn release_permit(&self) {
        let mut in_use = self.in_use.lock();
        *in_use -= 1;
        drop(in_use);
        self.returned.notify_one();
    }
}

impl BufferRecycler for LocalState {
    fn recycle(&self, index: u32, shared: &Arc<Shared>) {
        shared.release_to_global(index);
        self.release_permit();
    }
}

/// Capped sub-pool drawing from the global free list under a counting
/// quota. With fallback enabled, acquisitions past the quota hit the global
/// pool directly; without it they block on the quota.
#[derive(Clone)]
pub struct LocalBufferPool {
    state: Arc<LocalState>,
}

impl LocalBufferPool {
    pub(crate) fn new(shared: Arc<Shared>, cap: usize, fallback: bool) -> Self {
        assert!(cap > 0, "local pool must hold at least one buffer");
        LocalBufferPool {
            state: Arc::new(LocalState {
                shared,
                cap,
                fallback,
                in_use: Mutex::new(0),
                returned: Condvar::new(),
            }),
        }
    }

    fn get(&self, timeout: Option<Duration>) -> Result<TupleBuffer, BufferError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        if self.state.acquire_permit(deadline)? {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let index = match self.state.shared.pop_free_blocking(remaining) {
                Ok(index) => index,
                Err(err) => {
                    self.state.release_permit();
                    return Err(err);
                }
            };
            let recycler: Arc<dyn BufferRecycler> = self.state.clone();
            Ok(self.state.shared.checkout(index, Some(recycler)))
        } else {
            trace!("local pool quota exhausted, falling back to global pool");
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let index = self.state.shared.pop_free_blocking(remaining)?;
            Ok(self.state.shared.checkout(index, None))
        }
    }

    /// Buffers of the quota currently checked out.
    pub fn in_use(&self) -> usize {
        *self.state.in_use.lock()
    }
}

impl BufferProvider for LocalBufferPool {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        self.get(None).expect("untimed wait cannot exhaust")
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError> {
        self.get(Some(timeout))
    }

    fn try_get_buffer(&self) -> Option<TupleBuffer> {
        let permit = {
            let mut in_use = self.state.in_use.lock();
            if *in_use < self.state.cap {
                *in_use += 1;
                true
            } else if self.state.fallback {
                false
            } else {
                return None;
            }
        };
        if permit {
            match self.state.shared.pop_free() {
                Some(index) => {
                    let recycler: Arc<dyn BufferRecycler> = self.state.clone();
                    Some(self.state.shared.checkout(index, Some(recycler)))
                }
                None => {
                    self.state.release_permit();
                    None
                }
            }
        } else {
            let index = self.state.shared.pop_free()?;
            Some(self.state.shared.checkout(index, None))
        }
    }

    fn available_buffers(&self) -> usize {
        let in_use = *self.state.in_use.lock();
        (self.state.cap - in_use).min(self.state.shared.available())
    }

    fn buffer_size(&self) -> usize {
        self.state.shared.buffer_size()
    }
}

struct FixedState {
    shared: Arc<Shared>,
    free: ArrayQueue<u32>,
    gate: Mutex<()>,
    on_return: Condvar,
}

impl BufferRecycler for FixedState {
    fn recycle(&self, index: u32, _shared: &Arc<Shared>) {
        self.free
            .push(index)
            .expect("fixed pool free list sized to its buffer set");
        drop(self.gate.lock());
        self.on_return.notify_one();
    }
}

impl Drop for FixedState {
    fn drop(&mut self) {
        // All handles are gone by now; give the exclusive set back.
        while let Some(index) = self.free.pop() {
            self.shared.release_to_global(index);
        }
    }
}

/// Bounded pool owning an exclusive set of buffers with no fallback.
///
/// A source bound to a fixed pool stalls once all its buffers are in
/// flight, which is what propagates backpressure upstream.
#[derive(Clone)]
pub struct FixedSizeBufferPool {
    state: Arc<FixedState>,
}

impl FixedSizeBufferPool {
    pub(crate) fn new(shared: Arc<Shared>, count: usize) -> Self {
        assert!(count > 0, "fixed pool must hold at least one buffer");
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            let index = shared
                .pop_free_blocking(None)
                .expect("untimed wait cannot exhaust");
            free.push(index).expect("fixed pool free list sized to count");
        }
        FixedSizeBufferPool {
            state: Arc::new(FixedState {
                shared,
                free,
                gate: Mutex::new(()),
                on_return: Condvar::new(),
            }),
        }
    }

    fn get(&self, timeout: Option<Duration>) -> Result<TupleBuffer, BufferError> {
        if let Some(index) = self.state.free.pop() {
            return Ok(self.checkout(index));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.gate.lock();
        loop {
            if let Some(index) = self.state.free.pop() {
                drop(guard);
                return Ok(self.checkout(index));
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .state
                        .on_return
                        .wait_until(&mut guard, deadline)
                        .timed_out()
                    {
                        return Err(BufferError::PoolExhausted(timeout.unwrap_or_default()));
                    }
                }
                None => self.state.on_return.wait(&mut guard),
            }
        }
    }

    fn checkout(&self, index: u32) -> TupleBuffer {
        let recycler: Arc<dyn BufferRecycler> = self.state.clone();
        self.state.shared.checkout(index, Some(recycler))
    }

    /// Total buffers owned by this pool.
    pub fn capacity(&self) -> usize {
        self.state.free.capacity()
    }
}

impl BufferProvider for FixedSizeBufferPool {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        self.get(None).expect("untimed wait cannot exhaust")
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Result<TupleBuffer, BufferError> {
        self.get(Some(timeout))
    }

    fn try_get_buffer(&self) -> Option<TupleBuffer> {
        let index = self.state.free.pop()?;
        Some(self.checkout(index))
    }

    fn available_buffers(&self) -> usize {
        self.state.free.len()
    }

    fn buffer_size(&self) -> usize {
        self.state.shared.buffer_size()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crate::manager::BufferManager;

    use super::*;

    #[test]
    fn fixed_pool_is_exclusive() {
        let manager = BufferManager::new(256, 4);
        let pool = manager.create_fixed_size_buffer_pool(3);
        assert_eq!(pool.available_buffers(), 3);
        assert_eq!(manager.available_buffers(), 1);

        let held = pool.try_get_buffer().unwrap();
        assert_eq!(pool.available_buffers(), 2);
        // Recycles into the fixed pool, not the global free list.
        drop(held);
        assert_eq!(pool.available_buffers(), 3);
        assert_eq!(manager.available_buffers(), 1);
    }

    #[test]
    fn fixed_pool_returns_buffers_on_drop() {
        let manager = BufferManager::new(256, 4);
        let pool = manager.create_fixed_size_buffer_pool(3);
        let held = pool.try_get_buffer().unwrap();
        drop(pool);
        // The outstanding buffer keeps its slice of the pool alive.
        assert_eq!(manager.available_buffers(), 1);
        drop(held);
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn fixed_pool_bounds_outstanding_buffers() {
        let manager = BufferManager::new(256, 8);
        let pool = manager.create_fixed_size_buffer_pool(2);
        let a = pool.try_get_buffer().unwrap();
        let _b = pool.try_get_buffer().unwrap();
        assert!(pool.try_get_buffer().is_none());

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get_buffer_blocking())
        };
        thread::sleep(Duration::from_millis(30));
        drop(a);
        waiter.join().unwrap();
    }

    #[test]
    fn local_pool_respects_cap_without_fallback() {
        let manager = BufferManager::new(256, 8);
        let pool = manager.create_local_buffer_pool(2, false);
        let _a = pool.try_get_buffer().unwrap();
        let _b = pool.try_get_buffer().unwrap();
        assert!(pool.try_get_buffer().is_none());
        assert!(
            pool.get_buffer_timeout(Duration::from_millis(20)).is_err(),
            "quota must hold even though the global pool has buffers left"
        );
    }

    #[test]
    fn local_pool_falls_back_when_configured() {
        let manager = BufferManager::new(256, 8);
        let pool = manager.create_local_buffer_pool(2, true);
        let _a = pool.try_get_buffer().unwrap();
        let _b = pool.try_get_buffer().unwrap();
        let c = pool.try_get_buffer().expect("fallback draws from global");
        assert_eq!(pool.in_use(), 2);
        drop(c);
        assert_eq!(manager.available_buffers(), 6);
    }
}
