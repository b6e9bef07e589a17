//! Buffer pools: the global [`BufferManager`] and per-source [`LocalBufferPool`]s.
//!
//! All pooled memory is allocated once at construction. Acquiring a buffer pops
//! a block from a free list; dropping the last [`TupleBuffer`] handle pushes it
//! back and wakes one blocked acquirer. A local pool borrows blocks from the
//! global pool and hands them back when it is destroyed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::buffer::TupleBuffer;
use super::{BufferError, BufferProvider};

/// Where a buffer's memory goes when its last handle drops.
pub(crate) enum Recycler {
    /// Back into a free list.
    Pooled(Arc<PoolShared>),
    /// Release the unpooled byte reservation.
    Unpooled(Arc<UnpooledBudget>),
    /// Plain heap memory, simply freed.
    Detached,
}

impl Recycler {
    pub(crate) fn recycle(&self, memory: Box<[u8]>) {
        match self {
            Self::Pooled(pool) => pool.recycle(memory),
            Self::Unpooled(budget) => budget.release(memory.len()),
            Self::Detached => {}
        }
    }

    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }
}

/// Free list shared between a pool and all buffers it handed out.
pub(crate) struct PoolShared {
    buffer_size: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
    total: AtomicUsize,
    parent: Option<Arc<PoolShared>>,
    destroyed: AtomicBool,
}

impl PoolShared {
    fn new(buffer_size: usize, blocks: Vec<Box<[u8]>>, parent: Option<Arc<PoolShared>>) -> Self {
        Self {
            buffer_size,
            total: AtomicUsize::new(blocks.len()),
            free: Mutex::new(blocks),
            available: Condvar::new(),
            parent,
            destroyed: AtomicBool::new(false),
        }
    }

    fn recycle(&self, memory: Box<[u8]>) {
        let mut free = self.free.lock();
        // Checked under the free-list lock so that `destroy` cannot strand a block.
        if self.destroyed.load(Ordering::Acquire) {
            drop(free);
            if let Some(parent) = &self.parent {
                parent.recycle(memory);
            }
            return;
        }
        free.push(memory);
        drop(free);
        self.available.notify_one();
    }

    fn wrap(self: &Arc<Self>, mut memory: Box<[u8]>) -> TupleBuffer {
        memory.fill(0);
        TupleBuffer::from_memory(memory, Recycler::Pooled(Arc::clone(self)))
    }

    fn acquire_blocking(self: &Arc<Self>) -> TupleBuffer {
        let mut free = self.free.lock();
        loop {
            if let Some(memory) = free.pop() {
                drop(free);
                return self.wrap(memory);
            }
            self.available.wait(&mut free);
        }
    }

    fn acquire_no_blocking(self: &Arc<Self>) -> Option<TupleBuffer> {
        let memory = self.free.lock().pop()?;
        Some(self.wrap(memory))
    }

    fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<TupleBuffer> {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock();
        loop {
            if let Some(memory) = free.pop() {
                drop(free);
                return Some(self.wrap(memory));
            }
            if self.available.wait_until(&mut free, deadline).timed_out() {
                let memory = free.pop()?;
                drop(free);
                return Some(self.wrap(memory));
            }
        }
    }

    /// Moves `count` blocks out of this pool, waiting for in-flight ones.
    /// Fails up front when the pool does not own `count` blocks.
    fn take_blocks(&self, count: usize) -> Result<Vec<Box<[u8]>>, BufferError> {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| total.checked_sub(count))
            .map_err(|total| BufferError::PoolExhausted {
                requested: count,
                owned: total,
            })?;
        let mut taken = Vec::with_capacity(count);
        let mut free = self.free.lock();
        while taken.len() < count {
            match free.pop() {
                Some(memory) => taken.push(memory),
                None => self.available.wait(&mut free),
            }
        }
        Ok(taken)
    }

    fn destroy(&self) {
        let mut free = self.free.lock();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let idle: Vec<Box<[u8]>> = free.drain(..).collect();
        drop(free);
        if let Some(parent) = &self.parent {
            for memory in idle {
                parent.recycle(memory);
            }
            parent.total.fetch_add(self.total.load(Ordering::Acquire), Ordering::AcqRel);
        }
    }

    fn available_blocks(&self) -> usize {
        self.free.lock().len()
    }
}

/// Byte budget for unpooled buffers.
pub(crate) struct UnpooledBudget {
    limit: usize,
    used: AtomicUsize,
}

impl UnpooledBudget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, size: usize) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(size).filter(|next| *next <= self.limit) else {
                return false;
            };
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn allocate(self: &Arc<Self>, size: usize) -> Result<TupleBuffer, BufferError> {
        if !self.reserve(size) {
            return Err(BufferError::CannotAllocateBuffer {
                requested: size,
                reason: "unpooled budget exhausted",
            });
        }
        let mut memory = Vec::new();
        if memory.try_reserve_exact(size).is_err() {
            self.release(size);
            return Err(BufferError::CannotAllocateBuffer {
                requested: size,
                reason: "allocator refused request",
            });
        }
        memory.resize(size, 0);
        Ok(TupleBuffer::from_memory(
            memory.into_boxed_slice(),
            Recycler::Unpooled(Arc::clone(self)),
        ))
    }
}

/// Global pool of fixed-size tuple buffers.
///
/// Cloning a `BufferManager` yields another handle to the same pool.
///
/// # Example
///
/// ```rust
/// use slipstream_core::memory::{BufferManager, BufferProvider};
///
/// let manager = BufferManager::new(4096, 2, 1 << 20);
/// let a = manager.get_buffer_blocking();
/// let _b = manager.get_buffer_blocking();
/// assert!(manager.get_buffer_no_blocking().is_none());
/// drop(a);
/// assert!(manager.get_buffer_no_blocking().is_some());
/// ```
#[derive(Clone)]
pub struct BufferManager {
    shared: Arc<PoolShared>,
    unpooled: Arc<UnpooledBudget>,
}

impl BufferManager {
    /// Creates a pool of `number_of_buffers` buffers of `buffer_size` bytes
    /// and an unpooled budget of `max_unpooled_bytes`.
    #[must_use]
    pub fn new(buffer_size: usize, number_of_buffers: usize, max_unpooled_bytes: usize) -> Self {
        let blocks = (0..number_of_buffers)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(PoolShared::new(buffer_size, blocks, None)),
            unpooled: Arc::new(UnpooledBudget::new(max_unpooled_bytes)),
        }
    }

    /// Creates a pool from engine configuration.
    #[must_use]
    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(
            config.buffer_size,
            config.number_of_buffers,
            config.max_unpooled_bytes,
        )
    }

    /// Moves `number_of_buffers` buffers out of the global pool into a
    /// dedicated local pool.
    ///
    /// Blocks until enough buffers are free.
    ///
    /// # Errors
    ///
    /// [`BufferError::PoolExhausted`] when the global pool does not own that
    /// many buffers, counting the ones in flight.
    pub fn create_local_buffer_pool(
        &self,
        number_of_buffers: usize,
    ) -> Result<LocalBufferPool, BufferError> {
        let blocks = self.shared.take_blocks(number_of_buffers)?;
        Ok(LocalBufferPool {
            shared: Arc::new(PoolShared::new(
                self.shared.buffer_size,
                blocks,
                Some(Arc::clone(&self.shared)),
            )),
            unpooled: Arc::clone(&self.unpooled),
        })
    }

    /// Bytes currently reserved by live unpooled buffers.
    #[must_use]
    pub fn unpooled_bytes_in_use(&self) -> usize {
        self.unpooled.used()
    }
}

impl BufferProvider for BufferManager {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        self.shared.acquire_blocking()
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        self.shared.acquire_no_blocking()
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        self.shared.acquire_timeout(timeout)
    }

    fn get_unpooled_buffer(&self, size: usize) -> Result<TupleBuffer, BufferError> {
        self.unpooled.allocate(size)
    }

    fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    fn available_buffers(&self) -> usize {
        self.shared.available_blocks()
    }

    fn number_of_pooled_buffers(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("buffer_size", &self.buffer_size())
            .field("pooled", &self.number_of_pooled_buffers())
            .field("available", &self.available_buffers())
            .field("unpooled_bytes", &self.unpooled_bytes_in_use())
            .finish()
    }
}

/// Fixed set of buffers reserved from a [`BufferManager`] for one consumer.
///
/// Buffers acquired here recycle into this pool. Dropping (or
/// [`destroy`](Self::destroy)ing) the pool returns idle buffers to the global
/// pool immediately; buffers still in flight go there when released. After
/// destruction, blocking acquisition is served by the global pool.
pub struct LocalBufferPool {
    shared: Arc<PoolShared>,
    unpooled: Arc<UnpooledBudget>,
}

impl LocalBufferPool {
    /// Returns all buffers to the global pool. Idempotent.
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    /// Returns true once the pool was destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for LocalBufferPool {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

impl BufferProvider for LocalBufferPool {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        match &self.shared.parent {
            Some(parent) if self.is_destroyed() => parent.acquire_blocking(),
            _ => self.shared.acquire_blocking(),
        }
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        if self.is_destroyed() {
            return None;
        }
        self.shared.acquire_no_blocking()
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        if self.is_destroyed() {
            return None;
        }
        self.shared.acquire_timeout(timeout)
    }

    fn get_unpooled_buffer(&self, size: usize) -> Result<TupleBuffer, BufferError> {
        self.unpooled.allocate(size)
    }

    fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    fn available_buffers(&self) -> usize {
        self.shared.available_blocks()
    }

    fn number_of_pooled_buffers(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LocalBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBufferPool")
            .field("buffer_size", &self.buffer_size())
            .field("available", &self.available_buffers())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
