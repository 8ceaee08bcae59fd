//! Fixed-size pools for metadata I/O buffers.
//!
//! Metadata write-back (refcount blocks, slab-journal blocks, summary
//! blocks) draws pre-allocated block buffers from a per-allocator pool so
//! that write-back never allocates on the I/O path. A small reserve is held
//! back for drain paths: a drain must always be able to flush even when the
//! pool is otherwise exhausted.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::constants::BLOCK_SIZE;

/// A pooled metadata block buffer.
pub type VioBuffer = Box<[u8; BLOCK_SIZE]>;

fn new_buffer() -> VioBuffer {
    Box::new([0u8; BLOCK_SIZE])
}

/// Priority of a pool acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VioPriority {
    /// Ordinary write-back; may be refused while only the reserve remains.
    Normal,
    /// Drain and flush paths; may consume the reserve.
    Drain,
}

/// Fixed ring of pre-allocated buffers.
pub struct VioPool {
    queue: ArrayQueue<VioBuffer>,
    reserved: usize,
    outstanding: AtomicUsize,
    waiters: Mutex<VecDeque<u64>>,
    next_waiter: AtomicUsize,
}

impl VioPool {
    /// Create a pool of `size` buffers, `reserved` of which only
    /// [`VioPriority::Drain`] acquisitions may take.
    pub fn new(size: usize, reserved: usize) -> VioPool {
        debug_assert!(reserved < size);
        let queue = ArrayQueue::new(size);
        for _ in 0..size {
            // The queue was sized for exactly these pushes.
            let _ = queue.push(new_buffer());
        }
        VioPool {
            queue,
            reserved,
            outstanding: AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
            next_waiter: AtomicUsize::new(0),
        }
    }

    /// Take a buffer, or register as a waiter and return `None`.
    pub fn acquire(&self, priority: VioPriority) -> Option<VioBuffer> {
        if priority == VioPriority::Normal && self.queue.len() <= self.reserved {
            self.enqueue_waiter();
            return None;
        }
        match self.queue.pop() {
            Some(buffer) => {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                Some(buffer)
            }
            None => {
                self.enqueue_waiter();
                None
            }
        }
    }

    /// Return a buffer; wakes the head waiter if one is queued.
    ///
    /// Returns the woken waiter's ticket so the owning zone can requeue its
    /// parked operation.
    pub fn release(&self, mut buffer: VioBuffer) -> Option<u64> {
        buffer.fill(0);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let _ = self.queue.push(buffer);
        self.waiters.lock().pop_front()
    }

    /// Buffers currently checked out.
    pub fn busy(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Parked acquisitions.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn enqueue_waiter(&self) {
        let ticket = self.next_waiter.fetch_add(1, Ordering::Relaxed) as u64;
        self.waiters.lock().push_back(ticket);
    }
}

impl Drop for VioPool {
    fn drop(&mut self) {
        // Outstanding buffers at teardown mean a leaked I/O.
        debug_assert_eq!(self.outstanding.load(Ordering::Relaxed), 0);
    }
}

/// A generic fixed-reserve object pool, pre-filled at creation.
pub struct Mempool<T> {
    items: Mutex<VecDeque<T>>,
    outstanding: AtomicUsize,
    minimum: usize,
}

impl<T> Mempool<T> {
    /// Build a pool holding `minimum` objects created by `make`.
    pub fn new(minimum: usize, make: impl Fn() -> T) -> Mempool<T> {
        let mut items = VecDeque::with_capacity(minimum);
        for _ in 0..minimum {
            items.push_back(make());
        }
        Mempool {
            items: Mutex::new(items),
            outstanding: AtomicUsize::new(0),
            minimum,
        }
    }

    pub fn acquire(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    pub fn release(&self, item: T) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.items.lock().push_back(item);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn minimum(&self) -> usize {
        self.minimum
    }
}

impl<T> Drop for Mempool<T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.outstanding.load(Ordering::Relaxed), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_held_for_drain() {
        let pool = VioPool::new(3, 1);
        let a = pool.acquire(VioPriority::Normal).unwrap();
        let b = pool.acquire(VioPriority::Normal).unwrap();
        // Only the reserve remains; a normal acquire parks.
        assert!(pool.acquire(VioPriority::Normal).is_none());
        assert_eq!(pool.waiter_count(), 1);
        // A drain acquire may take the reserve.
        let c = pool.acquire(VioPriority::Drain).unwrap();
        assert_eq!(pool.busy(), 3);
        assert!(pool.release(a).is_some());
        assert_eq!(pool.waiter_count(), 0);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn released_buffers_are_zeroed() {
        let pool = VioPool::new(2, 0);
        let mut buffer = pool.acquire(VioPriority::Normal).unwrap();
        buffer[17] = 0xff;
        pool.release(buffer);
        let buffer = pool.acquire(VioPriority::Normal).unwrap();
        assert_eq!(buffer[17], 0);
        pool.release(buffer);
    }

    #[test]
    fn mempool_tracks_outstanding() {
        let pool = Mempool::new(2, || 0u32);
        let a = pool.acquire().unwrap();
        assert_eq!(pool.outstanding(), 1);
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
    }
}
