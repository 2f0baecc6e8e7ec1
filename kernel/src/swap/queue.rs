//! Swap queues
//!
//! Two bounded rings decouple the producers (the fault engine, the
//! eviction scanner) from the service threads. Capacities correspond to
//! one page of entries each: 1024 frames awaiting write-out, 512
//! `(environment, address)` tasks awaiting read-in.

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, Result};
use crate::mm::frame::Frame;
use crate::mm::{VirtAddr, PGSIZE};

/// Capacity of the swap-out ring (frame entries in one page).
pub const SWAP_OUT_QUEUE_LEN: usize = PGSIZE / core::mem::size_of::<u32>();
/// Capacity of the swap-in ring (task entries in one page).
pub const SWAP_IN_QUEUE_LEN: usize = PGSIZE / 8;

/// Insertion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Spin until room frees up.
    Blocking,
    /// Report `QueueFull` instead of waiting.
    NonBlocking,
}

/// A pending read-in on behalf of a parked environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapInTask {
    pub env_slot: u32,
    pub va: VirtAddr,
}

struct Ring<T> {
    buf: Box<[Option<T>]>,
    read: usize,
    items: usize,
}

/// Bounded single-producer-path ring with a position lock.
pub struct SwapQueue<T: Copy> {
    inner: Mutex<Ring<T>>,
}

impl<T: Copy> SwapQueue<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let mut buf = Vec::with_capacity(cap);
        buf.resize_with(cap, || None);
        Self {
            inner: Mutex::new(Ring {
                buf: buf.into_boxed_slice(),
                read: 0,
                items: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue at the write position (read position plus live items).
    pub fn push(&self, item: T, mode: QueueMode) -> Result<()> {
        loop {
            {
                let mut ring = self.inner.lock();
                if ring.items < ring.buf.len() {
                    let pos = (ring.read + ring.items) % ring.buf.len();
                    ring.buf[pos] = Some(item);
                    ring.items += 1;
                    return Ok(());
                }
            }
            match mode {
                QueueMode::NonBlocking => return Err(KernelError::QueueFull),
                QueueMode::Blocking => arch::pause(),
            }
        }
    }

    /// Dequeue the oldest entry.
    pub fn pop(&self) -> Option<T> {
        let mut ring = self.inner.lock();
        if ring.items == 0 {
            return None;
        }
        let pos = ring.read;
        let item = ring.buf[pos].take().expect("live ring entry");
        ring.read = (ring.read + 1) % ring.buf.len();
        ring.items -= 1;
        Some(item)
    }
}

/// Ring of frames awaiting write-out.
pub type SwapOutQueue = SwapQueue<Frame>;
/// Ring of tasks awaiting read-in.
pub type SwapInQueue = SwapQueue<SwapInTask>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_with_wraparound() {
        let q: SwapQueue<u32> = SwapQueue::with_capacity(4);
        for round in 0..5u32 {
            for i in 0..4 {
                q.push(round * 10 + i, QueueMode::NonBlocking).expect("room");
            }
            for i in 0..4 {
                assert_eq!(q.pop(), Some(round * 10 + i));
            }
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn non_blocking_reports_full() {
        let q: SwapQueue<u32> = SwapQueue::with_capacity(2);
        q.push(1, QueueMode::NonBlocking).expect("room");
        q.push(2, QueueMode::NonBlocking).expect("room");
        assert_eq!(
            q.push(3, QueueMode::NonBlocking),
            Err(KernelError::QueueFull)
        );
        assert_eq!(q.pop(), Some(1));
        q.push(3, QueueMode::NonBlocking).expect("room after pop");
    }

    #[test]
    fn capacities_match_one_page() {
        assert_eq!(SWAP_OUT_QUEUE_LEN, 1024);
        assert_eq!(SWAP_IN_QUEUE_LEN, 512);
    }

    #[test]
    fn concurrent_producers_never_lose_entries() {
        use std::sync::Arc;

        let q: Arc<SwapQueue<u32>> = Arc::new(SwapQueue::with_capacity(SWAP_OUT_QUEUE_LEN));
        let producers: Vec<_> = (0..4u32)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        q.push(t * 1000 + i, QueueMode::Blocking).expect("blocking push");
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().expect("producer panicked");
        }
        let mut drained = 0;
        while q.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 800);
    }
}
