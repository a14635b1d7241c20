//! Bounded lock-free MPMC ring buffer.
//!
//! Vyukov-style sequence discipline: every slot carries an atomic
//! sequence number, producers and consumers race on monotone head/tail
//! counters, and the sequence store is the only synchronising edge. Used
//! to hand accepted connections from the acceptor to worker reactors.
//!
//! Slot protocol, for capacity `K` (power of two, mask `K-1`):
//! - at construction, slot `i` holds sequence `i`;
//! - a producer claiming position `k` publishes sequence `k + 1`;
//! - a consumer taking position `k` republishes sequence `k + K`,
//!   making the slot the producer target for the next lap.

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity multi-producer multi-consumer queue.
///
/// Never blocks and never allocates on the steady path. `put`/`take`
/// wrap the try-variants with a bounded yielding retry.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two and at least 2.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "capacity must be a power of two and at least 2"
        );
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempt to enqueue. On a full ring the value is handed back.
    pub fn try_put(&self, value: T) -> std::result::Result<(), T> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[tail & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = (seq as isize).wrapping_sub(tail as isize);
            if dif == 0 {
                // The CAS stays relaxed: the release store of the
                // sequence below carries the synchronisation.
                match self.tail.compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence
                            .store(tail.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => tail = current,
                }
            } else if dif < 0 {
                // Sequence lags the counter by a full lap: no consumer
                // has freed this slot yet.
                return Err(value);
            } else {
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempt to dequeue in FIFO order.
    pub fn try_take(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let dif = (seq as isize).wrapping_sub(head.wrapping_add(1) as isize);
            if dif == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence.store(
                            head.wrapping_add(self.capacity()),
                            Ordering::Release,
                        );
                        return Some(value);
                    }
                    Err(current) => head = current,
                }
            } else if dif < 0 {
                return None;
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue with a bounded yielding retry. After `retries` failed
    /// attempts the value is handed back (timeout).
    pub fn put(&self, value: T, retries: usize) -> std::result::Result<(), T> {
        let mut value = value;
        let backoff = Backoff::new();
        for _ in 0..=retries {
            match self.try_put(value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
            backoff.snooze();
        }
        Err(value)
    }

    /// Dequeue with a bounded yielding retry. `None` after `retries`
    /// failed attempts (timeout).
    pub fn take(&self, retries: usize) -> Option<T> {
        let backoff = Backoff::new();
        for _ in 0..=retries {
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            backoff.snooze();
        }
        None
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // Exclusive access: run destructors for everything still queued.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut pos = head;
        while pos != tail {
            let slot = &mut self.slots[pos & self.mask];
            unsafe { slot.value.get_mut().assume_init_drop() };
            pos = pos.wrapping_add(1);
        }
    }
}
