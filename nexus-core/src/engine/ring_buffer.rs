//! Lock-Free SPSC Ring Buffer
//!
//! Fixed-capacity, allocation-free transport between exactly one producer
//! and one consumer.  The storage is a power-of-two array of slots with a
//! `head` cursor (next slot to consume) and a `tail` cursor (next slot to
//! produce), both kept in `[0, capacity)` by the mask.
//!
//! # Performance-First Design:
//! - No CAS: each cursor has a single writer, so plain `Acquire`/`Release`
//!   loads and stores are enough
//! - Cursors live on separate cache lines (`CachePadded`) to avoid false sharing
//! - One slot is sacrificed so that `head == tail` means empty and
//!   `tail + 1 == head` means full, with no shared count field
//!
//! # Ownership model
//!
//! [`LockFreeQueue`] is the owning handle: `enqueue`/`dequeue` take
//! `&mut self`, so a single owner can never race with itself.  For
//! cross-thread use call [`LockFreeQueue::split`], which yields exactly one
//! [`Producer`] and one [`Consumer`].  Neither is `Clone`, which makes a
//! second producer or consumer unrepresentable.
//!
//! # Ordering
//!
//! ```text
//! producer: write slot, Release-store tail  ->  consumer: Acquire-load tail, read slot
//! consumer: read slot,  Release-store head  ->  producer: Acquire-load head, reuse slot
//! ```

use crossbeam_utils::CachePadded;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NexusError, Result};

/// Shared slot storage and cursors.
///
/// # Invariants
///
/// - `slots.len()` is a power of two and `mask == slots.len() - 1`.
/// - Slots in the logical range `[head, tail)` (modulo capacity) are
///   initialized; all others are uninitialized.
/// - Only the producer stores `tail`; only the consumer stores `head`.
struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: producer and consumer touch disjoint slots; the cursor protocol
// publishes each slot to the other side with Release/Acquire.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(NexusError::InvalidConfig(format!(
                "ring capacity must be a power of two >= 2, got {capacity}"
            )));
        }
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// # Safety
    /// Must only be called by the single producer.
    unsafe fn push(&self, value: T) -> std::result::Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) & self.mask;
        if next == self.head.load(Ordering::Acquire) {
            return Err(value);
        }
        // SAFETY: `tail` is outside [head, tail), so the consumer will not
        // read it until the Release store below publishes it.
        (*self.slots[tail].get()).write(value);
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// # Safety
    /// Must only be called by the single consumer.
    unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `head` is inside [head, tail), initialized by the producer
        // before its Release store of tail.
        let value = (*self.slots[head].get()).assume_init_read();
        self.head.store((head + 1) & self.mask, Ordering::Release);
        Some(value)
    }

    /// # Safety
    /// Must only be called by the single consumer; the reference must not
    /// outlive the next `pop`.
    unsafe fn front(&self) -> Option<&T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        Some((*self.slots[head].get()).assume_init_ref())
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    fn is_full(&self) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        (tail + 1) & self.mask == self.head.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drop every stored value and rewind both cursors to zero.
    fn reset(&mut self) {
        self.drop_stored();
        *self.head.get_mut() = 0;
        *self.tail.get_mut() = 0;
    }

    fn drop_stored(&mut self) {
        let mut idx = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while idx != tail {
            // SAFETY: slots in [head, tail) are initialized.
            unsafe { self.slots[idx].get_mut().assume_init_drop() };
            idx = (idx + 1) & self.mask;
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        self.drop_stored();
    }
}

/// Bounded single-producer/single-consumer FIFO queue.
///
/// ```rust
/// # use nexus_core::LockFreeQueue;
/// let mut queue = LockFreeQueue::new(4).unwrap();
/// assert!(queue.enqueue(1).is_ok());
/// assert_eq!(queue.dequeue(), Some(1));
/// ```
pub struct LockFreeQueue<T> {
    ring: Ring<T>,
    // `iter` lends `&T` through `&self`; keep the owner `!Sync`.
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> LockFreeQueue<T> {
    /// Create a queue with `capacity` slots (`capacity - 1` usable).
    ///
    /// Fails unless `capacity` is a power of two and at least 2.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            ring: Ring::with_capacity(capacity)?,
            _not_sync: PhantomData,
        })
    }

    /// Append `value`; hands it back when the queue is full.
    pub fn enqueue(&mut self, value: T) -> std::result::Result<(), T> {
        // SAFETY: `&mut self` makes this the only producer.
        unsafe { self.ring.push(value) }
    }

    /// Remove the oldest value, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        // SAFETY: `&mut self` makes this the only consumer.
        unsafe { self.ring.pop() }
    }

    /// Non-blocking enqueue; identical to [`enqueue`](Self::enqueue).
    pub fn try_enqueue(&mut self, value: T) -> std::result::Result<(), T> {
        self.enqueue(value)
    }

    /// Non-blocking dequeue; identical to [`dequeue`](Self::dequeue).
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.dequeue()
    }

    /// Number of stored values.
    pub fn size(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Slot count, including the reserved slot.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// `size / capacity` in `[0, 1)`.
    pub fn fill_ratio(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    /// Drop all stored values and reset both cursors to zero.
    pub fn clear(&mut self) {
        self.ring.reset();
    }

    /// Iterate stored values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let head = self.ring.head.load(Ordering::Acquire);
        let len = self.size();
        let mask = self.ring.mask;
        // SAFETY: no producer or consumer can run while `&self` is borrowed,
        // and every index in [head, head + len) is initialized.
        (0..len).map(move |offset| unsafe {
            (*self.ring.slots[(head + offset) & mask].get()).assume_init_ref()
        })
    }

    /// Split into a producer and a consumer that may live on different threads.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let ring = Arc::new(self.ring);
        (
            Producer { ring: ring.clone() },
            Consumer { ring },
        )
    }
}

/// Write side of a split [`LockFreeQueue`].
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Append `value`; hands it back when the queue is full.
    pub fn enqueue(&mut self, value: T) -> std::result::Result<(), T> {
        // SAFETY: a split yields one non-Clone producer, borrowed mutably here.
        unsafe { self.ring.push(value) }
    }

    /// Advisory size; may be stale by the time it is read.
    pub fn size(&self) -> usize {
        self.ring.len()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Read side of a split [`LockFreeQueue`].
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Remove the oldest value, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<T> {
        // SAFETY: a split yields one non-Clone consumer, borrowed mutably here.
        unsafe { self.ring.pop() }
    }

    /// Look at the oldest value without removing it.
    pub fn peek(&mut self) -> Option<&T> {
        // SAFETY: the returned borrow ties up `&mut self`, so no `dequeue`
        // can invalidate it.
        unsafe { self.ring.front() }
    }

    /// Advisory size; may be stale by the time it is read.
    pub fn size(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// `true` once the producer has been dropped and nothing is left to read.
    pub fn is_abandoned(&self) -> bool {
        if Arc::strong_count(&self.ring) != 1 {
            return false;
        }
        // Pairs with the producer's release on drop so its last push is visible.
        std::sync::atomic::fence(Ordering::Acquire);
        self.is_empty()
    }
}

/// Contiguous ring with `push_back`/`pop_front` naming.
///
/// Single-owner variant used where the ring sits behind a lock (e.g. the
/// metrics sample window) and needs in-place inspection.
pub struct RingBuffer<T> {
    queue: LockFreeQueue<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            queue: LockFreeQueue::new(capacity)?,
        })
    }

    pub fn push_back(&mut self, value: T) -> std::result::Result<(), T> {
        self.queue.enqueue(value)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.queue.dequeue()
    }

    /// Oldest value, if any.
    pub fn peek_front(&self) -> Option<&T> {
        self.queue.iter().next()
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(LockFreeQueue::<u32>::new(0).is_err());
        assert!(LockFreeQueue::<u32>::new(1).is_err());
        assert!(LockFreeQueue::<u32>::new(6).is_err());
        assert!(LockFreeQueue::<u32>::new(8).is_ok());
    }

    #[test]
    fn test_accepts_capacity_minus_one() {
        let mut queue = LockFreeQueue::new(8).unwrap();
        for i in 0..7 {
            assert!(queue.enqueue(i).is_ok(), "enqueue {i} should succeed");
        }
        assert!(queue.is_full());
        assert_eq!(queue.enqueue(99), Err(99));
        assert_eq!(queue.size(), 7);
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = LockFreeQueue::new(16).unwrap();
        for i in 0..10 {
            queue.enqueue(i).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut queue = LockFreeQueue::new(4).unwrap();
        let mut next_out = 0;
        for i in 0..50 {
            queue.enqueue(i).unwrap();
            if queue.size() == 3 {
                assert_eq!(queue.dequeue(), Some(next_out));
                next_out += 1;
            }
        }
        while let Some(v) = queue.dequeue() {
            assert_eq!(v, next_out);
            next_out += 1;
        }
        assert_eq!(next_out, 50);
    }

    #[test]
    fn test_fill_ratio_and_clear() {
        let mut queue = LockFreeQueue::new(8).unwrap();
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();
        assert_eq!(queue.fill_ratio(), 0.25);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.ring.head.load(Ordering::Relaxed), 0);
        assert_eq!(queue.ring.tail.load(Ordering::Relaxed), 0);
        queue.enqueue(3).unwrap();
        assert_eq!(queue.dequeue(), Some(3));
    }

    #[test]
    fn test_iter_oldest_first() {
        let mut queue = LockFreeQueue::new(4).unwrap();
        queue.enqueue('a').unwrap();
        queue.enqueue('b').unwrap();
        queue.dequeue();
        queue.enqueue('c').unwrap();
        queue.enqueue('d').unwrap();
        let seen: String = queue.iter().collect();
        assert_eq!(seen, "bcd");
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_remaining_values_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut queue = LockFreeQueue::new(8).unwrap();
            for _ in 0..5 {
                assert!(queue.enqueue(DropCounter(drops.clone())).is_ok());
            }
            drop(queue.dequeue());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_clear_drops_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut queue = LockFreeQueue::new(4).unwrap();
        assert!(queue.enqueue(DropCounter(drops.clone())).is_ok());
        assert!(queue.enqueue(DropCounter(drops.clone())).is_ok());
        queue.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_split_across_threads_preserves_fifo() {
        const ITEMS: u64 = 100_000;
        let (mut producer, mut consumer) = LockFreeQueue::new(1024).unwrap().split();

        let writer = std::thread::spawn(move || {
            for i in 0..ITEMS {
                let mut item = i;
                while let Err(back) = producer.enqueue(item) {
                    item = back;
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0;
        while expected < ITEMS {
            match consumer.dequeue() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => std::thread::yield_now(),
            }
        }
        writer.join().expect("producer panicked");
        assert!(consumer.is_abandoned());
    }

    #[test]
    fn test_consumer_peek() {
        let (mut producer, mut consumer) = LockFreeQueue::new(4).unwrap().split();
        assert!(consumer.peek().is_none());
        producer.enqueue(7).unwrap();
        assert_eq!(consumer.peek(), Some(&7));
        assert_eq!(consumer.dequeue(), Some(7));
    }

    #[test]
    fn test_ring_buffer_push_pop_peek() {
        let mut ring = RingBuffer::new(4).unwrap();
        assert!(ring.peek_front().is_none());
        ring.push_back(1).unwrap();
        ring.push_back(2).unwrap();
        ring.push_back(3).unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push_back(4), Err(4));
        assert_eq!(ring.peek_front(), Some(&1));
        assert_eq!(ring.pop_front(), Some(1));
        assert_eq!(ring.size(), 2);
        ring.clear();
        assert!(ring.is_empty());
    }
}
