//! Event queues: two lock-free single-producer/single-consumer ring buffers
//! sharing the control header's synchronisation word with the event
//! semaphore.
//!
//! Follows a write-payload-then-slot-header sequencing discipline (bump the
//! sequence with `Release` ordering, then wake) adapted from a byte-payload
//! streaming buffer to a small fixed-shape event enum, since the core only
//! needs to know about three event shapes.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{SegmentError, SegmentResult};
use crate::key::SharedSegmentKey;

/// Number of event slots per direction. Must be a power of two.
pub const QUEUE_DEPTH: usize = 64;

/// The three event shapes the core needs to know about. Anything else is
/// carried opaquely as `External`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Announces that a file descriptor has been (or is about to be)
    /// transferred out-of-band via ancillary data.
    FdTransferAnnounce,
    /// Announces a newly spawned subsegment. Must be enqueued strictly
    /// after the paired descriptor transfer.
    NewSegmentAnnounce {
        is_input: bool,
        tag: String,
        key: SharedSegmentKey,
    },
    /// An opaque event passed through untouched by the core.
    External(Vec<u8>),
}

/// A single slot's in-memory representation once decoded from the ring
/// buffer. The ring buffer itself stores a minimal tagged encoding; this
/// type is the host-side decoded form used by [`EventQueue`]'s callers.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    sequence: u64,
    event: Event,
}

/// One direction of event traffic: single producer, single consumer, backed
/// by a fixed-capacity array of slots plus `head`/`tail` index counters —
/// the same shape the real mapped layout uses (a ring of fixed-size slots
/// inside the control header's event queue block, with no allocation or
/// locking on the hot path). `head` is only ever written by the producer,
/// `tail` only by the consumer; each side reads the other's counter with
/// `Acquire` to bound how far it may advance, and writes its own with
/// `Release` so the slot it just touched is visible before the counter
/// move is.
///
/// `QUEUE_DEPTH` slots are always allocated (no growth), and `push`/`pop`
/// touch only a single slot and two atomics each — no mutex, no heap
/// traffic once the queue is built.
pub struct EventQueue {
    buf: Box<[UnsafeCell<MaybeUninit<Slot>>]>,
    head: AtomicU64,
    tail: AtomicU64,
}

// Safety: `head` is written only inside `push` (the single producer) and
// `tail` only inside `pop` (the single consumer). A slot at index `i` is
// only accessed by the producer while `i >= tail` (checked via `is_full`)
// and only by the consumer while `i < head` (checked via the empty check
// in `pop`), so the two sides never touch the same slot concurrently.
unsafe impl Sync for EventQueue {}

impl EventQueue {
    pub fn new() -> EventQueue {
        let buf = (0..QUEUE_DEPTH)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        EventQueue {
            buf,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    fn slot_index(position: u64) -> usize {
        (position as usize) & (QUEUE_DEPTH - 1)
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= QUEUE_DEPTH
    }

    /// Enqueue one event. Every enqueue is observed by the consumer in
    /// enqueue order; the sequence number is bumped with `Release` ordering
    /// only after the slot itself is stored.
    pub fn push(&self, event: Event) -> SegmentResult<u64> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if (head - tail) as usize >= QUEUE_DEPTH {
            return Err(SegmentError::ResourceExhausted {
                requested: (head - tail) as usize + 1,
                max: QUEUE_DEPTH,
            });
        }

        let index = Self::slot_index(head);
        // Safety: the full check above guarantees the consumer has already
        // moved past this slot (or never reached it), so the producer has
        // exclusive access to it until `head` is published below.
        unsafe {
            (*self.buf[index].get()).write(Slot { sequence: head, event });
        }
        self.head.store(head + 1, Ordering::Release);
        Ok(head)
    }

    /// Non-blocking pop of the next event in enqueue order.
    pub fn pop(&self) -> Option<Event> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let index = Self::slot_index(tail);
        // Safety: `tail != head` means the producer has published this slot
        // (its `head` store happened-after the write), and only the
        // consumer ever reads or retires this index.
        let slot = unsafe { (*self.buf[index].get()).assume_init_read() };
        self.tail.store(tail + 1, Ordering::Release);
        Some(slot.event)
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        let tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        for position in tail..head {
            let index = Self::slot_index(position);
            unsafe {
                std::ptr::drop_in_place((*self.buf[index].get()).as_mut_ptr());
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

/// The pair of queues (host-to-producer, producer-to-host) owned by one
/// `ProducerRecord`.
pub struct EventQueuePair {
    pub outbound: EventQueue,
    pub inbound: EventQueue,
}

impl EventQueuePair {
    pub fn new() -> EventQueuePair {
        EventQueuePair {
            outbound: EventQueue::new(),
            inbound: EventQueue::new(),
        }
    }

    /// Enqueue the fd-transfer announce and the paired new-segment announce
    /// atomically from the producer's perspective: no other enqueue may be
    /// observed to interleave between the two, so both pushes happen while
    /// holding the same call stack, never yielding the outbound queue
    /// between them.
    pub fn announce_subsegment(
        &self,
        is_input: bool,
        tag: String,
        key: SharedSegmentKey,
    ) -> SegmentResult<()> {
        self.outbound.push(Event::FdTransferAnnounce)?;
        self.outbound.push(Event::NewSegmentAnnounce { is_input, tag, key })?;
        Ok(())
    }
}

impl Default for EventQueuePair {
    fn default() -> Self {
        EventQueuePair::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_preserves_order() {
        let q = EventQueue::new();
        q.push(Event::External(vec![1])).unwrap();
        q.push(Event::External(vec![2])).unwrap();
        assert_eq!(q.pop(), Some(Event::External(vec![1])));
        assert_eq!(q.pop(), Some(Event::External(vec![2])));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn queue_reports_full_at_depth() {
        let q = EventQueue::new();
        for _ in 0..QUEUE_DEPTH {
            q.push(Event::External(vec![])).unwrap();
        }
        assert!(q.is_full());
        assert!(q.push(Event::External(vec![])).is_err());
    }

    #[test]
    fn subsegment_announce_orders_fd_transfer_before_new_segment() {
        let pair = EventQueuePair::new();
        let key = SharedSegmentKey::allocate_unique(4096)
            .map(|(k, ptr, fd)| {
                unsafe { crate::shm::close_shm(ptr, 4096, fd) };
                let _ = crate::shm::unlink_shm(&k.shm_name());
                k
            })
            .expect("allocate key for test");

        pair.announce_subsegment(false, "tag".into(), key.clone()).unwrap();

        assert_eq!(pair.outbound.pop(), Some(Event::FdTransferAnnounce));
        match pair.outbound.pop() {
            Some(Event::NewSegmentAnnounce { key: got, .. }) => assert_eq!(got, key),
            other => panic!("expected NewSegmentAnnounce, got {:?}", other),
        }
    }
}
