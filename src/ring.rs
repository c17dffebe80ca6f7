//! Single-producer/single-consumer handles over a shared buffer.
//!
//! The raw [`CoalescingRingBuffer`] trusts its caller to uphold the SPSC
//! contract. The handle pair makes the contract structural: each handle is
//! `Send` but not `Sync`, so it can be moved to its thread but never shared
//! between two.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{CapacityError, CoalescingRingBuffer};

/// Consumer-side handle. One thread only.
pub struct Receiver<K, V> {
    buffer: Arc<CoalescingRingBuffer<K, V>>,
    // *mut () suppresses Sync so the handle cannot be shared across threads
    _not_sync: PhantomData<*mut ()>,
}

unsafe impl<K: Send, V: Send> Send for Receiver<K, V> {}

impl<K: Eq, V> Receiver<K, V> {
    fn new(buffer: Arc<CoalescingRingBuffer<K, V>>) -> Self {
        Receiver {
            buffer,
            _not_sync: PhantomData,
        }
    }

    /// Moves every currently visible entry into `sink` in ascending
    /// sequence order; returns the count moved.
    pub fn poll<S: Extend<V>>(&self, sink: &mut S) -> usize {
        self.buffer.poll(sink)
    }

    /// Moves at most `max_items` entries into `sink`; returns the count
    /// moved.
    pub fn poll_at_most<S: Extend<V>>(&self, sink: &mut S, max_items: usize) -> usize {
        self.buffer.poll_at_most(sink, max_items)
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// Producer-side handle. One thread only.
pub struct Sender<K, V> {
    buffer: Arc<CoalescingRingBuffer<K, V>>,
    _not_sync: PhantomData<*mut ()>,
}

unsafe impl<K: Send, V: Send> Send for Sender<K, V> {}

impl<K: Eq, V> Sender<K, V> {
    fn new(buffer: Arc<CoalescingRingBuffer<K, V>>) -> Self {
        Sender {
            buffer,
            _not_sync: PhantomData,
        }
    }

    /// Offers an entry for `key`, coalescing with a pending entry of the
    /// same key where possible. Returns `false` iff the buffer was full and
    /// no coalesce was possible.
    pub fn offer(&self, key: K, value: V) -> bool {
        self.buffer.offer(key, value)
    }

    /// Offers an entry that will never be coalesced.
    pub fn offer_value_only(&self, value: V) -> bool {
        self.buffer.offer_value_only(value)
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    pub fn rejection_count(&self) -> u64 {
        self.buffer.rejection_count()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }
}

/// Creates a coalescing ring buffer of at least `capacity` entries and
/// splits it into a producer and a consumer handle.
///
/// ```
/// let (sender, receiver) = coalescing_ring::channel::<u32, u64>(8)?;
/// sender.offer(1, 100);
/// sender.offer(1, 200);
///
/// let mut sink = Vec::new();
/// assert_eq!(1, receiver.poll(&mut sink));
/// assert_eq!(vec![200], sink);
/// # Ok::<(), coalescing_ring::CapacityError>(())
/// ```
pub fn channel<K: Eq, V>(
    capacity: usize,
) -> Result<(Sender<K, V>, Receiver<K, V>), CapacityError> {
    let buffer = Arc::new(CoalescingRingBuffer::new(capacity)?);
    Ok((Sender::new(buffer.clone()), Receiver::new(buffer)))
}
