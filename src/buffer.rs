//! The coalescing ring buffer and its sequence protocol.
//!
//! Four pieces of state cooperate: a power-of-two slot array for keys
//! (producer-private), a slot array of atomic value pointers (shared), and
//! the sequence cursors `next_write`, `first_write`, `last_read` and
//! `last_cleaned`. A slot's physical index is its sequence masked by
//! `capacity - 1`; a slot at sequence `s` is live iff
//! `last_read < s < next_write`.
//!
//! Ordering rationale:
//!
//! ```text
//! producer writes key, swaps value in (release), publishes next_write (release)
//!     -> consumer acquire-loads next_write, then swaps values out (acquire)
//! consumer publishes first_write, swaps slots to null (release), publishes last_read (release)
//!     -> producer acquire-loads first_write / last_read
//! ```
//!
//! The coalesce/poll race is resolved per cell: when the consumer has
//! already drained a slot the producer just coalesced into, the producer's
//! swap reads the null the consumer's swap left behind, and that same-cell
//! acquire/release pairing makes the consumer's earlier `first_write`
//! publication visible to the producer's re-read, which then diverts.

use std::cell::UnsafeCell;
use std::cmp;
use std::iter;
use std::ptr;

use crossbeam_utils::CachePadded;
use thiserror::Error;

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// Largest accepted capacity, before rounding.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Rejected capacity at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("capacity must be at least 1")]
    Zero,
    #[error("capacity {requested} exceeds the maximum of {max}", max = MAX_CAPACITY)]
    TooLarge { requested: usize },
}

/// What a key slot holds. `NonCoalescing` entries are valid ring entries
/// that never match a coalesce scan.
#[derive(Debug, PartialEq, Eq)]
enum SlotKey<K> {
    Empty,
    Keyed(K),
    NonCoalescing,
}

/// A key slot. Keys are written and cleared only by the producer, so plain
/// loads and stores suffice; the cell is never touched by the consumer.
struct KeyCell<K> {
    slot: UnsafeCell<SlotKey<K>>,
}

impl<K> KeyCell<K> {
    fn new() -> Self {
        KeyCell {
            slot: UnsafeCell::new(SlotKey::Empty),
        }
    }

    fn set(&self, key: SlotKey<K>) {
        unsafe { *self.slot.get() = key }
    }

    fn get(&self) -> &SlotKey<K> {
        unsafe { &*self.slot.get() }
    }
}

/// A bounded SPSC queue that coalesces pending updates per key.
///
/// When the consumer falls behind, an `offer` for a key that already has an
/// unread entry replaces that entry's value in place, so the consumer
/// observes only the most recent value per key. Entries without a key (see
/// [`offer_value_only`](Self::offer_value_only)) are never coalesced and
/// keep their insertion order.
///
/// All operations complete in bounded steps and never block. The type is
/// safe to share between exactly one producer thread (calling [`offer`]
/// and [`offer_value_only`]) and exactly one consumer thread (calling
/// [`poll`] and [`poll_at_most`]); concurrent producers or consumers are a
/// contract violation this type does not detect. The [`channel`] handle
/// pair enforces the contract at compile time.
///
/// [`offer`]: Self::offer
/// [`offer_value_only`]: Self::offer_value_only
/// [`poll`]: Self::poll
/// [`poll_at_most`]: Self::poll_at_most
/// [`channel`]: crate::ring::channel
pub struct CoalescingRingBuffer<K, V> {
    /// Producer cursor: the sequence of the next append.
    next_write: CachePadded<AtomicU64>,
    /// Consumer cursor: the newest sequence the consumer has read past.
    last_read: CachePadded<AtomicU64>,
    /// Floor below which coalescing is known unsafe; published by the
    /// consumer at poll start.
    first_write: AtomicU64,
    /// Producer-private: the last sequence whose slot has been cleaned.
    last_cleaned: AtomicU64,
    rejection_count: AtomicU64,
    keys: Box<[KeyCell<K>]>,
    values: Box<[AtomicPtr<V>]>,
    mask: u64,
    capacity: usize,
}

unsafe impl<K: Send, V: Send> Send for CoalescingRingBuffer<K, V> {}
unsafe impl<K: Send, V: Send> Sync for CoalescingRingBuffer<K, V> {}

impl<K: Eq, V> CoalescingRingBuffer<K, V> {
    /// Creates a buffer holding at least `capacity` entries, rounded up to
    /// the next power of two so the hot path can mask instead of mod.
    pub fn new(capacity: usize) -> Result<Self, CapacityError> {
        if capacity == 0 {
            return Err(CapacityError::Zero);
        }
        if capacity > MAX_CAPACITY {
            return Err(CapacityError::TooLarge {
                requested: capacity,
            });
        }
        let size = capacity.next_power_of_two();

        let keys: Vec<KeyCell<K>> = (0..size).map(|_| KeyCell::new()).collect();
        let values: Vec<AtomicPtr<V>> =
            (0..size).map(|_| AtomicPtr::new(ptr::null_mut())).collect();

        Ok(CoalescingRingBuffer {
            next_write: CachePadded::new(AtomicU64::new(1)),
            last_read: CachePadded::new(AtomicU64::new(0)),
            first_write: AtomicU64::new(1),
            last_cleaned: AtomicU64::new(0),
            rejection_count: AtomicU64::new(0),
            keys: keys.into_boxed_slice(),
            values: values.into_boxed_slice(),
            mask: (size - 1) as u64,
            capacity: size,
        })
    }

    /// Snapshot of the number of resident entries. May be stale the moment
    /// it returns.
    pub fn size(&self) -> usize {
        // loop until we get a consistent read of both cursors
        loop {
            let last_read_before = self.last_read.load(Ordering::Acquire);
            let next_write = self.next_write.load(Ordering::Acquire);
            let last_read_after = self.last_read.load(Ordering::Acquire);

            if last_read_before == last_read_after {
                return (next_write - last_read_before - 1) as usize;
            }
        }
    }

    /// Effective capacity after rounding.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cumulative count of rejected offers. Meant for monitoring, not for
    /// control flow.
    pub fn rejection_count(&self) -> u64 {
        self.rejection_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.first_write.load(Ordering::Acquire) == self.next_write.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    /// Stores an entry, replacing the pending value in place if an unread
    /// entry with an equal key exists. Returns `false` iff the buffer is
    /// full and no coalesce was possible; the rejection counter is then
    /// incremented and the ring is left untouched.
    ///
    /// Producer side only.
    pub fn offer(&self, key: K, value: V) -> bool {
        let next_write = self.next_write.load(Ordering::Relaxed);
        let key = SlotKey::Keyed(key);
        let new = Box::into_raw(Box::new(value));

        for update_pos in self.first_write.load(Ordering::Acquire)..next_write {
            let index = self.index(update_pos);
            if *self.keys[index].get() == key {
                let old = self.values[index].swap(new, Ordering::AcqRel);

                if update_pos >= self.first_write.load(Ordering::Acquire) {
                    // the reader has not claimed past our update point yet
                    drop_boxed(old);
                    return true;
                }

                // The consumer claimed past this slot between the key match
                // and the swap. Put the previous value back; what comes out
                // tells us whether the consumer took the new one with it.
                let displaced = self.values[index].swap(old, Ordering::AcqRel);
                if displaced.is_null() {
                    // Drained mid-race: the new value was already handed
                    // out. The old value now sits in a dead slot until the
                    // next cleanup pass reclaims it.
                    return true;
                }
                debug_assert!(ptr::eq(displaced, new));
                break;
            }
        }

        self.append(key, new)
    }

    /// Stores an entry that no future `offer` can coalesce with. Subject to
    /// the same capacity check and rejection accounting as keyed entries.
    ///
    /// Producer side only.
    pub fn offer_value_only(&self, value: V) -> bool {
        self.append(SlotKey::NonCoalescing, Box::into_raw(Box::new(value)))
    }

    fn append(&self, key: SlotKey<K>, value: *mut V) -> bool {
        if self.is_full() {
            self.rejection_count.fetch_add(1, Ordering::Release);
            drop_boxed(value);
            return false;
        }
        self.clean_up();
        self.store(key, value);
        true
    }

    /// Nulls out keys and values of slots the consumer has read past, so
    /// stale keys cannot match a coalesce scan after the sequence wraps and
    /// dead values are reclaimed promptly.
    fn clean_up(&self) {
        let last_read = self.last_read.load(Ordering::Acquire);
        let last_cleaned = self.last_cleaned.load(Ordering::Relaxed);
        if last_read == last_cleaned {
            return;
        }

        for dead_pos in last_cleaned..last_read {
            let index = self.index(dead_pos + 1);
            self.keys[index].set(SlotKey::Empty);
            drop_boxed(self.values[index].swap(ptr::null_mut(), Ordering::AcqRel));
        }
        self.last_cleaned.store(last_read, Ordering::Relaxed);
    }

    fn store(&self, key: SlotKey<K>, value: *mut V) {
        let next_write = self.next_write.load(Ordering::Relaxed);
        let index = self.index(next_write);
        self.keys[index].set(key);
        // Cleanup has already nulled this cell; the swap is how the value
        // release-publishes before next_write does.
        drop_boxed(self.values[index].swap(value, Ordering::AcqRel));
        self.next_write.store(next_write + 1, Ordering::Release);
    }

    /// Moves every currently visible entry into `sink` in ascending
    /// sequence order and returns how many were moved. Never blocks.
    ///
    /// Consumer side only.
    pub fn poll<S: Extend<V>>(&self, sink: &mut S) -> usize {
        self.fill(sink, self.next_write.load(Ordering::Acquire))
    }

    /// Like [`poll`](Self::poll), but moves at most `max_items` entries.
    ///
    /// Consumer side only.
    pub fn poll_at_most<S: Extend<V>>(&self, sink: &mut S, max_items: usize) -> usize {
        let claim_up_to = cmp::min(
            self.first_write
                .load(Ordering::Relaxed)
                .saturating_add(max_items as u64),
            self.next_write.load(Ordering::Acquire),
        );
        self.fill(sink, claim_up_to)
    }

    fn fill<S: Extend<V>>(&self, sink: &mut S, claim_up_to: u64) -> usize {
        // Published before any slot is read, so a concurrent coalesce
        // either lands before this store and is delivered below, or its
        // re-read observes the new floor and diverts.
        self.first_write.store(claim_up_to, Ordering::Release);
        let last_read = self.last_read.load(Ordering::Relaxed);

        let mut moved = 0;
        for read_pos in last_read + 1..claim_up_to {
            let index = self.index(read_pos);
            let taken = self.values[index].swap(ptr::null_mut(), Ordering::AcqRel);
            debug_assert!(!taken.is_null(), "live slot held no value");
            if !taken.is_null() {
                sink.extend(iter::once(unsafe { *Box::from_raw(taken) }));
                moved += 1;
            }
        }

        self.last_read.store(claim_up_to - 1, Ordering::Release);
        moved
    }

    fn index(&self, sequence: u64) -> usize {
        (sequence & self.mask) as usize
    }
}

impl<K, V> Drop for CoalescingRingBuffer<K, V> {
    fn drop(&mut self) {
        for cell in self.values.iter() {
            drop_boxed(cell.swap(ptr::null_mut(), Ordering::Relaxed));
        }
    }
}

fn drop_boxed<V>(value: *mut V) {
    if !value.is_null() {
        drop(unsafe { Box::from_raw(value) });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    static VOD_SNAPSHOT_1: MarketSnapshot = MarketSnapshot {
        instrument_id: 1,
        bid: 3,
        ask: 4,
    };
    static VOD_SNAPSHOT_2: MarketSnapshot = MarketSnapshot {
        instrument_id: 1,
        bid: 5,
        ask: 6,
    };
    static BP_SNAPSHOT: MarketSnapshot = MarketSnapshot {
        instrument_id: 2,
        bid: 7,
        ask: 8,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MarketSnapshot {
        pub instrument_id: usize,
        pub bid: isize,
        pub ask: isize,
    }

    impl MarketSnapshot {
        fn new(instrument_id: usize, bid: isize, ask: isize) -> Self {
            MarketSnapshot {
                instrument_id,
                bid,
                ask,
            }
        }
    }

    fn create_buffer(capacity: usize) -> CoalescingRingBuffer<usize, MarketSnapshot> {
        CoalescingRingBuffer::new(capacity).unwrap()
    }

    fn poll_all(buffer: &CoalescingRingBuffer<usize, MarketSnapshot>) -> Vec<MarketSnapshot> {
        let mut sink = Vec::new();
        buffer.poll(&mut sink);
        sink
    }

    fn add_key_value(buffer: &CoalescingRingBuffer<usize, MarketSnapshot>, snapshot: MarketSnapshot) {
        assert!(buffer.offer(snapshot.instrument_id, snapshot));
    }

    fn add_value(buffer: &CoalescingRingBuffer<usize, MarketSnapshot>, snapshot: MarketSnapshot) {
        assert!(buffer.offer_value_only(snapshot));
    }

    fn assert_contains(
        buffer: &CoalescingRingBuffer<usize, MarketSnapshot>,
        expected: &[MarketSnapshot],
    ) {
        assert_eq!(poll_all(buffer), expected);
    }

    #[test]
    fn should_correctly_increase_the_capacity_to_the_next_higher_power_of_two() {
        check_capacity(1024, &create_buffer(1023));
        check_capacity(1024, &create_buffer(1024));
        check_capacity(2048, &create_buffer(1025));
    }

    fn check_capacity(capacity: usize, buffer: &CoalescingRingBuffer<usize, MarketSnapshot>) {
        assert_eq!(capacity, buffer.capacity());
        assert!(buffer.capacity().is_power_of_two());
        for i in 0..capacity {
            assert!(buffer.offer(0, MarketSnapshot::new(i, i as isize, i as isize)));
        }
    }

    #[test]
    fn should_reject_capacity_zero() {
        assert_eq!(
            CoalescingRingBuffer::<usize, MarketSnapshot>::new(0).err(),
            Some(CapacityError::Zero),
        );
    }

    #[test]
    fn should_reject_capacity_above_the_maximum() {
        assert_eq!(
            CoalescingRingBuffer::<usize, MarketSnapshot>::new(MAX_CAPACITY + 1).err(),
            Some(CapacityError::TooLarge {
                requested: MAX_CAPACITY + 1
            }),
        );
    }

    #[test]
    fn should_accept_the_smallest_capacity() {
        let buffer = create_buffer(1);
        assert_eq!(1, buffer.capacity());
    }

    #[test]
    fn should_correctly_report_size() {
        let buffer = create_buffer(2);
        assert_eq!(0, buffer.size());
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());

        buffer.offer_value_only(BP_SNAPSHOT);
        assert_eq!(1, buffer.size());
        assert!(!buffer.is_empty());
        assert!(!buffer.is_full());

        buffer.offer(VOD_SNAPSHOT_1.instrument_id, VOD_SNAPSHOT_1);
        assert_eq!(2, buffer.size());
        assert!(!buffer.is_empty());
        assert!(buffer.is_full());

        let mut sink = Vec::new();
        buffer.poll_at_most(&mut sink, 1);
        assert_eq!(1, buffer.size());
        assert!(!buffer.is_empty());
        assert!(!buffer.is_full());

        buffer.poll_at_most(&mut sink, 1);
        assert_eq!(0, buffer.size());
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }

    #[test]
    fn should_reject_new_keys_when_full() {
        let buffer = create_buffer(2);
        buffer.offer(1, BP_SNAPSHOT);
        buffer.offer(2, VOD_SNAPSHOT_1);

        assert!(!buffer.offer(4, VOD_SNAPSHOT_2));
        // rejection implies the buffer was at capacity
        assert_eq!(buffer.capacity(), buffer.size());
        assert_eq!(1, buffer.rejection_count());
    }

    #[test]
    fn should_accept_existing_keys_when_full() {
        let buffer = create_buffer(2);
        buffer.offer(1, BP_SNAPSHOT);
        buffer.offer(2, VOD_SNAPSHOT_1);

        assert!(buffer.offer(2, VOD_SNAPSHOT_2));
        assert_eq!(2, buffer.size());
        assert_contains(&buffer, &[BP_SNAPSHOT, VOD_SNAPSHOT_2]);
    }

    #[test]
    fn should_return_single_value() {
        let buffer = create_buffer(2);
        add_key_value(&buffer, BP_SNAPSHOT);
        assert_contains(&buffer, &[BP_SNAPSHOT]);
    }

    #[test]
    fn should_return_values_in_offer_order() {
        let buffer = create_buffer(4);
        add_key_value(&buffer, VOD_SNAPSHOT_1);
        add_key_value(&buffer, BP_SNAPSHOT);
        add_value(&buffer, MarketSnapshot::new(9, 1, 2));

        assert_contains(
            &buffer,
            &[VOD_SNAPSHOT_1, BP_SNAPSHOT, MarketSnapshot::new(9, 1, 2)],
        );
        assert_eq!(0, buffer.size());
    }

    #[test]
    fn should_update_values_with_equal_keys() {
        let buffer = create_buffer(2);
        add_key_value(&buffer, VOD_SNAPSHOT_1);
        add_key_value(&buffer, VOD_SNAPSHOT_2);
        assert_contains(&buffer, &[VOD_SNAPSHOT_2]);
    }

    #[test]
    fn should_keep_the_last_of_many_updates_for_one_key() {
        let buffer = create_buffer(4);
        for bid in 0..10 {
            assert!(buffer.offer(7, MarketSnapshot::new(7, bid, bid)));
        }
        assert_eq!(1, buffer.size());
        assert_contains(&buffer, &[MarketSnapshot::new(7, 9, 9)]);
    }

    #[test]
    fn should_not_update_values_without_keys() {
        let buffer = create_buffer(2);
        add_value(&buffer, VOD_SNAPSHOT_1);
        add_value(&buffer, VOD_SNAPSHOT_2);
        assert_contains(&buffer, &[VOD_SNAPSHOT_1, VOD_SNAPSHOT_2]);
    }

    #[test]
    fn should_update_values_with_equal_keys_and_preserve_ordering() {
        let buffer = create_buffer(4);
        add_key_value(&buffer, VOD_SNAPSHOT_1);
        add_key_value(&buffer, BP_SNAPSHOT);
        add_key_value(&buffer, VOD_SNAPSHOT_2);
        add_value(&buffer, MarketSnapshot::new(3, 1, 1));

        assert_contains(
            &buffer,
            &[VOD_SNAPSHOT_2, BP_SNAPSHOT, MarketSnapshot::new(3, 1, 1)],
        );
    }

    #[test]
    fn should_not_update_values_if_read_occurs_between_values() {
        let buffer = create_buffer(2);

        add_key_value(&buffer, VOD_SNAPSHOT_1);
        assert_contains(&buffer, &[VOD_SNAPSHOT_1]);

        add_key_value(&buffer, VOD_SNAPSHOT_2);
        assert_contains(&buffer, &[VOD_SNAPSHOT_2]);
    }

    #[test]
    fn should_coalesce_instead_of_rejecting_when_full() {
        let buffer = create_buffer(2);
        assert!(buffer.offer(1, VOD_SNAPSHOT_1));
        assert!(buffer.offer(2, BP_SNAPSHOT));
        assert!(buffer.offer(1, VOD_SNAPSHOT_2));

        assert_eq!(0, buffer.rejection_count());
        assert_contains(&buffer, &[VOD_SNAPSHOT_2, BP_SNAPSHOT]);
    }

    #[test]
    fn should_return_only_the_maximum_number_of_requested_items() {
        let buffer = create_buffer(10);
        add_value(&buffer, BP_SNAPSHOT);
        add_value(&buffer, VOD_SNAPSHOT_1);
        add_value(&buffer, VOD_SNAPSHOT_2);

        let mut snapshots = Vec::new();
        assert_eq!(2, buffer.poll_at_most(&mut snapshots, 2));
        assert_eq!(vec![BP_SNAPSHOT, VOD_SNAPSHOT_1], snapshots);

        snapshots.clear();
        assert_eq!(1, buffer.poll_at_most(&mut snapshots, 1));
        assert_eq!(vec![VOD_SNAPSHOT_2], snapshots);

        assert!(buffer.is_empty());
    }

    #[test]
    fn should_count_rejections() {
        let buffer = create_buffer(2);
        assert_eq!(0, buffer.rejection_count());

        buffer.offer_value_only(BP_SNAPSHOT);
        assert_eq!(0, buffer.rejection_count());

        buffer.offer(1, VOD_SNAPSHOT_1);
        assert_eq!(0, buffer.rejection_count());

        buffer.offer(1, VOD_SNAPSHOT_2);
        assert_eq!(0, buffer.rejection_count());

        buffer.offer_value_only(BP_SNAPSHOT);
        assert_eq!(1, buffer.rejection_count());

        buffer.offer(2, BP_SNAPSHOT);
        assert_eq!(2, buffer.rejection_count());
    }

    #[test]
    fn should_use_value_equality_to_compare_keys() {
        let buffer: CoalescingRingBuffer<String, MarketSnapshot> =
            CoalescingRingBuffer::new(2).unwrap();

        buffer.offer(String::from("boo"), BP_SNAPSHOT);
        buffer.offer(String::from("boo"), VOD_SNAPSHOT_1);

        assert_eq!(1, buffer.size());
    }

    #[test]
    fn should_reuse_capacity_across_many_laps() {
        let buffer = create_buffer(4);
        let mut sink = Vec::new();

        for lap in 0..64usize {
            for i in 0..4 {
                assert!(buffer.offer(i, MarketSnapshot::new(i, lap as isize, i as isize)));
            }
            sink.clear();
            assert_eq!(4, buffer.poll(&mut sink));
            assert_eq!(4, sink.len());
            assert!(sink.iter().all(|s| s.bid == lap as isize));
        }
        assert_eq!(0, buffer.rejection_count());
    }

    #[test]
    fn should_not_coalesce_into_a_consumed_slot() {
        let buffer = create_buffer(2);
        assert!(buffer.offer(1, VOD_SNAPSHOT_1));
        assert_contains(&buffer, &[VOD_SNAPSHOT_1]);

        // key 1's consumed slot is cleaned before these appends; the second
        // offer of key 1 must append, not land in the dead slot
        assert!(buffer.offer(2, BP_SNAPSHOT));
        assert!(buffer.offer(1, VOD_SNAPSHOT_2));
        assert_eq!(2, buffer.size());
        assert_contains(&buffer, &[BP_SNAPSHOT, VOD_SNAPSHOT_2]);
    }
}
