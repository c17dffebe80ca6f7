//! A lock-free, bounded SPSC queue that coalesces pending updates per key.
//!
//! When the consumer keeps up, this behaves like an ordinary bounded
//! single-producer/single-consumer queue. When the consumer falls behind,
//! an [`offer`](CoalescingRingBuffer::offer) for a key that already has an
//! unread entry replaces that entry's value in place, so intermediate
//! values are discarded and the consumer sees only the most recent value
//! per key. Typical use is streaming market data, where a stale quote is
//! worthless the moment a fresh one exists but the freshest quote per
//! instrument must always get through.
//!
//! Neither side ever blocks: a full buffer rejects the offer (`false`, plus
//! a monitoring counter) and an empty poll returns zero. Use
//! [`channel`] to get a [`Sender`]/[`Receiver`] pair that enforces the
//! one-producer/one-consumer contract at compile time, or
//! [`CoalescingRingBuffer`] directly if you are wiring the threads up
//! yourself.
//!
//! ```
//! use std::thread;
//!
//! let (sender, receiver) = coalescing_ring::channel(16)?;
//!
//! let producer = thread::spawn(move || {
//!     for price in 0..100i64 {
//!         sender.offer("EUR/USD", price);
//!     }
//! });
//!
//! let consumer = thread::spawn(move || {
//!     let mut prices = Vec::new();
//!     while prices.last() != Some(&99) {
//!         receiver.poll(&mut prices);
//!     }
//!     prices
//! });
//!
//! producer.join().unwrap();
//! let prices = consumer.join().unwrap();
//! // intermediate prices may have been coalesced away, but never reordered
//! assert!(prices.windows(2).all(|w| w[0] < w[1]));
//! # Ok::<(), coalescing_ring::CapacityError>(())
//! ```

mod buffer;
pub mod ring;

pub use buffer::{CapacityError, CoalescingRingBuffer, MAX_CAPACITY};
pub use ring::{channel, Receiver, Sender};
