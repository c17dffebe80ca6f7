//! Soak run: a producer pushing timestamped updates flat out against a
//! deliberately tiny ring, a consumer draining in small batches once a
//! second. Coalescing keeps the producer from ever seeing a full buffer.
//!
//! Run with: cargo run --example soak

use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use coalescing_ring::{channel, Receiver, Sender};
use tracing::{info, warn};

const TIME_UPDATE: i32 = 1;
const SIZE_UPDATE: i32 = 2;
const RUN_FOR: Duration = Duration::from_secs(30);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (sender, receiver) = channel(8).expect("capacity is valid");
    let producer = thread::spawn(move || producer_task(sender));
    let consumer = thread::spawn(move || consumer_task(receiver));

    let sent = producer.join().unwrap();
    let seen = consumer.join().unwrap();
    info!(sent, seen, "soak finished");
}

fn producer_task(sender: Sender<i32, String>) -> u64 {
    let started = Instant::now();
    let mut messages_sent = 0u64;
    let mut last_report = Instant::now();

    while started.elapsed() < RUN_FOR {
        let now = Local::now();
        put(&sender, TIME_UPDATE, now.format("%Y-%m-%d %H:%M:%S").to_string());
        put(&sender, SIZE_UPDATE, format!("buffer size = {}", sender.size()));
        messages_sent += 2;

        if last_report.elapsed() > Duration::from_secs(10) {
            last_report = Instant::now();
            messages_sent += 1;
            if !sender.offer_value_only(format!("sent {messages_sent} messages")) {
                warn!(messages_sent, "progress report rejected");
            }
        }
    }

    // value-only entries are never coalesced, so this lands after everything else
    while !sender.offer_value_only(String::from("done")) {}
    messages_sent + 1
}

fn put(sender: &Sender<i32, String>, key: i32, value: String) {
    // a keyed offer can only fail if the ring is full of other keys
    if !sender.offer(key, value) {
        panic!("offer of key {key} failed");
    }
}

fn consumer_task(receiver: Receiver<i32, String>) -> u64 {
    let mut seen = 0u64;
    let mut messages: Vec<String> = Vec::new();

    loop {
        messages.clear();
        receiver.poll_at_most(&mut messages, 10);
        seen += messages.len() as u64;
        for message in &messages {
            info!(%message, "drained");
        }
        if messages.iter().any(|m| m == "done") {
            return seen;
        }
        thread::sleep(Duration::from_millis(1000));
    }
}
