//! Example demonstrating the three delivery modes across threads.
//!
//! The main thread registers an immediate and an async listener, two helper threads each
//! register a deferred listener and pump their mailboxes. A single emission then reaches all
//! four listeners, each on the thread its delivery mode dictates.
//!
//! Set `RUST_LOG=emitter=trace` to see the dispatch decisions logged by the crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use emitter::{DeliveryMode, Emitter, EventId};
use tracing::info;
use tracing_subscriber::EnvFilter;

const GREETING: EventId = EventId::new(1);

const DEFERRED_THREADS: usize = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .init();

    let emitter = Arc::new(Emitter::builder().worker_name_prefix("greeter").build());
    let delivered = Arc::new(AtomicUsize::new(0));

    info!(thread = ?thread::current().id(), "main thread");

    emitter
        .on_with(GREETING, DeliveryMode::Immediate, {
            let delivered = Arc::clone(&delivered);
            move |text: String| {
                info!(thread = ?thread::current().id(), %text, "immediate listener");
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("the event is only used with String arguments");

    emitter
        .on(GREETING, {
            let delivered = Arc::clone(&delivered);
            move |text: String| {
                info!(thread = ?thread::current().id(), %text, "async listener");
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        })
        .expect("the event is only used with String arguments");

    let (ready_tx, ready_rx) = mpsc::channel();

    let pumps: Vec<_> = (0..DEFERRED_THREADS)
        .map(|index| {
            let emitter = Arc::clone(&emitter);
            let delivered = Arc::clone(&delivered);
            let ready_tx = ready_tx.clone();

            thread::Builder::new()
                .name(format!("pump-{index}"))
                .spawn(move || {
                    let received = Arc::new(AtomicUsize::new(0));

                    emitter
                        .on_with(GREETING, DeliveryMode::Deferred, {
                            let received = Arc::clone(&received);
                            move |text: String| {
                                info!(thread = ?thread::current().id(), %text, "deferred listener");
                                received.fetch_add(1, Ordering::Relaxed);
                                delivered.fetch_add(1, Ordering::Relaxed);
                            }
                        })
                        .expect("the event is only used with String arguments");

                    ready_tx.send(()).expect("main thread is waiting for us");

                    // A real application would do other work between drains.
                    while received.load(Ordering::Relaxed) == 0 {
                        emitter.drain();
                        thread::sleep(Duration::from_millis(10));
                    }
                })
                .expect("failed to spawn pump thread")
        })
        .collect();

    for _ in 0..DEFERRED_THREADS {
        ready_rx.recv().expect("pump threads signal readiness");
    }

    emitter
        .emit(GREETING, "hello from main".to_string())
        .expect("the event is only used with String arguments");

    for pump in pumps {
        pump.join().expect("pump thread panicked");
    }

    // Dropping the emitter waits for the async workers to finish queued deliveries.
    drop(emitter);

    let delivered = delivered.load(Ordering::Relaxed);
    println!("Delivered to {delivered} listeners");

    assert_eq!(delivered, 2 + DEFERRED_THREADS);
}
