#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the emitter workspace.

use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How long [`wait_until()`] keeps polling before giving up.
const WAIT_UNTIL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`wait_until()`] sleeps between polls.
const WAIT_UNTIL_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Runs a test with a timeout to prevent infinite hangs.
///
/// If the test takes longer than the timeout to complete, the test fails instead of hanging
/// the test run. Listener delivery tests are prone to hangs when a delivery is lost, so every
/// test that waits for a delivery from another thread should be wrapped in this.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly. This allows mutation testing to properly
/// detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode) or if the test
/// itself panics.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {} second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` until it returns `true`.
///
/// Used to wait for effects of deliveries that have no completion signal, such as async
/// listeners that only update a counter.
///
/// # Panics
///
/// Panics if the condition is still false after 5 seconds.
pub fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now()
        .checked_add(WAIT_UNTIL_TIMEOUT)
        .expect("deadline is always representable");

    while !condition() {
        assert!(
            Instant::now() < deadline,
            "condition not reached within {} seconds",
            WAIT_UNTIL_TIMEOUT.as_secs()
        );

        thread::sleep(WAIT_UNTIL_POLL_INTERVAL);
    }
}

/// Records the threads on which listeners ran, in the order they ran.
///
/// Clone-free sharing is expected via `Arc`. Each [`record()`][Self::record] call captures the
/// identity of the calling thread along with a caller-provided label.
#[derive(Debug, Default)]
pub struct ThreadLog {
    entries: Mutex<Vec<(&'static str, ThreadId)>>,
}

impl ThreadLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the entry `label` happened on the current thread.
    pub fn record(&self, label: &'static str) {
        self.entries.lock().push((label, thread::current().id()));
    }

    /// The number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The threads on which `label` was recorded, in recording order.
    #[must_use]
    pub fn threads_of(&self, label: &str) -> Vec<ThreadId> {
        self.entries
            .lock()
            .iter()
            .filter(|(l, _)| *l == label)
            .map(|(_, thread)| *thread)
            .collect()
    }

    /// The labels in recording order.
    #[must_use]
    pub fn labels(&self) -> Vec<&'static str> {
        self.entries.lock().iter().map(|(label, _)| *label).collect()
    }
}
