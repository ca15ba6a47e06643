//! Metrics for listener dispatch.
//!
//! The events are per-thread instances, so observing them never contends with other threads.

use nm::{Event, Magnitude};

/// Histogram buckets for the execution time of async listeners, in milliseconds.
const ASYNC_EXECUTION_TIME_MS_BUCKETS: &[Magnitude] = &[0, 1, 5, 10, 25, 50, 100, 250, 500, 1000];

thread_local! {
    /// Listeners invoked inline by `emit()`.
    pub(crate) static DISPATCHED_IMMEDIATE: Event = Event::builder()
        .name("emitter_dispatched_immediate")
        .build();

    /// Listeners handed to the async worker pool by `emit()`.
    pub(crate) static DISPATCHED_ASYNC: Event = Event::builder()
        .name("emitter_dispatched_async")
        .build();

    /// Listeners routed towards the mailbox of their owning thread by `emit()`.
    pub(crate) static DISPATCHED_DEFERRED: Event = Event::builder()
        .name("emitter_dispatched_deferred")
        .build();

    /// Deferred work dropped because the target thread had no mailbox.
    pub(crate) static DEFERRED_DROPPED: Event = Event::builder()
        .name("emitter_deferred_dropped")
        .build();

    /// Deferred work executed by a mailbox drain.
    pub(crate) static DEFERRED_EXECUTED: Event = Event::builder()
        .name("emitter_deferred_executed")
        .build();

    /// Execution time of tasks on the async worker pool.
    pub(crate) static ASYNC_EXECUTION_TIME_MS: Event = Event::builder()
        .name("emitter_async_execution_time_ms")
        .histogram(ASYNC_EXECUTION_TIME_MS_BUCKETS)
        .build();

    /// Tasks on the async worker pool that panicked.
    pub(crate) static ASYNC_PANICS: Event = Event::builder()
        .name("emitter_async_panics")
        .build();
}
