use std::fmt;

/// Determines where and when a listener runs after its event is emitted.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum DeliveryMode {
    /// Runs inline on the emitting thread before `emit()` returns.
    ///
    /// A panic in the listener propagates to the caller of `emit()`.
    Immediate,

    /// Runs on a worker thread of the emitter's async pool. `emit()` does not wait for it.
    ///
    /// When `emit()` is itself called from an async listener, the delivery may run on the
    /// worker that made the call, after that worker's current listener has returned.
    ///
    /// A panic in the listener is contained by the worker and logged.
    #[default]
    Async,

    /// Runs on the thread that registered the listener, the next time that thread drains
    /// its mailbox.
    ///
    /// If the registering thread never drains or has already exited, the listener never runs.
    Deferred,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Immediate => "immediate",
            Self::Async => "async",
            Self::Deferred => "deferred",
        };

        f.write_str(name)
    }
}
