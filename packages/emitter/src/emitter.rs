//! The public publish/subscribe facade.

use std::any::type_name;
use std::fmt;
use std::num::NonZero;

use new_zealand::nz;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::metrics::{DISPATCHED_ASYNC, DISPATCHED_DEFERRED, DISPATCHED_IMMEDIATE};
use crate::registry::SnapshotEntry;
use crate::{
    Callback, DeliveryMode, Directory, Error, EventId, ListenerId, Registry, Result, WorkerPool,
};

const DEFAULT_ASYNC_WORKERS: NonZero<usize> = nz!(2);
const DEFAULT_WORKER_NAME_PREFIX: &str = "emitter-async";

/// Lets components register interest in named events and delivers emitted events to them.
///
/// Each listener chooses how it is delivered to via [`DeliveryMode`]:
///
/// * [`Immediate`][DeliveryMode::Immediate] listeners run inline before [`emit()`][Self::emit]
///   returns, on the emitting thread.
/// * [`Async`][DeliveryMode::Async] listeners run on the emitter's worker pool; `emit()` does not
///   wait for them. This is the default.
/// * [`Deferred`][DeliveryMode::Deferred] listeners run on the thread that registered them, the
///   next time that thread calls [`drain()`][Self::drain].
///
/// Every listener of one event must accept the same argument type `A`, usually a tuple. The
/// first registration for an event fixes its argument type; later registrations and emissions
/// that use a different type are rejected with [`Error::SignatureMismatch`].
///
/// Listener code never runs while the emitter holds its internal lock, so listeners may freely
/// register, remove and emit on the same emitter.
///
/// # Example
///
/// ```rust
/// use std::sync::mpsc;
///
/// use emitter::{DeliveryMode, Emitter, EventId};
///
/// const TEMPERATURE_CHANGED: EventId = EventId::new(1);
///
/// let emitter = Emitter::new();
/// let (tx, rx) = mpsc::channel();
///
/// emitter
///     .on_with(
///         TEMPERATURE_CHANGED,
///         DeliveryMode::Immediate,
///         move |(sensor, celsius): (&'static str, f32)| {
///             tx.send(format!("{sensor}: {celsius}")).unwrap();
///         },
///     )
///     .unwrap();
///
/// emitter.emit(TEMPERATURE_CHANGED, ("attic", 21.5)).unwrap();
///
/// assert_eq!(rx.recv().unwrap(), "attic: 21.5");
/// ```
///
/// # Nested async emission
///
/// An emission from a thread outside the worker pool never runs async listeners on the
/// emitting thread. An emission made by an async listener, however, queues its async
/// deliveries on the same pool, so they may run on the very worker that emitted them once
/// that worker finishes its current listener. With a single worker this is always the case.
///
/// # Once-listeners
///
/// A listener registered with [`once()`][Self::once] is removed as soon as the first emission
/// has decided to dispatch it, not when it finishes running. For async and deferred delivery
/// this means the listener is already gone before its function has run, and a second emission
/// will never reach it even if the first delivery is still pending or never happens.
pub struct Emitter {
    registry: Mutex<Registry>,
    directory: Directory,
    pool: WorkerPool,
}

impl Emitter {
    /// Creates an emitter with default settings and its own [`Directory`].
    ///
    /// Use [`Emitter::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring an emitter.
    #[must_use]
    pub fn builder() -> EmitterBuilder {
        EmitterBuilder::new()
    }

    /// Registers a listener for `event`.
    ///
    /// Returns the identifier of the new listener, which can be passed to
    /// [`off()`][Self::off] to remove it. If `callback` is empty, nothing is registered and
    /// [`ListenerId::INVALID`] is returned.
    ///
    /// For [`DeliveryMode::Deferred`], the listener will be delivered on the calling thread,
    /// which must periodically call [`drain()`][Self::drain].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if listeners with a different argument type are
    /// already registered for `event`. A rejected deferred registration does not create a
    /// mailbox for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if the emitter has issued `u64::MAX` listener identifiers. Identifiers are never
    /// reused, so this bounds the number of registrations over the lifetime of one emitter.
    pub fn register<A>(
        &self,
        event: EventId,
        callback: Callback<A>,
        once: bool,
        mode: DeliveryMode,
    ) -> Result<ListenerId>
    where
        A: Clone + Send + 'static,
    {
        let Some(function) = callback.into_shared() else {
            trace!(%event, "empty callback rejected");
            return Ok(ListenerId::INVALID);
        };

        // The mailbox must exist before the first emission can target the listener, so it is
        // created between the signature check and the insertion. The registry lock is not held
        // while creating it because that may drop abandoned work of other directories.
        let result = if mode == DeliveryMode::Deferred {
            let checked = self.registry.lock().check_signature::<A>(event);
            checked.inspect(|_| self.directory.ensure_mailbox())
        } else {
            Ok(())
        };

        let result = result.and_then(|()| {
            self.registry
                .lock()
                .insert(event, Some(function), once, mode)
        });

        match &result {
            Ok(listener) => trace!(%event, %listener, %mode, once, "listener registered"),
            Err(error) => warn!(%event, %error, "listener rejected"),
        }

        result
    }

    /// Registers a listener for `event` that is delivered asynchronously.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if listeners with a different argument type are
    /// already registered for `event`.
    pub fn on<A, F>(&self, event: EventId, function: F) -> Result<ListenerId>
    where
        A: Clone + Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(event, Callback::new(function), false, DeliveryMode::default())
    }

    /// Registers a listener for `event` with the given delivery mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if listeners with a different argument type are
    /// already registered for `event`.
    pub fn on_with<A, F>(
        &self,
        event: EventId,
        mode: DeliveryMode,
        function: F,
    ) -> Result<ListenerId>
    where
        A: Clone + Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(event, Callback::new(function), false, mode)
    }

    /// Registers a listener for `event` that is delivered asynchronously at most once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if listeners with a different argument type are
    /// already registered for `event`.
    pub fn once<A, F>(&self, event: EventId, function: F) -> Result<ListenerId>
    where
        A: Clone + Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(event, Callback::new(function), true, DeliveryMode::default())
    }

    /// Registers a listener for `event` with the given delivery mode that is delivered at
    /// most once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if listeners with a different argument type are
    /// already registered for `event`.
    pub fn once_with<A, F>(
        &self,
        event: EventId,
        mode: DeliveryMode,
        function: F,
    ) -> Result<ListenerId>
    where
        A: Clone + Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(event, Callback::new(function), true, mode)
    }

    /// Removes a listener. Does nothing if no listener with this identifier is registered.
    ///
    /// Removal only prevents future emissions from dispatching the listener. Deliveries that
    /// were already dispatched still happen: async deliveries already handed to the worker
    /// pool and deferred deliveries already waiting in a mailbox are not recalled.
    pub fn off(&self, listener: ListenerId) {
        // Bound to a variable so the listener is dropped after the lock is released.
        let removed = self.registry.lock().remove(listener);

        if removed.is_some() {
            trace!(%listener, "listener removed");
        }
    }

    /// Emits `event`, dispatching every listener registered for it at the time of the call.
    ///
    /// Listeners are dispatched in registration order, each according to its delivery mode.
    /// Each listener receives its own clone of `args`. Listeners registered while the emission
    /// is in progress are not dispatched by it; listeners removed while it is in progress are
    /// still dispatched if they had not been reached yet.
    ///
    /// Emitting an event without listeners does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if the listeners registered for `event` accept a
    /// different argument type. No listener is dispatched in that case.
    ///
    /// # Panics
    ///
    /// A panic in an [`Immediate`][DeliveryMode::Immediate] listener propagates to the caller.
    /// Listeners after it in the same emission are not dispatched.
    pub fn emit<A>(&self, event: EventId, args: A) -> Result<()>
    where
        A: Clone + Send + 'static,
    {
        // The lock is released at the end of this statement, before any listener runs.
        let snapshot = self.registry.lock().snapshot::<A>(event);

        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%event, %error, "emission rejected");
                return Err(error);
            }
        };

        trace!(%event, listeners = snapshot.len(), "emitting");

        for entry in snapshot {
            self.dispatch(event, entry, args.clone());
        }

        Ok(())
    }

    /// Emits an event whose listeners take no arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if the listeners registered for `event` accept
    /// arguments.
    pub fn emit_empty(&self, event: EventId) -> Result<()> {
        self.emit(event, ())
    }

    /// Executes the deferred deliveries waiting for the current thread.
    ///
    /// Returns the number of deliveries executed. Deliveries that arrive while draining are
    /// left for the next call. This drains the mailbox of the emitter's [`Directory`], so it
    /// also executes deferred deliveries from other emitters sharing that directory.
    ///
    /// # Panics
    ///
    /// A panic in a deferred listener propagates to the caller. Deliveries queued behind it
    /// stay in the mailbox and are executed by the next call.
    pub fn drain(&self) -> usize {
        self.directory.drain()
    }

    /// The directory used to route deferred deliveries.
    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// The number of listeners currently registered across all events.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// The number of listeners currently registered for `event`.
    #[must_use]
    pub fn listener_count_for(&self, event: EventId) -> usize {
        self.registry.lock().len_for(event)
    }

    /// Whether a listener with this identifier is currently registered.
    #[must_use]
    pub fn contains(&self, listener: ListenerId) -> bool {
        self.registry.lock().contains(listener)
    }

    fn dispatch<A>(&self, event: EventId, entry: SnapshotEntry<A>, args: A)
    where
        A: Clone + Send + 'static,
    {
        let SnapshotEntry { listener, function } = entry;

        // A concurrent emission may have already dispatched this once-listener.
        if !listener.try_claim() {
            return;
        }

        let id = listener.id();
        let mode = listener.mode();

        // Once-listeners are removed as soon as the dispatch decision is made, which for
        // immediate delivery includes the case where the listener panics.
        let _removal = listener
            .is_once()
            .then(|| scopeguard::guard(id, |id| self.off(id)));

        trace!(%event, listener = %id, %mode, "dispatching");

        match mode {
            DeliveryMode::Immediate => {
                DISPATCHED_IMMEDIATE.with(|e| e.observe_once());
                function(args);
            }
            DeliveryMode::Async => {
                DISPATCHED_ASYNC.with(|e| e.observe_once());
                self.pool.spawn_and_forget(move || function(args));
            }
            DeliveryMode::Deferred => {
                DISPATCHED_DEFERRED.with(|e| e.observe_once());
                self.directory
                    .route(listener.owning_thread(), Box::new(move || function(args)));
            }
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("listener_count", &self.listener_count())
            .field("directory", &self.directory)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Builder for configuring an [`Emitter`].
#[derive(Debug)]
pub struct EmitterBuilder {
    directory: Option<Directory>,
    async_workers: NonZero<usize>,
    worker_name_prefix: String,
}

impl EmitterBuilder {
    fn new() -> Self {
        Self {
            directory: None,
            async_workers: DEFAULT_ASYNC_WORKERS,
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
        }
    }

    /// Sets the directory used to route deferred deliveries.
    ///
    /// Emitters that share a directory deliver deferred work into the same per-thread
    /// mailboxes, so one [`drain()`][Emitter::drain] call serves all of them.
    ///
    /// By default, each emitter creates its own directory.
    #[must_use]
    pub fn directory(mut self, directory: Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Sets the number of worker threads that execute async deliveries.
    ///
    /// Default is 2. The workers are started on the first async delivery.
    #[must_use]
    pub fn async_workers(mut self, count: NonZero<usize>) -> Self {
        self.async_workers = count;
        self
    }

    /// Sets the name prefix of the async worker threads.
    ///
    /// Default is `emitter-async`. Threads are named `<prefix>-<index>`.
    #[must_use]
    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }

    /// Builds the emitter with the configured settings.
    #[must_use]
    pub fn build(self) -> Emitter {
        Emitter {
            registry: Mutex::new(Registry::new()),
            directory: self.directory.unwrap_or_default(),
            pool: WorkerPool::new(self.async_workers, self.worker_name_prefix),
        }
    }
}
