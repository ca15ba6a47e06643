use std::any::{Any, type_name};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use crate::callback::SharedFn;
use crate::{DeliveryMode, ListenerId};

/// One registered subscription.
///
/// The function is stored type-erased so that listeners of every argument type fit in one
/// registry. The registry guarantees that all listeners of one event hold the same concrete
/// function type, so recovering it with [`function()`][Self::function] cannot fail for a
/// listener obtained through a signature-checked snapshot.
pub(crate) struct Listener {
    id: ListenerId,
    mode: DeliveryMode,
    once: bool,

    /// The thread that registered the listener. Deferred deliveries are routed here.
    owning_thread: ThreadId,

    /// A `SharedFn<A>` for the `A` the listener was registered with.
    function: Box<dyn Any + Send + Sync>,

    /// Set when a once-listener has been dispatched, so that concurrent emissions that both
    /// captured it in their snapshots cannot both dispatch it.
    spent: AtomicBool,
}

impl Listener {
    pub(crate) fn new<A>(
        id: ListenerId,
        function: SharedFn<A>,
        once: bool,
        mode: DeliveryMode,
    ) -> Self
    where
        A: 'static,
    {
        Self {
            id,
            mode,
            once,
            owning_thread: thread::current().id(),
            function: Box::new(function),
            spent: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub(crate) fn is_once(&self) -> bool {
        self.once
    }

    pub(crate) fn owning_thread(&self) -> ThreadId {
        self.owning_thread
    }

    pub(crate) fn function<A>(&self) -> Option<&SharedFn<A>>
    where
        A: 'static,
    {
        self.function.downcast_ref::<SharedFn<A>>()
    }

    /// Claims the right to dispatch this listener.
    ///
    /// Always succeeds for regular listeners. For once-listeners, succeeds exactly once over
    /// the lifetime of the listener.
    pub(crate) fn try_claim(&self) -> bool {
        if !self.once {
            return true;
        }

        !self.spent.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("once", &self.once)
            .field("owning_thread", &self.owning_thread)
            .finish_non_exhaustive()
    }
}
