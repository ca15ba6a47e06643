//! Bookkeeping of the listeners registered on one emitter.

use std::any::{TypeId, type_name};
use std::collections::BTreeMap;
use std::sync::Arc;

use foldhash::{HashMap, HashMapExt};

use crate::callback::SharedFn;
use crate::{DeliveryMode, Error, EventId, Listener, ListenerId, Result};

/// The argument type that all listeners of one event accept.
#[derive(Clone, Copy, Debug)]
struct Signature {
    type_id: TypeId,
    type_name: &'static str,
}

impl Signature {
    fn of<A: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            type_name: type_name::<A>(),
        }
    }

    fn check<A: 'static>(self, event: EventId) -> Result<()> {
        if self.type_id == TypeId::of::<A>() {
            Ok(())
        } else {
            Err(Error::SignatureMismatch {
                event,
                expected: self.type_name,
                actual: type_name::<A>(),
            })
        }
    }
}

#[derive(Debug)]
struct EventSlot {
    signature: Signature,

    /// In registration order.
    listeners: Vec<Arc<Listener>>,
}

/// A listener captured by a snapshot, with its function already recovered as the emitted type.
pub(crate) struct SnapshotEntry<A> {
    pub(crate) listener: Arc<Listener>,
    pub(crate) function: SharedFn<A>,
}

/// Ordered multi-map from event to listeners, owned by one emitter.
///
/// The registry itself is not synchronized. The emitter guards it with a lock that is held only
/// for the duration of a single registry call and never while user code runs.
///
/// The first listener registered for an event fixes the signature of that event. The signature
/// is released when the last listener of the event is removed, after which the event may be
/// reused with a different argument type.
#[derive(Debug)]
pub(crate) struct Registry {
    last_id: ListenerId,
    events: BTreeMap<EventId, EventSlot>,

    /// Which event each live listener is registered under.
    index: HashMap<ListenerId, EventId>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            last_id: ListenerId::INVALID,
            events: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Inserts a listener and returns its newly assigned identifier.
    ///
    /// Returns [`ListenerId::INVALID`] without inserting anything if `function` is `None`.
    pub(crate) fn insert<A>(
        &mut self,
        event: EventId,
        function: Option<SharedFn<A>>,
        once: bool,
        mode: DeliveryMode,
    ) -> Result<ListenerId>
    where
        A: 'static,
    {
        let Some(function) = function else {
            return Ok(ListenerId::INVALID);
        };

        self.check_signature::<A>(event)?;

        let id = self.last_id.increment();
        let listener = Arc::new(Listener::new(id, function, once, mode));

        self.events
            .entry(event)
            .or_insert_with(|| EventSlot {
                signature: Signature::of::<A>(),
                listeners: Vec::new(),
            })
            .listeners
            .push(listener);

        self.index.insert(id, event);

        Ok(id)
    }

    /// Checks that listeners accepting `A` may be registered for `event`.
    pub(crate) fn check_signature<A>(&self, event: EventId) -> Result<()>
    where
        A: 'static,
    {
        self.events
            .get(&event)
            .map_or(Ok(()), |slot| slot.signature.check::<A>(event))
    }

    /// Removes the listener with the given identifier, returning it if it was registered.
    ///
    /// The caller is expected to drop the returned listener only after releasing any lock
    /// that guards the registry, as dropping it may run user code.
    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<Arc<Listener>> {
        let event = self.index.remove(&id)?;

        let slot = self.events.get_mut(&event)?;
        let position = slot.listeners.iter().position(|l| l.id() == id)?;
        let removed = slot.listeners.remove(position);

        if slot.listeners.is_empty() {
            self.events.remove(&event);
        }

        Some(removed)
    }

    /// Captures the listeners currently registered for `event`, in registration order.
    ///
    /// An event without listeners yields an empty snapshot regardless of `A`.
    pub(crate) fn snapshot<A>(&self, event: EventId) -> Result<Vec<SnapshotEntry<A>>>
    where
        A: 'static,
    {
        let Some(slot) = self.events.get(&event) else {
            return Ok(Vec::new());
        };

        slot.signature.check::<A>(event)?;

        Ok(slot
            .listeners
            .iter()
            .filter_map(|listener| {
                // Cannot fail because the signature check above covers every listener of the slot.
                let function = Arc::clone(listener.function::<A>()?);

                Some(SnapshotEntry {
                    listener: Arc::clone(listener),
                    function,
                })
            })
            .collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn len_for(&self, event: EventId) -> usize {
        self.events.get(&event).map_or(0, |slot| slot.listeners.len())
    }

    pub(crate) fn contains(&self, id: ListenerId) -> bool {
        self.index.contains_key(&id)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const CLICKED: EventId = EventId::new(1);
    const CLOSED: EventId = EventId::new(2);

    fn noop<A: 'static>() -> Option<SharedFn<A>> {
        Some(Arc::new(|_: A| {}))
    }

    fn ids<A: 'static>(registry: &Registry, event: EventId) -> Vec<ListenerId> {
        registry
            .snapshot::<A>(event)
            .unwrap()
            .iter()
            .map(|entry| entry.listener.id())
            .collect()
    }

    #[test]
    fn ids_increase_from_one() {
        let mut registry = Registry::new();

        let first = registry.insert(CLICKED, noop::<()>(), false, DeliveryMode::Async);
        let second = registry.insert(CLOSED, noop::<()>(), false, DeliveryMode::Async);
        let third = registry.insert(CLICKED, noop::<()>(), false, DeliveryMode::Async);

        assert_eq!(first.unwrap(), ListenerId::new(1));
        assert_eq!(second.unwrap(), ListenerId::new(2));
        assert_eq!(third.unwrap(), ListenerId::new(3));
    }

    #[test]
    fn ids_are_not_reused_after_remove() {
        let mut registry = Registry::new();

        for _ in 0..3 {
            registry
                .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
                .unwrap();
        }

        assert!(registry.remove(ListenerId::new(2)).is_some());

        let next = registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
            .unwrap();

        assert_eq!(next, ListenerId::new(4));
    }

    #[test]
    fn empty_function_is_rejected_without_consuming_id() {
        let mut registry = Registry::new();

        let rejected = registry
            .insert::<()>(CLICKED, None, false, DeliveryMode::Async)
            .unwrap();
        let accepted = registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
            .unwrap();

        assert_eq!(rejected, ListenerId::INVALID);
        assert_eq!(accepted, ListenerId::new(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let mut registry = Registry::new();

        for _ in 0..4 {
            registry
                .insert(CLICKED, noop::<u32>(), false, DeliveryMode::Immediate)
                .unwrap();
        }
        registry.remove(ListenerId::new(2));

        assert_eq!(
            ids::<u32>(&registry, CLICKED),
            vec![ListenerId::new(1), ListenerId::new(3), ListenerId::new(4)]
        );
    }

    #[test]
    fn snapshot_of_unknown_event_is_empty() {
        let registry = Registry::new();

        assert!(registry.snapshot::<String>(CLOSED).unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_independent_of_later_changes() {
        let mut registry = Registry::new();
        registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Immediate)
            .unwrap();

        let snapshot = registry.snapshot::<()>(CLICKED).unwrap();

        registry.remove(ListenerId::new(1));
        registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Immediate)
            .unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].listener.id(), ListenerId::new(1));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut registry = Registry::new();
        registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
            .unwrap();

        assert!(registry.remove(ListenerId::new(99)).is_none());
        assert!(registry.remove(ListenerId::INVALID).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_twice_is_noop() {
        let mut registry = Registry::new();
        let id = registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
            .unwrap();

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(!registry.contains(id));
    }

    #[test]
    fn mismatched_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .insert(CLICKED, noop::<(u32, String)>(), false, DeliveryMode::Async)
            .unwrap();

        let result = registry.insert(CLICKED, noop::<u32>(), false, DeliveryMode::Async);

        assert!(matches!(
            result,
            Err(Error::SignatureMismatch { event, .. }) if event == CLICKED
        ));
        assert_eq!(registry.len_for(CLICKED), 1);
    }

    #[test]
    fn mismatched_snapshot_is_rejected() {
        let mut registry = Registry::new();
        registry
            .insert(CLICKED, noop::<u32>(), false, DeliveryMode::Async)
            .unwrap();

        assert!(registry.snapshot::<u64>(CLICKED).is_err());
    }

    #[test]
    fn signature_is_released_with_last_listener() {
        let mut registry = Registry::new();
        let id = registry
            .insert(CLICKED, noop::<u32>(), false, DeliveryMode::Async)
            .unwrap();
        registry.remove(id);

        let reused = registry.insert(CLICKED, noop::<String>(), false, DeliveryMode::Async);

        assert!(reused.is_ok());
    }

    #[test]
    fn counts_track_events_separately() {
        let mut registry = Registry::new();
        registry
            .insert(CLICKED, noop::<()>(), false, DeliveryMode::Async)
            .unwrap();
        registry
            .insert(CLICKED, noop::<()>(), true, DeliveryMode::Deferred)
            .unwrap();
        registry
            .insert(CLOSED, noop::<u8>(), false, DeliveryMode::Immediate)
            .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.len_for(CLICKED), 2);
        assert_eq!(registry.len_for(CLOSED), 1);
        assert_eq!(registry.len_for(EventId::new(3)), 0);
    }
}
