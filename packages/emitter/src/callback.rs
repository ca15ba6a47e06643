use std::any::type_name;
use std::fmt;
use std::sync::Arc;

/// The shared form of a listener function that accepts arguments of type `A`.
pub(crate) type SharedFn<A> = Arc<dyn Fn(A) + Send + Sync + 'static>;

/// A possibly-empty listener function that accepts the arguments `A` of an emitted event.
///
/// `A` is the full argument list of the event expressed as a single type, typically a tuple
/// such as `(u32, String)` or `()` for events that carry no data.
///
/// Registering an empty callback is a no-op that yields [`ListenerId::INVALID`][1].
///
/// [1]: crate::ListenerId::INVALID
///
/// # Example
///
/// ```rust
/// use emitter::Callback;
///
/// let callback = Callback::new(|(name, count): (String, u32)| {
///     println!("{name} happened {count} times");
/// });
/// assert!(!callback.is_empty());
///
/// let nothing = Callback::<()>::empty();
/// assert!(nothing.is_empty());
/// ```
pub struct Callback<A> {
    function: Option<SharedFn<A>>,
}

impl<A> Callback<A> {
    /// Wraps a function as a callback.
    #[must_use]
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        Self {
            function: Some(Arc::new(function)),
        }
    }

    /// Creates a callback that has no function attached.
    #[must_use]
    pub fn empty() -> Self {
        Self { function: None }
    }

    /// Whether there is no function attached to this callback.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.function.is_none()
    }

    pub(crate) fn into_shared(self) -> Option<SharedFn<A>> {
        self.function
    }
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
        }
    }
}

impl<A> Default for Callback<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("is_empty", &self.is_empty())
            .finish()
    }
}
