//! Strongly typed identifiers for events and listeners.

use std::fmt;

/// Defines a newtype identifier over an unsigned integer that is comparable only with itself.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident($raw:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        #[repr(transparent)]
        pub struct $name($raw);

        impl $name {
            /// Creates an identifier from its raw value.
            #[must_use]
            pub const fn new(raw: $raw) -> Self {
                Self(raw)
            }

            /// Returns the raw value of the identifier.
            #[must_use]
            pub const fn get(self) -> $raw {
                self.0
            }

            /// Returns the identifier that follows this one.
            ///
            /// # Panics
            ///
            /// Panics if the identifier space is exhausted.
            #[must_use]
            pub const fn next(self) -> Self {
                match self.0.checked_add(1) {
                    Some(raw) => Self(raw),
                    None => panic!("identifier space exhausted"),
                }
            }

            /// Advances the identifier in place and returns the new value.
            ///
            /// # Panics
            ///
            /// Panics if the identifier space is exhausted.
            pub fn increment(&mut self) -> Self {
                *self = self.next();
                *self
            }
        }

        impl From<$raw> for $name {
            fn from(raw: $raw) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a category of occurrences that listeners subscribe to.
    ///
    /// Any number of listeners may share one event identifier. All listeners registered under
    /// the same identifier must agree on the argument type they accept.
    EventId(u32)
);

define_id!(
    /// Identifies one registered subscription on an [`Emitter`][crate::Emitter].
    ///
    /// Identifiers are assigned in strictly increasing order starting from 1 and are never
    /// reused by the same emitter, even after the subscription is removed. The 64-bit space
    /// cannot be exhausted by any realistic number of registrations.
    ListenerId(u64)
);

impl ListenerId {
    /// The identifier returned when a registration is rejected. Never assigned to a listener.
    pub const INVALID: Self = Self(0);

    /// Whether this identifier may refer to a real registration.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}
