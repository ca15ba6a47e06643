use thiserror::Error;

use crate::EventId;

/// Errors that can occur when registering listeners or emitting events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The argument type used with an event does not match the argument type of the listeners
    /// already registered for that event.
    ///
    /// All listeners of one event must accept the same argument type and every emission of
    /// that event must provide it. Using one event identifier for two different argument types
    /// is a programming error.
    #[error(
        "signature mismatch for event {event}: listeners accept '{expected}' but '{actual}' was used"
    )]
    SignatureMismatch {
        /// The event whose signature was violated.
        event: EventId,

        /// The argument type fixed by the listeners registered for the event.
        expected: &'static str,

        /// The argument type that was used in the rejected operation.
        actual: &'static str,
    },
}

/// A specialized `Result` type for emitter operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
