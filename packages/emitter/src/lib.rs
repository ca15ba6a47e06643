#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Named-event publish/subscribe with three delivery disciplines.
//!
//! Components register listeners for events on an [`Emitter`] and other components emit those
//! events. Each listener picks one [`DeliveryMode`]:
//!
//! - **Immediate**: runs inline on the emitting thread before `emit()` returns.
//! - **Async** (default): runs on a bounded worker pool owned by the emitter; `emit()` does not
//!   wait for it.
//! - **Deferred**: runs on the thread that registered the listener, when that thread next
//!   drains its mailbox via [`Emitter::drain()`] or [`Directory::drain()`].
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! use emitter::{DeliveryMode, Emitter, EventId};
//!
//! const BYTES_RECEIVED: EventId = EventId::new(1);
//!
//! let emitter = Emitter::new();
//! let total = Arc::new(AtomicU32::new(0));
//!
//! let listener = emitter
//!     .on_with(BYTES_RECEIVED, DeliveryMode::Deferred, {
//!         let total = Arc::clone(&total);
//!         move |bytes: u32| {
//!             total.fetch_add(bytes, Ordering::Relaxed);
//!         }
//!     })
//!     .unwrap();
//!
//! emitter.emit(BYTES_RECEIVED, 100_u32).unwrap();
//! emitter.emit(BYTES_RECEIVED, 20_u32).unwrap();
//!
//! // Deferred listeners only run when their thread drains its mailbox.
//! assert_eq!(total.load(Ordering::Relaxed), 0);
//! assert_eq!(emitter.drain(), 2);
//! assert_eq!(total.load(Ordering::Relaxed), 120);
//!
//! emitter.off(listener);
//! ```
//!
//! # Cross-thread delivery
//!
//! Deferred deliveries are routed through a [`Directory`], which maps each thread to its
//! mailbox. A thread gets a mailbox when it first registers a deferred listener or first
//! drains, and loses it when the thread exits. Work routed to a thread without a mailbox is
//! dropped silently, as the sender cannot know whether the receiving thread is still alive.
//!
//! Emitters that should share mailboxes must be built with the same directory via
//! [`EmitterBuilder::directory()`].
//!
//! # Failures
//!
//! Registration and emission only fail when one event is used with two different argument
//! types, see [`Error::SignatureMismatch`]. Emitting an event without listeners, removing an
//! unknown listener and registering an empty [`Callback`] are all defined no-ops.
//!
//! A panic in an immediate listener propagates to the caller of `emit()`. A panic in an async
//! listener is caught and logged by the worker. A panic in a deferred listener propagates to the
//! thread that drains it, while the deliveries queued behind it wait for the next drain.
//!
//! # Logging
//!
//! The crate emits diagnostics through [`tracing`]. Logging never affects delivery.

mod callback;
mod directory;
mod emitter;
mod error;
mod id;
mod listener;
mod mailbox;
mod metrics;
mod mode;
mod pool;
mod registry;

pub use callback::*;
pub use directory::*;
pub use emitter::*;
pub use error::*;
pub use id::*;
pub(crate) use listener::*;
pub(crate) use mailbox::Mailbox;
pub use mailbox::Thunk;
pub use mode::*;
pub(crate) use pool::*;
pub(crate) use registry::Registry;
