//! Routing of deferred work from any thread to the mailbox of a specific thread.

use std::any::type_name;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::{DEFERRED_DROPPED, DEFERRED_EXECUTED};
use crate::{Mailbox, Thunk};

static NEXT_DIRECTORY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The mailboxes owned by the current thread, at most one per directory.
    ///
    /// Dropping a slot deregisters its mailbox, so every mailbox of a thread is deregistered
    /// when the thread exits, whether it returns normally or unwinds.
    static MAILBOX_SLOTS: RefCell<Vec<MailboxSlot>> = const { RefCell::new(Vec::new()) };
}

/// Routes deferred work to the mailboxes of the threads registered with it.
///
/// A thread gets a mailbox in a directory the first time it registers a
/// [`Deferred`][crate::DeliveryMode::Deferred] listener on an emitter that uses the directory,
/// or the first time it calls [`drain()`][Self::drain]. The mailbox is owned by the thread and
/// is discarded, along with any work still in it, when the thread exits. The directory only
/// refers to mailboxes, it never keeps one alive.
///
/// Emitters that need to deliver deferred work into the same mailboxes must share a directory.
/// The directory is a cheaply cloneable handle; all clones refer to the same routing table.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use emitter::Directory;
///
/// let directory = Directory::new();
///
/// // The current thread gets a mailbox in the directory.
/// directory.ensure_mailbox();
///
/// let target = thread::current().id();
/// let sender = directory.clone();
///
/// thread::spawn(move || {
///     assert!(sender.route(target, Box::new(|| println!("hello from the other side"))));
/// })
/// .join()
/// .unwrap();
///
/// // Executes the routed work on this thread.
/// assert_eq!(directory.drain(), 1);
/// ```
#[derive(Clone)]
pub struct Directory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    id: u64,
    mailboxes: Mutex<HashMap<ThreadId, Weak<Mailbox>>>,
}

impl DirectoryInner {
    fn register(&self, mailbox: &Arc<Mailbox>) {
        self.mailboxes
            .lock()
            .insert(mailbox.owner(), Arc::downgrade(mailbox));

        debug!(directory = self.id, thread = ?mailbox.owner(), "mailbox registered");
    }

    fn deregister(&self, owner: ThreadId) {
        self.mailboxes.lock().remove(&owner);

        debug!(directory = self.id, thread = ?owner, "mailbox deregistered");
    }
}

impl Drop for DirectoryInner {
    #[cfg_attr(test, mutants::skip)] // Only observable via the lifetime of captured values.
    fn drop(&mut self) {
        // Nobody can route to or drain these mailboxes through this directory anymore. The slots
        // stay with their threads until pruned, but the work in them is released right away.
        let abandoned: Vec<_> = self
            .mailboxes
            .get_mut()
            .drain()
            .filter_map(|(_, mailbox)| mailbox.upgrade())
            .map(|mailbox| mailbox.take_all())
            .collect();

        let abandoned_count: usize = abandoned.iter().map(VecDeque::len).sum();

        if abandoned_count > 0 {
            debug!(
                directory = self.id,
                abandoned = abandoned_count,
                "directory dropped with undrained work"
            );
        }
    }
}

impl Directory {
    /// Creates a directory without any registered mailboxes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                id: NEXT_DIRECTORY_ID.fetch_add(1, Ordering::Relaxed),
                mailboxes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ensures the current thread has a mailbox registered in this directory.
    ///
    /// Does nothing if the thread is already exiting, as its mailbox could never be drained.
    pub fn ensure_mailbox(&self) {
        drop(self.current_mailbox());
    }

    /// Enqueues `thunk` into the mailbox of `thread`.
    ///
    /// If `thread` has no mailbox in this directory, either because it never created one or
    /// because it has exited, the thunk is dropped without being executed.
    ///
    /// Returns whether the thunk was accepted into a mailbox. Acceptance does not mean the
    /// thunk will ever run: that happens only if the target thread drains its mailbox.
    pub fn route(&self, thread: ThreadId, thunk: Thunk) -> bool {
        let rejected = {
            let mailboxes = self.inner.mailboxes.lock();

            // Enqueueing under the directory lock prevents the mailbox from being
            // deregistered between the lookup and the enqueue.
            match mailboxes.get(&thread).and_then(Weak::upgrade) {
                Some(mailbox) => {
                    mailbox.enqueue(thunk);
                    None
                }
                None => Some(thunk),
            }
        };

        // Dropped outside the lock because dropping the thunk may run user code.
        if let Some(thunk) = rejected {
            drop(thunk);

            DEFERRED_DROPPED.with(|e| e.observe_once());
            trace!(directory = self.inner.id, ?thread, "no mailbox for thread, work dropped");

            return false;
        }

        trace!(directory = self.inner.id, ?thread, "work routed");
        true
    }

    /// Executes the work that is waiting in the current thread's mailbox.
    ///
    /// Work that arrives while draining, including work enqueued by the drained items, is left
    /// for the next call. Returns the number of items executed. Creates the mailbox if the
    /// current thread does not have one yet.
    ///
    /// Threads that register deferred listeners must call this periodically, otherwise those
    /// listeners never run.
    ///
    /// # Panics
    ///
    /// If a work item panics, the panic propagates to the caller. Items that were queued behind
    /// it stay in the mailbox and run on the next call.
    pub fn drain(&self) -> usize {
        let Some(mailbox) = self.current_mailbox() else {
            return 0;
        };

        let executed = mailbox.drain();

        if executed > 0 {
            DEFERRED_EXECUTED.with(|e| e.batch(executed).observe_once());
            trace!(directory = self.inner.id, executed, "mailbox drained");
        }

        executed
    }

    /// The number of items waiting in the current thread's mailbox.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.find_current_mailbox().map_or(0, |mailbox| mailbox.len())
    }

    /// Whether `thread` currently has a mailbox registered in this directory.
    #[must_use]
    pub fn has_mailbox(&self, thread: ThreadId) -> bool {
        self.inner
            .mailboxes
            .lock()
            .get(&thread)
            .is_some_and(|mailbox| mailbox.strong_count() > 0)
    }

    /// The number of threads that currently have a mailbox registered in this directory.
    #[must_use]
    pub fn mailbox_count(&self) -> usize {
        self.inner.mailboxes.lock().len()
    }

    fn find_current_mailbox(&self) -> Option<Arc<Mailbox>> {
        MAILBOX_SLOTS
            .try_with(|slots| {
                slots
                    .borrow()
                    .iter()
                    .find(|slot| slot.directory_id == self.inner.id)
                    .map(|slot| Arc::clone(&slot.mailbox))
            })
            .ok()
            .flatten()
    }

    /// Returns the current thread's mailbox, creating and registering it if needed.
    ///
    /// Returns `None` if the thread-local storage of the current thread is already being
    /// torn down.
    fn current_mailbox(&self) -> Option<Arc<Mailbox>> {
        if let Some(mailbox) = self.find_current_mailbox() {
            return Some(mailbox);
        }

        MAILBOX_SLOTS
            .try_with(|slots| {
                let mailbox = Arc::new(Mailbox::new());
                self.inner.register(&mailbox);

                let stale = {
                    let mut slots = slots.borrow_mut();

                    // Slots of directories that no longer exist are pruned here, as nobody
                    // can route to them anymore.
                    let (live, stale): (Vec<_>, Vec<_>) =
                        mem::take(&mut *slots).into_iter().partition(MailboxSlot::is_live);
                    *slots = live;

                    slots.push(MailboxSlot {
                        directory_id: self.inner.id,
                        directory: Arc::downgrade(&self.inner),
                        mailbox: Arc::clone(&mailbox),
                    });

                    stale
                };

                // Dropping a slot may run user code, so not while the slots are borrowed.
                drop(stale);

                mailbox
            })
            .ok()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.inner.id)
            .field("mailbox_count", &self.mailbox_count())
            .finish()
    }
}

/// Ties the lifetime of a thread's mailbox registration to the thread.
struct MailboxSlot {
    directory_id: u64,
    directory: Weak<DirectoryInner>,
    mailbox: Arc<Mailbox>,
}

impl MailboxSlot {
    fn is_live(&self) -> bool {
        self.directory.strong_count() > 0
    }
}

impl Drop for MailboxSlot {
    #[cfg_attr(test, mutants::skip)] // Only observable via logs and leaked routing entries.
    fn drop(&mut self) {
        if let Some(directory) = self.directory.upgrade() {
            directory.deregister(self.mailbox.owner());
        }

        // Nothing can be enqueued anymore, so whatever is left will never run.
        let abandoned = self.mailbox.take_all();

        if !abandoned.is_empty() {
            debug!(
                directory = self.directory_id,
                thread = ?self.mailbox.owner(),
                abandoned = abandoned.len(),
                "mailbox discarded with undrained work"
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Directory: Send, Sync, Clone);

    fn counting_thunk(counter: &Arc<AtomicUsize>) -> Thunk {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn route_to_unknown_thread_drops_work() {
        let directory = Directory::new();
        let counter = Arc::new(AtomicUsize::new(0));

        // The current thread has no mailbox in this directory yet.
        let accepted = directory.route(thread::current().id(), counting_thunk(&counter));

        assert!(!accepted);
        assert_eq!(directory.drain(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn route_to_own_mailbox_runs_on_drain() {
        let directory = Directory::new();
        let counter = Arc::new(AtomicUsize::new(0));

        directory.ensure_mailbox();
        assert!(directory.has_mailbox(thread::current().id()));

        assert!(directory.route(thread::current().id(), counting_thunk(&counter)));
        assert_eq!(directory.pending(), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        assert_eq!(directory.drain(), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(directory.pending(), 0);
    }

    #[test]
    fn drain_creates_mailbox() {
        let directory = Directory::new();

        assert!(!directory.has_mailbox(thread::current().id()));
        assert_eq!(directory.drain(), 0);
        assert!(directory.has_mailbox(thread::current().id()));
    }

    #[test]
    fn ensure_mailbox_is_idempotent() {
        let directory = Directory::new();

        directory.ensure_mailbox();
        directory.ensure_mailbox();

        assert_eq!(directory.mailbox_count(), 1);
    }

    #[test]
    fn directories_are_independent() {
        let first = Directory::new();
        let second = Directory::new();
        let counter = Arc::new(AtomicUsize::new(0));

        first.ensure_mailbox();

        assert!(!second.route(thread::current().id(), counting_thunk(&counter)));
        assert!(first.route(thread::current().id(), counting_thunk(&counter)));

        assert_eq!(second.drain(), 0);
        assert_eq!(first.drain(), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn mailbox_is_deregistered_when_thread_exits() {
        let directory = Directory::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let worker_id = {
            let directory = directory.clone();
            thread::spawn(move || {
                directory.ensure_mailbox();
                thread::current().id()
            })
            .join()
            .unwrap()
        };

        assert!(!directory.has_mailbox(worker_id));
        assert_eq!(directory.mailbox_count(), 0);
        assert!(!directory.route(worker_id, counting_thunk(&counter)));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn undrained_work_is_dropped_when_thread_exits() {
        let directory = Directory::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (registered_tx, registered_rx) = mpsc::channel();
        let (routed_tx, routed_rx) = mpsc::channel::<()>();

        let worker = {
            let directory = directory.clone();
            thread::spawn(move || {
                directory.ensure_mailbox();
                registered_tx.send(thread::current().id()).unwrap();

                // Exit without draining.
                routed_rx.recv().unwrap();
            })
        };

        let worker_id = registered_rx.recv().unwrap();
        assert!(directory.route(worker_id, counting_thunk(&counter)));

        routed_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 0);
        // The thunk has been dropped, releasing its clone of the counter.
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn routed_work_runs_on_target_thread() {
        let directory = Directory::new();
        let (registered_tx, registered_rx) = mpsc::channel();
        let (ran_on_tx, ran_on_rx) = mpsc::channel();
        let (routed_tx, routed_rx) = mpsc::channel::<()>();

        let worker = {
            let directory = directory.clone();
            thread::spawn(move || {
                directory.ensure_mailbox();
                registered_tx.send(thread::current().id()).unwrap();

                routed_rx.recv().unwrap();
                directory.drain()
            })
        };

        let worker_id = registered_rx.recv().unwrap();
        assert!(directory.route(
            worker_id,
            Box::new(move || ran_on_tx.send(thread::current().id()).unwrap())
        ));
        routed_tx.send(()).unwrap();

        assert_eq!(worker.join().unwrap(), 1);
        assert_eq!(ran_on_rx.recv().unwrap(), worker_id);
    }

    #[test]
    fn dropping_directory_releases_undrained_work() {
        let counter = Arc::new(AtomicUsize::new(0));

        let directory = Directory::new();
        directory.ensure_mailbox();
        assert!(directory.route(thread::current().id(), counting_thunk(&counter)));
        assert_eq!(Arc::strong_count(&counter), 2);

        drop(directory);

        assert_eq!(Arc::strong_count(&counter), 1);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn dropping_directory_releases_work_of_other_threads() {
        let counter = Arc::new(AtomicUsize::new(0));
        let directory = Directory::new();
        let (registered_tx, registered_rx) = mpsc::channel();
        let (dropped_tx, dropped_rx) = mpsc::channel::<()>();

        let worker = {
            let directory = directory.clone();
            thread::spawn(move || {
                directory.ensure_mailbox();

                // The main thread must hold the last handle to the directory.
                drop(directory);
                registered_tx.send(thread::current().id()).unwrap();

                // Stays alive, without draining, until the directory is gone.
                dropped_rx.recv().unwrap();
            })
        };

        let worker_id = registered_rx.recv().unwrap();
        assert!(directory.route(worker_id, counting_thunk(&counter)));

        drop(directory);
        assert_eq!(Arc::strong_count(&counter), 1);

        dropped_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn dropped_directory_slot_is_pruned() {
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let directory = Directory::new();
            directory.ensure_mailbox();
            assert!(directory.route(thread::current().id(), counting_thunk(&counter)));
        }

        // Creating a mailbox in another directory prunes the slot of the dropped one,
        // discarding its undrained work.
        Directory::new().ensure_mailbox();

        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
