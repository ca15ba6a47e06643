//! Per-thread queue of deferred work.

use std::any::type_name;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// A unit of deferred work. Executed at most once.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// FIFO queue of deferred work owned by one thread.
///
/// Any thread may enqueue work but only the owning thread drains it.
pub(crate) struct Mailbox {
    owner: ThreadId,
    queue: Mutex<VecDeque<Thunk>>,
}

impl Mailbox {
    /// Creates a mailbox owned by the current thread.
    pub(crate) fn new() -> Self {
        Self {
            owner: thread::current().id(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    pub(crate) fn enqueue(&self, thunk: Thunk) {
        self.queue.lock().push_back(thunk);
    }

    /// Executes the work that was queued at the time of the call, in FIFO order.
    ///
    /// Work enqueued while draining (including by the drained work itself) is left for the
    /// next drain. Returns the number of items executed.
    ///
    /// # Panics
    ///
    /// If a work item panics, the panic propagates to the caller. The items that followed it
    /// in this pass are put back at the front of the queue and run on the next drain.
    pub(crate) fn drain(&self) -> usize {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "a mailbox may only be drained by its owning thread"
        );

        // The lock is released before any work runs, so work may enqueue more work.
        let batch = mem::take(&mut *self.queue.lock());
        let count = batch.len();

        // Empty unless a work item panicked.
        let mut remaining = scopeguard::guard(batch, |remaining| self.requeue_front(remaining));

        while let Some(thunk) = remaining.pop_front() {
            thunk();
        }

        count
    }

    /// Puts `items` back in front of whatever was enqueued since they were taken.
    fn requeue_front(&self, mut items: VecDeque<Thunk>) {
        if items.is_empty() {
            return;
        }

        let mut queue = self.queue.lock();
        items.append(&mut *queue);
        *queue = items;
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Removes and returns all queued work without executing it.
    pub(crate) fn take_all(&self) -> VecDeque<Thunk> {
        mem::take(&mut *self.queue.lock())
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("owner", &self.owner)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Mailbox: Send, Sync);

    #[test]
    fn drain_of_empty_mailbox_is_noop() {
        let mailbox = Mailbox::new();

        assert_eq!(mailbox.drain(), 0);
        assert_eq!(mailbox.drain(), 0);
    }

    #[test]
    fn drain_executes_in_fifo_order() {
        let mailbox = Mailbox::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            mailbox.enqueue(Box::new(move || order.lock().push(i)));
        }

        assert_eq!(mailbox.len(), 5);
        assert_eq!(mailbox.drain(), 5);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(mailbox.len(), 0);
    }

    #[test]
    fn work_enqueued_during_drain_waits_for_next_drain() {
        let mailbox = Arc::new(Mailbox::new());
        let executed = Arc::new(AtomicUsize::new(0));

        {
            let mailbox_clone = Arc::clone(&mailbox);
            let executed = Arc::clone(&executed);

            mailbox.enqueue(Box::new(move || {
                executed.fetch_add(1, Ordering::Relaxed);

                let executed = Arc::clone(&executed);
                mailbox_clone.enqueue(Box::new(move || {
                    executed.fetch_add(10, Ordering::Relaxed);
                }));
            }));
        }

        assert_eq!(mailbox.drain(), 1);
        assert_eq!(executed.load(Ordering::Relaxed), 1);

        assert_eq!(mailbox.drain(), 1);
        assert_eq!(executed.load(Ordering::Relaxed), 11);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn other_threads_can_enqueue() {
        let mailbox = Arc::new(Mailbox::new());
        let executed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                let executed = Arc::clone(&executed);

                thread::spawn(move || {
                    for _ in 0..100 {
                        let executed = Arc::clone(&executed);
                        mailbox.enqueue(Box::new(move || {
                            executed.fetch_add(1, Ordering::Relaxed);
                        }));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mailbox.drain(), 400);
        assert_eq!(executed.load(Ordering::Relaxed), 400);
    }

    #[test]
    fn panicking_item_leaves_rest_of_batch_for_next_drain() {
        let mailbox = Mailbox::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        mailbox.enqueue(Box::new(|| panic!("intentional panic")));

        for i in 1..=2 {
            let order = Arc::clone(&order);
            mailbox.enqueue(Box::new(move || order.lock().push(i)));
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| mailbox.drain()));

        assert!(result.is_err());
        assert!(order.lock().is_empty());
        assert_eq!(mailbox.len(), 2);

        // Arrived after the panic, so it runs after the items that were left over.
        {
            let order = Arc::clone(&order);
            mailbox.enqueue(Box::new(move || order.lock().push(3)));
        }

        assert_eq!(mailbox.drain(), 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(mailbox.len(), 0);
    }

    #[test]
    fn take_all_empties_without_executing() {
        let mailbox = Mailbox::new();
        let executed = Arc::new(AtomicUsize::new(0));

        {
            let executed = Arc::clone(&executed);
            mailbox.enqueue(Box::new(move || {
                executed.fetch_add(1, Ordering::Relaxed);
            }));
        }

        assert_eq!(mailbox.take_all().len(), 1);
        assert_eq!(mailbox.len(), 0);
        assert_eq!(executed.load(Ordering::Relaxed), 0);
    }
}
