//! Ordered task container with a liveness token and a dispatch baton
//!
//! A [`TaskQueue`] owns an insertion-ordered deque of type-erased tasks. Two
//! locks with distinct jobs keep it honest under load:
//!
//! - the container mutex guards the deque itself (push, pop, sort),
//! - the dispatch baton serialises execution when the queue is paired with a
//!   worker pool: exactly one task per queue is in flight at any time.
//!
//! The queue strongly holds an atomic liveness token; every task added to it
//! captures a weak reference. Teardown revokes the token, drops whatever has
//! not started, and waits out in-flight work for at most five seconds.

use crate::task::{AnyTask, Task, TaskMeta};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on the teardown wait for in-flight tasks. Work that needs a
/// stronger guarantee must go through `run_sync`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state behind a [`TaskQueue`] handle.
///
/// Serial wrappers and schedule wrappers hold this core weakly; once the
/// handle is gone they upgrade, fail, and skip their bookkeeping instead of
/// touching freed state.
pub(crate) struct QueueCore {
    tasks: Mutex<VecDeque<Box<dyn AnyTask>>>,

    /// Liveness flag captured weakly by every task in the queue.
    token: Arc<AtomicBool>,

    /// Set during teardown; submissions after this are silently dropped.
    complete: AtomicBool,

    /// Task count mirrored outside the container lock so `has_next` stays
    /// non-blocking. Relaxed accesses paired with explicit fences around
    /// container mutations.
    count: AtomicI64,

    /// Tasks currently executing on some thread. The destructor waits for
    /// this to reach zero, bounded by [`DRAIN_TIMEOUT`].
    in_flight: AtomicI32,

    /// Dispatch baton for serial-on-pool execution. Acquired by whichever
    /// agent launches the next task, released from the worker that finishes
    /// it.
    baton: AtomicBool,

    name: Option<String>,
}

impl QueueCore {
    fn new(name: Option<String>) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            token: Arc::new(AtomicBool::new(true)),
            complete: AtomicBool::new(false),
            count: AtomicI64::new(0),
            in_flight: AtomicI32::new(0),
            baton: AtomicBool::new(false),
            name,
        }
    }

    /// Accepting new work and not yet revoked.
    pub(crate) fn is_live(&self) -> bool {
        !self.complete.load(Ordering::Acquire) && self.token.load(Ordering::Acquire)
    }

    /// Stop accepting submissions without draining. Used by the pool on
    /// shutdown; full teardown happens when the owning handle drops.
    pub(crate) fn close(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub(crate) fn add_boxed(&self, mut task: Box<dyn AnyTask>) {
        if self.complete.load(Ordering::Acquire) {
            return;
        }
        let mut tasks = self.tasks.lock();
        if self.complete.load(Ordering::Acquire) {
            return;
        }
        if !task.has_token() {
            task.stamp_token(Arc::downgrade(&self.token));
        }
        tasks.push_back(task);
        fence(Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn next_pop(&self) -> Option<Box<dyn AnyTask>> {
        if self.complete.load(Ordering::Acquire) {
            return None;
        }
        let mut tasks = self.tasks.lock();
        fence(Ordering::Acquire);
        let task = tasks.pop_front();
        if task.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Pop the front task and run it on the calling thread. Returns whether
    /// more work remains.
    pub(crate) fn next(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = self.next_pop() {
            if !self.complete.load(Ordering::Acquire) {
                task.run_v();
            }
        }
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.has_next()
    }

    pub(crate) fn has_next(&self) -> bool {
        if self.complete.load(Ordering::Acquire) {
            return false;
        }
        fence(Ordering::Acquire);
        self.count.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn next_dispatch_time(&self) -> Option<Instant> {
        if self.complete.load(Ordering::Acquire) {
            return None;
        }
        let tasks = self.tasks.lock();
        tasks.front().map(|task| task.dispatch_time())
    }

    pub(crate) fn sort_by<F>(&self, mut cmp: F)
    where
        F: FnMut(&TaskMeta, &TaskMeta) -> CmpOrdering,
    {
        if self.complete.load(Ordering::Acquire) {
            return;
        }
        let mut tasks = self.tasks.lock();
        // Stable, so equal dispatch times keep insertion order.
        tasks.make_contiguous().sort_by(|a, b| {
            cmp(
                &TaskMeta {
                    dispatch_time: a.dispatch_time(),
                },
                &TaskMeta {
                    dispatch_time: b.dispatch_time(),
                },
            )
        });
        fence(Ordering::Release);
    }

    // -- dispatch baton ------------------------------------------------------

    /// Try to claim the right to launch the next serial task.
    pub(crate) fn begin_dispatch(&self) -> bool {
        self.baton
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn release_dispatch(&self) {
        self.baton.store(false, Ordering::Release);
    }

    pub(crate) fn start_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A task detached from a queue, ready to run on the caller's thread.
pub struct DetachedTask {
    inner: Box<dyn AnyTask>,
}

impl DetachedTask {
    /// Run the detached task to completion.
    pub fn run(self) {
        self.inner.run_v();
    }

    /// Instant at which the task was eligible to run.
    pub fn dispatch_time(&self) -> Instant {
        self.inner.dispatch_time()
    }
}

/// An insertion-ordered queue of tasks sharing one liveness token.
///
/// On its own a queue is a container drained with [`next`](TaskQueue::next).
/// Paired with a [`ThreadPool`](crate::ThreadPool) through
/// [`run_serial`](crate::run_serial) it becomes a strict FIFO execution
/// stream. Dropping the queue revokes the token: tasks already dispatched
/// skip their bodies, and the drop waits out in-flight work for at most five
/// seconds.
pub struct TaskQueue {
    core: Arc<QueueCore>,
}

impl TaskQueue {
    /// Create an anonymous queue.
    pub fn new() -> Self {
        Self {
            core: Arc::new(QueueCore::new(None)),
        }
    }

    /// Create a queue carrying an identifier, useful in diagnostics.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(QueueCore::new(Some(name.into()))),
        }
    }

    /// The queue's identifier, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    /// Append a task. It is stamped with this queue's liveness token unless
    /// the runtime already bound it elsewhere. A queue that has begun
    /// teardown drops the task silently; submit/teardown races are routine
    /// and not an error.
    pub fn add<R: 'static>(&self, task: Task<R>) {
        self.core.add_boxed(Box::new(task));
    }

    /// Run the front task on the calling thread. Returns whether more work
    /// remains, so `while queue.next() {}` drains the queue.
    pub fn next(&self) -> bool {
        self.core.next()
    }

    /// Detach the front task without running it.
    pub fn next_pop(&self) -> Option<DetachedTask> {
        self.core.next_pop().map(|inner| DetachedTask { inner })
    }

    /// Dispatch instant of the front task, or `None` when the queue is empty
    /// or shutting down.
    pub fn next_dispatch_time(&self) -> Option<Instant> {
        self.core.next_dispatch_time()
    }

    /// Non-blocking: `true` when a task is queued and the queue is live.
    pub fn has_next(&self) -> bool {
        self.core.has_next()
    }

    /// Reorder queued tasks by their scheduling metadata. The sort is
    /// stable.
    pub fn sort_by<F>(&self, cmp: F)
    where
        F: FnMut(&TaskMeta, &TaskMeta) -> CmpOrdering,
    {
        self.core.sort_by(cmp)
    }

    pub(crate) fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        {
            let mut tasks = self.core.tasks.lock();
            self.core.complete.store(true, Ordering::Release);
            self.core.token.store(false, Ordering::Release);
            tasks.clear();
            self.core.count.store(0, Ordering::Relaxed);
        }
        // Bounded yield-wait so a misbehaving task cannot wedge teardown.
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.core.in_flight.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;

    #[test]
    fn test_queue_drains_in_submission_order() {
        let queue = TaskQueue::new();
        let total = Arc::new(AtomicI64::new(0));
        let n = 10_000i64;
        for i in 1..=n {
            let total = Arc::clone(&total);
            queue.add(Task::new(move || {
                total.fetch_add(i, Ordering::SeqCst);
            }));
        }
        while queue.next() {}
        assert_eq!(total.load(Ordering::SeqCst), n * (n + 1) / 2);
        assert_eq!(total.load(Ordering::SeqCst), 50_005_000);
    }

    #[test]
    fn test_after_hook_adds_returned_value() {
        let queue = TaskQueue::new();
        let total = Arc::new(AtomicI64::new(0));
        let n = 10_000i64;
        for i in 1..=n {
            let body = Arc::clone(&total);
            let sink = Arc::clone(&total);
            queue.add(
                Task::new(move || {
                    body.fetch_add(i, Ordering::SeqCst);
                    i
                })
                .after(move |returned| {
                    sink.fetch_add(*returned, Ordering::SeqCst);
                }),
            );
        }
        while queue.next() {}
        assert_eq!(total.load(Ordering::SeqCst), 100_010_000);
    }

    #[test]
    fn test_add_after_close_is_dropped() {
        let queue = TaskQueue::new();
        queue.core().close();
        queue.add(Task::new(|| ()));
        assert!(!queue.has_next());
    }

    #[test]
    fn test_next_pop_detaches_front() {
        let queue = TaskQueue::new();
        let order = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.add(Task::new(move || order.lock().push(i)));
        }
        let front = queue.next_pop().expect("queue should have a task");
        assert!(queue.has_next());
        front.run();
        while queue.next() {}
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_sort_by_dispatch_time_is_stable() {
        let queue = TaskQueue::new();
        let order = Arc::new(PlMutex::new(Vec::new()));
        let base = Instant::now() - Duration::from_secs(1);

        // Two ties at the later instant keep their insertion order.
        for (label, offset) in [(1, 50u64), (2, 50), (0, 0)] {
            let order = Arc::clone(&order);
            queue.add(
                Task::new(move || order.lock().push(label)).at(base + Duration::from_millis(offset)),
            );
        }
        queue.sort_by(|a, b| a.dispatch_time.cmp(&b.dispatch_time));
        assert_eq!(queue.next_dispatch_time(), Some(base));
        while queue.next() {}
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_revokes_token_and_clears_pending() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let body = Arc::clone(&ran);
        queue.add(Task::new(move || body.store(true, Ordering::SeqCst)));

        let core = Arc::clone(queue.core());
        assert!(core.is_live());
        drop(queue);

        assert!(!core.is_live());
        assert!(!core.has_next());
        assert!(!ran.load(Ordering::SeqCst));

        // Late submissions against the dead core are silently dropped.
        core.add_boxed(Box::new(Task::new(|| ())));
        assert!(!core.has_next());
    }

    #[test]
    fn test_detached_task_skips_body_after_drop() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let body = Arc::clone(&ran);
        queue.add(Task::new(move || body.store(true, Ordering::SeqCst)));

        let detached = queue.next_pop().expect("task should detach");
        drop(queue);

        // Token revoked between dequeue and execution: body must not run.
        detached.run();
        assert!(!ran.load(Ordering::SeqCst));
    }
}
