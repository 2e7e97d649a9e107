//! Submission surface: parallel, serial-on-pool, synchronous and timed
//!
//! Free functions compose the runtime's pieces. The heart of the module is
//! the serial-on-pool interlock: a queue's dispatch baton is claimed before
//! a task is handed to the pool and travels with it, released from the
//! worker only after the task's body and hooks have finished. Exactly one
//! task per queue is ever in flight, which yields strict FIFO order per
//! queue on top of a fully parallel pool.

use crate::pool::{PoolShared, ThreadPool};
use crate::queue::{QueueCore, TaskQueue};
use crate::run_loop::RunLoop;
use crate::task::{AnyTask, Task};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

// ============================================================================
// run
// ============================================================================

/// Dispatch a task onto the pool; any idle worker picks it up.
pub fn run<R: 'static>(pool: &ThreadPool, task: Task<R>) {
    pool.shared().run_boxed(Box::new(task));
}

/// Append a task to a queue and drain one entry on the calling thread.
pub fn run_local<R: 'static>(queue: &TaskQueue, task: Task<R>) {
    queue.add(task);
    queue.next();
}

/// Dispatch a task onto the pool through a serial queue: it runs after every
/// task previously submitted to the queue has fully finished, while other
/// queues and plain submissions proceed in parallel.
pub fn run_serial<R: 'static>(pool: &ThreadPool, queue: &TaskQueue, task: Task<R>) {
    run_serial_boxed(pool.shared(), queue.core(), Box::new(task));
}

/// Serial interlock. Returns whether the task was accepted; a queue that
/// completed teardown concurrently drops it silently.
pub(crate) fn run_serial_boxed(
    pool: &Arc<PoolShared>,
    core: &Arc<QueueCore>,
    mut task: Box<dyn AnyTask>,
) -> bool {
    if !core.is_live() {
        return false;
    }

    // Ownership of the baton transfers into the task: it is claimed by
    // whichever agent launches the task and released here, after the body
    // and the user continuation have finished.
    let prior = task.take_after_internal();
    let pool_ref: Weak<PoolShared> = Arc::downgrade(pool);
    let core_ref: Weak<QueueCore> = Arc::downgrade(core);
    task.set_after_internal(Box::new(move || {
        if let Some(hook) = prior {
            hook();
        }
        if let Some(core) = core_ref.upgrade() {
            core.release_dispatch();
            if let Some(pool) = pool_ref.upgrade() {
                try_next(&pool, &core);
            }
            core.finish_in_flight();
        }
    }));

    core.add_boxed(task);
    try_next(pool, core);
    true
}

/// Launch the queue's next task onto the pool if nothing from this queue is
/// in flight. Loses gracefully: whoever holds the baton will call back in
/// here once it is released.
fn try_next(pool: &Arc<PoolShared>, core: &Arc<QueueCore>) {
    // Store-buffer interlock: an append and a baton release race through
    // here from different threads; each side's write must be visible before
    // the other side's check, or a tail task could strand.
    fence(Ordering::SeqCst);
    if core.has_next() && core.begin_dispatch() {
        if let Some(task) = core.next_pop() {
            core.start_in_flight();
            pool.submit(task);
        } else {
            core.release_dispatch();
        }
    }
}

// ============================================================================
// run_sync
// ============================================================================

/// Completion gate layered over a task's internal after hook.
struct CompletionGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CompletionGate {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Chain the signalling wrapper in front of whatever hook is already
    /// installed, so the gate opens only after the full after-chain ran.
    fn arm(&self, task: &mut dyn AnyTask) {
        let prior = task.take_after_internal();
        let inner = Arc::clone(&self.inner);
        task.set_after_internal(Box::new(move || {
            if let Some(hook) = prior {
                hook();
            }
            let (lock, condvar) = &*inner;
            *lock.lock() = true;
            condvar.notify_one();
        }));
    }

    fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut done = lock.lock();
        while !*done {
            condvar.wait(&mut done);
        }
    }
}

/// Dispatch a task onto the pool and block the calling thread until its body
/// and continuations have fully finished. The caller need not be a worker.
pub fn run_sync<R: 'static>(pool: &ThreadPool, mut task: Task<R>) {
    let gate = CompletionGate::new();
    gate.arm(&mut task);
    run(pool, task);
    gate.wait();
}

/// Serial dispatch that blocks until completion. Returns without running
/// when the queue is already shutting down, so a teardown race cannot leave
/// the caller waiting forever.
pub fn run_sync_serial<R: 'static>(pool: &ThreadPool, queue: &TaskQueue, task: Task<R>) {
    run_sync_serial_boxed(pool.shared(), queue.core(), Box::new(task));
}

pub(crate) fn run_sync_serial_boxed(
    pool: &Arc<PoolShared>,
    core: &Arc<QueueCore>,
    mut task: Box<dyn AnyTask>,
) {
    if !core.is_live() {
        return;
    }
    let gate = CompletionGate::new();
    gate.arm(task.as_mut());
    if run_serial_boxed(pool, core, task) {
        gate.wait();
    }
}

// ============================================================================
// schedule
// ============================================================================

/// Dispatch a task onto the pool at or after `when`. The pool's run loop is
/// created on first use.
pub fn schedule<R: 'static>(pool: &ThreadPool, when: Instant, task: Task<R>) {
    let run_loop = pool.runloop();
    let pool_ref = Arc::downgrade(pool.shared());
    let wrapper = Task::new(move || {
        if let Some(pool) = pool_ref.upgrade() {
            pool.run_boxed(Box::new(task));
        }
    })
    .at(when);
    run_loop.queue().add(wrapper);
    run_loop.notify();
}

/// Serial dispatch at or after `when`. The wrapper holds the target queue
/// weakly: if the queue dies before the instant arrives, nothing runs.
pub fn schedule_serial<R: 'static>(
    pool: &ThreadPool,
    queue: &TaskQueue,
    when: Instant,
    task: Task<R>,
) {
    let run_loop = pool.runloop();
    let pool_ref = Arc::downgrade(pool.shared());
    let core_ref = Arc::downgrade(queue.core());
    let wrapper = Task::new(move || {
        if let (Some(pool), Some(core)) = (pool_ref.upgrade(), core_ref.upgrade()) {
            run_serial_boxed(&pool, &core, Box::new(task));
        }
    })
    .at(when);
    run_loop.queue().add(wrapper);
    run_loop.notify();
}

/// Enqueue a task directly on an externally owned run loop. The body runs on
/// the looper thread when the instant arrives.
pub fn schedule_on<R: 'static>(run_loop: &RunLoop, when: Instant, task: Task<R>) {
    run_loop.queue().add(task.at(when));
    run_loop.notify();
}

/// Timed serial dispatch without a pool: when the instant arrives the task
/// is appended to the target queue and one entry is drained on the looper
/// thread.
pub fn schedule_on_serial<R: 'static>(
    run_loop: &RunLoop,
    queue: &TaskQueue,
    when: Instant,
    task: Task<R>,
) {
    let core_ref = Arc::downgrade(queue.core());
    let wrapper = Task::new(move || {
        if let Some(core) = core_ref.upgrade() {
            core.add_boxed(Box::new(task));
            core.next();
        }
    })
    .at(when);
    run_loop.queue().add(wrapper);
    run_loop.notify();
}
