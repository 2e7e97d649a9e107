//! Fixed pool of worker threads sharing one inbox queue
//!
//! Workers block on a condvar with a bounded timeout so a lost wakeup never
//! strands queued work, pop from the inbox under the pool lock, and run the
//! task outside it. The inbox is an ordinary [`TaskQueue`], which is what
//! lets pools and serial queues compose: they trade in the same task
//! currency.

use crate::queue::TaskQueue;
use crate::run_loop::RunLoop;
use crate::task::AnyTask;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Bound on each condvar wait so workers survive missed notifications.
const WORKER_WAIT: Duration = Duration::from_millis(100);

/// State shared between the pool handle, its workers, and serial dispatch
/// wrappers (which hold it weakly).
pub(crate) struct PoolShared {
    /// The pool's shared work source.
    pub(crate) inbox: TaskQueue,

    /// Guards the wait predicate below; never held while running a task.
    pub(crate) task_lock: Mutex<()>,

    /// Signalled once per appended task.
    pub(crate) task_waiter: Condvar,

    pub(crate) exiting: AtomicBool,

    /// Lazily constructed timed-dispatch loop, created on the first
    /// scheduled submission through this pool.
    runloop: Mutex<Option<Arc<RunLoop>>>,
}

impl PoolShared {
    /// Append a task and wake one worker. Callers that need the submission
    /// ordered against other submitters take `task_lock` first.
    pub(crate) fn submit(&self, task: Box<dyn AnyTask>) {
        self.inbox.core().add_boxed(task);
        self.task_waiter.notify_one();
    }

    /// Locked submission path used by the public run surface.
    pub(crate) fn run_boxed(&self, task: Box<dyn AnyTask>) {
        let _guard = self.task_lock.lock();
        self.submit(task);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        if shared.exiting.load(Ordering::Acquire) {
            break;
        }
        let task = {
            let mut guard = shared.task_lock.lock();
            if !shared.inbox.has_next() && !shared.exiting.load(Ordering::Acquire) {
                let _ = shared.task_waiter.wait_for(&mut guard, WORKER_WAIT);
            }
            shared.inbox.core().next_pop()
        };
        if shared.exiting.load(Ordering::Acquire) {
            break;
        }
        if let Some(task) = task {
            task.run_v();
        }
    }

    #[cfg(debug_assertions)]
    eprintln!(
        "{} shutting down",
        thread::current().name().unwrap_or("strand-worker")
    );
}

/// A fixed set of worker threads draining one shared inbox.
///
/// Tasks submitted through [`run`](crate::run) execute in parallel across
/// the workers; pairing the pool with a [`TaskQueue`] through
/// [`run_serial`](crate::run_serial) serialises execution per queue while
/// other queues and plain submissions keep running in parallel.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Create a pool with one worker per hardware thread.
    pub fn new() -> Self {
        Self::with_threads(num_cpus::get())
    }

    /// Create a pool with the given number of workers. Zero falls back to
    /// the hardware thread count.
    pub fn with_threads(count: usize) -> Self {
        let count = if count == 0 { num_cpus::get() } else { count };
        let shared = Arc::new(PoolShared {
            inbox: TaskQueue::new(),
            task_lock: Mutex::new(()),
            task_waiter: Condvar::new(),
            exiting: AtomicBool::new(false),
            runloop: Mutex::new(None),
        });

        let threads = (0..count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("strand-worker-{}", id))
                    .spawn(move || worker_loop(shared))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Self { shared, threads }
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// The pool's run loop, created on first use.
    pub(crate) fn runloop(&self) -> Arc<RunLoop> {
        let mut slot = self.shared.runloop.lock();
        Arc::clone(slot.get_or_insert_with(|| Arc::new(RunLoop::new())))
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.exiting.store(true, Ordering::Release);
        self.shared.inbox.core().close();
        self.shared.task_waiter.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(run_loop) = self.shared.runloop.lock().take() {
            run_loop.stop();
        }
    }
}
