//! Process-wide named serial queues backed by a shared pool
//!
//! A convenience layer for applications that want dispatch-by-name without
//! owning any runtime objects: [`q`] and [`blq`] run work on a named FIFO
//! stream, [`any`] and [`blany`] on whichever worker is free. Queues are
//! created on first mention; the pool is created on the first operation and
//! sized by [`set_thread_count`], which therefore must be called before any
//! work is submitted.

use crate::pool::ThreadPool;
use crate::queue::{QueueCore, TaskQueue};
use crate::run::{run, run_serial_boxed, run_sync, run_sync_serial_boxed};
use crate::task::Task;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Worker count used when [`set_thread_count`] was never called.
const DEFAULT_THREADS: usize = 8;

static SHARED: LazyLock<Mutex<Option<Arc<SharedQueues>>>> = LazyLock::new(|| Mutex::new(None));
static THREAD_COUNT: AtomicUsize = AtomicUsize::new(DEFAULT_THREADS);

/// Errors from configuring the shared pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SharedPoolError {
    /// The pool already exists; its size can no longer change.
    #[error("shared pool already started; set_thread_count must be called before first use")]
    AlreadyStarted,
}

/// The singleton: name-to-queue registry plus the pool that drains them.
/// Field order matters at teardown: queues drain their in-flight work while
/// the pool is still alive, then the pool joins its workers.
struct SharedQueues {
    queues: RwLock<FxHashMap<String, TaskQueue>>,
    pool: ThreadPool,
}

impl SharedQueues {
    fn new(threads: usize) -> Self {
        Self {
            queues: RwLock::new(FxHashMap::default()),
            pool: ThreadPool::with_threads(threads),
        }
    }

    fn queue_core(&self, name: &str) -> Arc<QueueCore> {
        if let Some(queue) = self.queues.read().get(name) {
            return Arc::clone(queue.core());
        }
        let mut queues = self.queues.write();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| TaskQueue::named(name))
                .core(),
        )
    }
}

fn instance() -> Arc<SharedQueues> {
    let mut shared = SHARED.lock();
    Arc::clone(shared.get_or_insert_with(|| {
        Arc::new(SharedQueues::new(THREAD_COUNT.load(Ordering::Relaxed)))
    }))
}

/// Set the shared pool's worker count. One-shot: succeeds only before the
/// first operation creates the pool. Zero selects the hardware thread count.
pub fn set_thread_count(threads: usize) -> Result<(), SharedPoolError> {
    let shared = SHARED.lock();
    if shared.is_some() {
        return Err(SharedPoolError::AlreadyStarted);
    }
    THREAD_COUNT.store(threads, Ordering::Relaxed);
    Ok(())
}

/// Run `func` asynchronously on the named serial queue. Work on one name
/// executes in submission order; distinct names run in parallel.
pub fn q<F>(name: &str, func: F)
where
    F: FnOnce() + Send + 'static,
{
    let shared = instance();
    let core = shared.queue_core(name);
    run_serial_boxed(shared.pool.shared(), &core, Box::new(Task::new(func)));
}

/// Run `func` on the named serial queue and block until it has finished.
pub fn blq<F>(name: &str, func: F)
where
    F: FnOnce() + Send + 'static,
{
    let shared = instance();
    let core = shared.queue_core(name);
    run_sync_serial_boxed(shared.pool.shared(), &core, Box::new(Task::new(func)));
}

/// Run `func` asynchronously on any free worker.
pub fn any<F>(func: F)
where
    F: FnOnce() + Send + 'static,
{
    run(&instance().pool, Task::new(func));
}

/// Run `func` on any free worker and block until it has finished.
pub fn blany<F>(func: F)
where
    F: FnOnce() + Send + 'static,
{
    run_sync(&instance().pool, Task::new(func));
}

/// Tear down the shared state: named queues drain their in-flight work, the
/// pool joins its workers. The next operation starts a fresh pool, so
/// [`set_thread_count`] becomes available again.
pub fn shutdown() {
    let shared = SHARED.lock().take();
    drop(shared);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, AtomicI64};
    use std::thread;
    use std::time::{Duration, Instant};

    // The facade is process-wide state, so the whole lifecycle lives in one
    // test to keep the harness's parallel test threads off each other's
    // toes.
    #[test]
    fn test_shared_pool_lifecycle() {
        // Named queues preserve submission order; blq is a barrier.
        let order = Arc::new(PlMutex::new(Vec::new()));
        for i in 0..100 {
            let order = Arc::clone(&order);
            q("lifecycle", move || order.lock().push(i));
        }
        blq("lifecycle", || {});
        assert!(order.lock().iter().copied().eq(0..100));

        // Distinct names are independent streams.
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        q("lifecycle-other", move || flag.store(true, Ordering::SeqCst));
        blq("lifecycle-other", || {});
        assert!(fired.load(Ordering::SeqCst));

        // any/blany hit the pool directly.
        let pending = Arc::new(AtomicI64::new(50));
        for _ in 0..50 {
            let pending = Arc::clone(&pending);
            any(move || {
                pending.fetch_sub(1, Ordering::SeqCst);
            });
        }
        let start = Instant::now();
        while pending.load(Ordering::SeqCst) > 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(pending.load(Ordering::SeqCst), 0);

        let synced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&synced);
        blany(move || flag.store(true, Ordering::SeqCst));
        assert!(synced.load(Ordering::SeqCst));

        // The pool is running, so resizing is rejected now.
        assert_eq!(set_thread_count(4), Err(SharedPoolError::AlreadyStarted));

        // After shutdown the facade restarts on demand with a fresh size.
        shutdown();
        assert!(set_thread_count(2).is_ok());
        let reborn = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reborn);
        blany(move || flag.store(true, Ordering::SeqCst));
        assert!(reborn.load(Ordering::SeqCst));
        shutdown();
    }
}
