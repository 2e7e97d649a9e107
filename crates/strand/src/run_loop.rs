//! Timed dispatch loop
//!
//! Instead of polling for due tasks, a single looper thread waits on a
//! condvar until the head of its time-ordered queue comes due, then drains
//! everything whose dispatch instant has arrived. `notify` re-sorts the
//! queue (stable, so ties keep submission order) and wakes the looper; a
//! dirty flag defeats spurious and stale waits.

use crate::queue::TaskQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bound on joining the looper at shutdown; a user task stuck on the looper
/// thread must not wedge the owner's teardown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct LoopState {
    /// Set by every `notify` so the looper re-reads the queue head even when
    /// a wait returns early.
    dirty: bool,
}

struct LoopShared {
    queue: TaskQueue,
    state: Mutex<LoopState>,
    notify: Condvar,
    exiting: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

fn looper_main(shared: Arc<LoopShared>) {
    loop {
        if shared.exiting.load(Ordering::Acquire) {
            break;
        }

        {
            let mut state = shared.state.lock();

            // Re-check after acquiring the lock: stop() may set the flag and
            // notify between our first check and this point, and that
            // notification would otherwise be lost.
            if shared.exiting.load(Ordering::Acquire) {
                break;
            }

            match shared.queue.next_dispatch_time() {
                None => {
                    while !(shared.queue.has_next()
                        || shared.exiting.load(Ordering::Acquire)
                        || state.dirty)
                    {
                        shared.notify.wait(&mut state);
                    }
                }
                Some(due) => {
                    let now = Instant::now();
                    if now < due && !state.dirty {
                        let _ = shared.notify.wait_until(&mut state, due);
                    }
                }
            }
            state.dirty = false;
        }

        // Drain everything that has come due, running on this thread.
        while !shared.exiting.load(Ordering::Acquire) {
            match shared.queue.next_dispatch_time() {
                Some(due) if due <= Instant::now() => {
                    shared.queue.next();
                }
                _ => break,
            }
        }
    }

    #[cfg(debug_assertions)]
    eprintln!("run loop shutting down");
}

/// A single-threaded scheduler that re-dispatches tasks once their dispatch
/// instant arrives.
///
/// Pools create one lazily for [`schedule`](crate::schedule); standalone
/// loops serve [`schedule_on`](crate::schedule_on). Dropping the loop stops
/// the looper thread and discards tasks that never came due.
pub struct RunLoop {
    shared: Arc<LoopShared>,
}

impl RunLoop {
    /// Create the loop and start its looper thread.
    pub fn new() -> Self {
        let shared = Arc::new(LoopShared {
            queue: TaskQueue::new(),
            state: Mutex::new(LoopState { dirty: false }),
            notify: Condvar::new(),
            exiting: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let looper = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("strand-runloop".to_string())
            .spawn(move || looper_main(looper))
            .expect("Failed to spawn run loop thread");
        *shared.handle.lock() = Some(handle);

        Self { shared }
    }

    /// Wake the looper after enqueueing: sorts the queue ascending by
    /// dispatch instant (stable) and broadcasts.
    pub fn notify(&self) {
        if self.shared.exiting.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.shared.state.lock();
        self.shared
            .queue
            .sort_by(|a, b| a.dispatch_time.cmp(&b.dispatch_time));
        state.dirty = true;
        self.shared.notify.notify_all();
    }

    /// Stop the looper thread. Idempotent; the join is bounded so a stuck
    /// user task cannot wedge the caller.
    pub fn stop(&self) {
        self.shared.exiting.store(true, Ordering::Release);
        {
            let mut state = self.shared.state.lock();
            state.dirty = true;
        }
        self.shared.notify.notify_all();

        if let Some(handle) = self.shared.handle.lock().take() {
            let start = Instant::now();
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > JOIN_TIMEOUT {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    pub(crate) fn queue(&self) -> &TaskQueue {
        &self.shared.queue
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{schedule_on, schedule_on_serial};
    use crate::task::Task;
    use parking_lot::Mutex as PlMutex;

    #[test]
    fn test_run_loop_starts_and_stops() {
        let run_loop = RunLoop::new();
        run_loop.stop();
        run_loop.stop(); // idempotent
    }

    #[test]
    fn test_scheduled_task_fires_after_delay() {
        let run_loop = RunLoop::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        schedule_on(
            &run_loop,
            Instant::now() + Duration::from_millis(50),
            Task::new(move || flag.store(true, Ordering::SeqCst)),
        );

        thread::sleep(Duration::from_millis(20));
        assert!(!fired.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(130));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_tasks_fire_in_dispatch_order() {
        let run_loop = RunLoop::new();
        let order = Arc::new(PlMutex::new(Vec::new()));
        let now = Instant::now();

        // Registered out of order; ties keep submission order.
        for (label, offset) in [(2, 80u64), (0, 40), (1, 80), (3, 120)] {
            let order = Arc::clone(&order);
            schedule_on(
                &run_loop,
                now + Duration::from_millis(offset),
                Task::new(move || order.lock().push(label)),
            );
        }

        thread::sleep(Duration::from_millis(250));
        assert_eq!(*order.lock(), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_past_instant_fires_on_next_wake() {
        let run_loop = RunLoop::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        schedule_on(
            &run_loop,
            Instant::now() - Duration::from_secs(1),
            Task::new(move || flag.store(true, Ordering::SeqCst)),
        );
        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_with_pending_task_is_clean() {
        let run_loop = RunLoop::new();
        schedule_on(
            &run_loop,
            Instant::now() + Duration::from_secs(60),
            Task::new(|| ()),
        );
        run_loop.stop();
    }

    #[test]
    fn test_serial_schedule_on_dead_queue_is_noop() {
        let run_loop = RunLoop::new();
        let queue = TaskQueue::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        schedule_on_serial(
            &run_loop,
            &queue,
            Instant::now() + Duration::from_millis(50),
            Task::new(move || flag.store(true, Ordering::SeqCst)),
        );
        drop(queue);

        thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_serial_schedule_runs_on_looper() {
        let run_loop = RunLoop::new();
        let queue = TaskQueue::new();
        let seen = Arc::new(PlMutex::new(None));

        let sink = Arc::clone(&seen);
        schedule_on_serial(
            &run_loop,
            &queue,
            Instant::now() + Duration::from_millis(30),
            Task::new(move || {
                *sink.lock() = thread::current().name().map(str::to_string);
            }),
        );

        thread::sleep(Duration::from_millis(150));
        assert_eq!(seen.lock().as_deref(), Some("strand-runloop"));
    }
}
