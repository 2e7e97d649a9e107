//! strand: an embeddable task runtime
//!
//! This crate runs opaque units of work on a fixed pool of worker threads
//! with three composable disciplines:
//! - **Parallel**: [`run`] hands a [`Task`] to any free worker.
//! - **Serial**: [`run_serial`] threads tasks through a named [`TaskQueue`]
//!   in strict FIFO order while the pool stays parallel elsewhere.
//! - **Delayed**: [`schedule`] dispatches at or after a steady-clock
//!   instant via a [`RunLoop`].
//!
//! Queues own a liveness token; dropping a queue revokes it, so tasks still
//! in flight skip their bodies instead of touching dead state, and teardown
//! waits out running work with a bounded drain. [`run_sync`] and the
//! blocking facade operations are the only guaranteed-complete paths.
//!
//! The [`global`] module adds a process-wide convenience: named serial
//! queues backed by one shared pool.
//!
//! # Example
//!
//! ```
//! use strand::{run_sync, Task, ThreadPool};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = ThreadPool::with_threads(2);
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&hits);
//! run_sync(&pool, Task::new(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }));
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod global;
mod pool;
mod queue;
mod run;
mod run_loop;
mod task;

pub use pool::ThreadPool;
pub use queue::{DetachedTask, TaskQueue};
pub use run::{
    run, run_local, run_serial, run_sync, run_sync_serial, schedule, schedule_on,
    schedule_on_serial, schedule_serial,
};
pub use run_loop::RunLoop;
pub use task::{Task, TaskMeta};
