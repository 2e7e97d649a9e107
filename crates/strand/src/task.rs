//! Task structure and the run pipeline
//!
//! A [`Task`] is a bound unit of work: a callable captured together with its
//! arguments, an optional user continuation that observes the produced value,
//! and two internal hooks the queue machinery threads through every
//! execution. Queues hold tasks behind the crate-private [`AnyTask`] object
//! so callables of different result types share one container.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::Instant;

/// Internal continuation installed by the runtime around a task run.
pub(crate) type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling metadata exposed to queue sort predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMeta {
    /// Steady-clock instant at which the task becomes eligible to run.
    pub dispatch_time: Instant,
}

/// A single-run unit of work producing a value of type `R`.
///
/// The body and its continuation execute on whichever thread eventually runs
/// the task. Tasks move into the runtime on submission and are never copied.
pub struct Task<R> {
    func: Box<dyn FnOnce() -> R + Send>,
    after: Option<Box<dyn FnOnce(&R) + Send>>,

    // Set only by the runtime (queues, run_sync, schedule wrappers).
    before_internal: Option<Hook>,
    after_internal: Option<Hook>,

    /// When the task becomes eligible; defaults to construction time.
    dispatch_time: Instant,

    /// Liveness flag of the owning queue, if any. A revoked or expired token
    /// skips the body but never the internal after hook.
    token: Option<Weak<AtomicBool>>,
}

impl<R: 'static> Task<R> {
    /// Create a task from a callable. Arguments are bound by capture.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        Self {
            func: Box::new(func),
            after: None,
            before_internal: None,
            after_internal: None,
            dispatch_time: Instant::now(),
            token: None,
        }
    }

    /// Attach a continuation invoked with the produced value after the body
    /// returns, on the same thread that ran the body.
    pub fn after<F>(mut self, after: F) -> Self
    where
        F: FnOnce(&R) + Send + 'static,
    {
        self.after = Some(Box::new(after));
        self
    }

    /// Set the instant at which the task becomes eligible to run.
    pub fn at(mut self, when: Instant) -> Self {
        self.dispatch_time = when;
        self
    }

    /// Run the task on the calling thread and return the produced value.
    ///
    /// Returns `None` when the liveness token was revoked before the body
    /// ran. Panics from the callable propagate to the caller on this path.
    pub fn run(mut self) -> Option<R> {
        if let Some(hook) = self.before_internal.take() {
            hook();
        }
        let result = if token_allows(&self.token) {
            let value = (self.func)();
            if let Some(after) = self.after.take() {
                after(&value);
            }
            Some(value)
        } else {
            None
        };
        if let Some(hook) = self.after_internal.take() {
            hook();
        }
        result
    }
}

/// `true` when the task may run its body: either it carries no token, or the
/// owning queue is still alive and has not revoked it.
fn token_allows(token: &Option<Weak<AtomicBool>>) -> bool {
    match token {
        None => true,
        Some(token) => token
            .upgrade()
            .map_or(false, |flag| flag.load(Ordering::Acquire)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

// ============================================================================
// Type-erased task object
// ============================================================================

/// Object-safe view of a task held by a queue.
///
/// `run_v` consumes the task; the internal after hook runs on every exit
/// path, including a revoked token and a panicking body, so queue
/// bookkeeping always completes.
pub(crate) trait AnyTask: Send {
    /// Execute the full pipeline: before hook, gated body plus user
    /// continuation, after hook.
    fn run_v(self: Box<Self>);

    /// Instant at which the task becomes eligible to run.
    fn dispatch_time(&self) -> Instant;

    /// Re-stamp the eligibility instant.
    fn set_dispatch_time(&mut self, when: Instant);

    /// Bind the task to a queue's liveness token.
    fn stamp_token(&mut self, token: Weak<AtomicBool>);

    /// Whether a liveness token has been stamped.
    fn has_token(&self) -> bool;

    /// Install the hook that runs before the body.
    fn set_before_internal(&mut self, hook: Hook);

    /// Install the hook that runs after the body and the user continuation.
    fn set_after_internal(&mut self, hook: Hook);

    /// Detach the current after hook so a wrapper can chain it.
    fn take_after_internal(&mut self) -> Option<Hook>;
}

impl<R: 'static> AnyTask for Task<R> {
    fn run_v(self: Box<Self>) {
        let Task {
            func,
            after,
            before_internal,
            after_internal,
            token,
            dispatch_time: _,
        } = *self;

        if let Some(hook) = before_internal {
            hook();
        }
        if token_allows(&token) {
            // User code runs contained so a panicking body cannot strand the
            // serial chain behind a never-released baton.
            let body = catch_unwind(AssertUnwindSafe(move || {
                let value = func();
                if let Some(after) = after {
                    after(&value);
                }
            }));
            if let Err(panic) = body {
                eprintln!("strand: task body panicked: {}", panic_message(panic.as_ref()));
            }
        }
        if let Some(hook) = after_internal {
            hook();
        }
    }

    fn dispatch_time(&self) -> Instant {
        self.dispatch_time
    }

    fn set_dispatch_time(&mut self, when: Instant) {
        self.dispatch_time = when;
    }

    fn stamp_token(&mut self, token: Weak<AtomicBool>) {
        self.token = Some(token);
    }

    fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn set_before_internal(&mut self, hook: Hook) {
        self.before_internal = Some(hook);
    }

    fn set_after_internal(&mut self, hook: Hook) {
        self.after_internal = Some(hook);
    }

    fn take_after_internal(&mut self) -> Option<Hook> {
        self.after_internal.take()
    }
}
