use crate::engine::invocation::Invocation;

/// Scheduler hooks consumed by [`CallInstance::bind`](crate::engine::CallInstance::bind).
///
/// The binding engine decides *how* each invocation should run; the
/// dispatcher decides *where*. Implementations must not call back into the
/// same call instance while holding any lock of their own.
pub trait Dispatcher: Sync {
    /// Run the invocation to completion on the current thread, including
    /// whatever its result makes ready downstream.
    fn run_inline(&self, invocation: Invocation);

    /// Hand the invocation to a worker.
    fn spawn(&self, invocation: Invocation);

    /// True when the current thread is the external caller that started the
    /// execution, as opposed to a worker.
    fn is_calling_thread(&self) -> bool;
}
