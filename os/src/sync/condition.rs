//! Blocking primitive supplied by the thread layer

/// A condition variable without an associated lock.
///
/// Single-hart kernels guard the predicate by disabling interrupts instead:
/// callers test it with interrupts off and `wait` lets interrupts in while
/// the thread sleeps, returning with them off again. Spurious wakeups are
/// allowed, so the predicate must be rechecked in a loop.
pub trait Condition {
    fn wait(&self);
    /// Wakes every waiter. Callable from interrupt context.
    fn broadcast(&self);
}
