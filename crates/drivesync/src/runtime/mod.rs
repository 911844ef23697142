//! Blocking concurrency primitives used across the engine
//!
//! - Request coalescing for in-flight work keyed by identity
//! - A counting semaphore for outbound admission control
//! - Owned background tasks with explicit cancellation
//! - Retry policies with a configurable backoff schedule

mod coalesce;
mod retry;
mod semaphore;
mod task;

pub use coalesce::Coalescer;
pub use retry::{Backoff, RetryPolicy};
pub use semaphore::{Permit, Semaphore};
pub use task::BackgroundTask;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
