//! Owned background tasks
//!
//! A task runs on its own thread and is tied to the handle that spawned it:
//! `cancel()` (or dropping the handle) wakes the thread and stops it before
//! the next run. Cancellation never joins, so a task may safely cancel or
//! replace its own handle from inside its body.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use log::warn;

/// Handle to a delayed or periodic background thread
pub struct BackgroundTask {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `f` once after `delay`, unless cancelled first
    pub fn after<F>(name: impl Into<String>, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(delay) {
                    f();
                }
            });

        Self::from_spawn(name, stop, handle)
    }

    /// Run `f` every `interval` until cancelled
    pub fn every<F>(name: impl Into<String>, interval: Duration, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    f();
                }
            });

        Self::from_spawn(name, stop, handle)
    }

    fn from_spawn(
        name: String,
        stop: Sender<()>,
        handle: std::io::Result<JoinHandle<()>>,
    ) -> Self {
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("[TASK] Failed to spawn background task {}: {}", name, e);
                None
            }
        };

        Self {
            name,
            stop: Some(stop),
            handle,
        }
    }

    /// Task name, also used as the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the task before its next run
    pub fn cancel(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.stop.take();
    }

    /// Whether the task was cancelled through this handle
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_none()
    }

    /// Whether the thread has exited (ran to completion or was cancelled)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_after_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::after("once", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[test]
    fn test_cancel_before_delay_skips_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let mut task = BackgroundTask::after("cancelled", Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.cancel();
        assert!(task.is_cancelled());
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_every_repeats_until_dropped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::every("sweep", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(150));
        drop(task);
        let after_drop = runs.load(Ordering::SeqCst);
        assert!(after_drop >= 2);

        std::thread::sleep(Duration::from_millis(100));
        assert!(runs.load(Ordering::SeqCst) <= after_drop + 1);
    }
}
