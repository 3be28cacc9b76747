use crate::{log_debug, log_info};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Counts detached task executions so shutdown can wait for them.
///
/// Owned by the top-level orchestrator and handed to whatever dispatches
/// concurrent work. Cloning shares the same count.
#[derive(Clone, Default)]
pub struct WorkCounter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: Mutex<usize>,
    idle: Notify,
}

impl Inner {
    /// A poisoned count is still valid; only whole updates happen under the lock.
    fn count(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WorkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of outstanding work. It is released when the guard drops.
    pub fn register(&self) -> WorkGuard {
        let mut count = self.inner.count();
        *count += 1;
        log_debug!("outstanding work: {}", *count);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.inner.count()
    }

    /// Wait until no registered work remains.
    pub async fn wait_idle(&self) {
        log_info!("Waiting for outstanding tasks to finish...");
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a release in between is not missed.
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                break;
            }
            notified.await;
        }
        log_info!("All outstanding tasks are finished.");
    }

    /// Like `wait_idle`, giving up after `timeout`. Returns whether quiescence was reached.
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let mut count = self.inner.count();
        *count -= 1;
        if *count == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_idle_when_nothing_registered() {
        let counter = WorkCounter::new();
        assert!(counter.wait_idle_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_waits_for_all_guards() {
        let counter = WorkCounter::new();
        let first = counter.register();
        let second = counter.register();
        assert_eq!(counter.outstanding(), 2);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_idle().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(counter.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_release_after_poisoned_lock() {
        let counter = WorkCounter::new();
        let guard = counter.register();

        let inner = counter.inner.clone();
        let _ = std::thread::spawn(move || {
            let _held = inner.count.lock().unwrap();
            panic!("worker panicked while holding the count");
        })
        .join();
        assert!(counter.inner.count.is_poisoned());

        drop(guard);
        assert_eq!(counter.outstanding(), 0);
        assert!(counter.wait_idle_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_timeout_while_busy() {
        let counter = WorkCounter::new();
        let _guard = counter.register();
        assert!(!counter.wait_idle_timeout(Duration::from_millis(20)).await);
    }
}
