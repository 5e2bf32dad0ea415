use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Owns the background tasks of one component.
///
/// Timers live inside these tasks, so aborting them is what guarantees no
/// callback fires after teardown. Once closed, further spawns are refused.
#[derive(Debug, Default)]
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` onto the runtime. Returns `false` if the scheduler is closed.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.tasks.retain(|t| !t.is_finished());
        inner.tasks.push(tokio::spawn(fut));
        true
    }

    /// Run `fut` once `delay` has elapsed, unless cancelled first.
    pub fn spawn_after<F>(&self, delay: Duration, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        })
    }

    /// Abort every task spawned so far. The scheduler stays usable.
    pub fn cancel_all(&self) {
        let tasks = std::mem::take(&mut self.inner.lock().tasks);
        for task in tasks {
            task.abort();
        }
    }

    /// Abort everything and refuse further work.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.cancel_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn active(&self) -> usize {
        self.inner.lock().tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.inner.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delayed_callback() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        assert!(scheduler.spawn_after(Duration::from_secs(1), async move {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_callback_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        scheduler.spawn_after(Duration::from_millis(100), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_scheduler_refuses_work() {
        let scheduler = Scheduler::new();
        scheduler.close();
        assert!(scheduler.is_closed());
        assert!(!scheduler.spawn(async {}));
        assert_eq!(scheduler.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_tasks() {
        let fired = Arc::new(AtomicU32::new(0));
        {
            let scheduler = Scheduler::new();
            let f = fired.clone();
            scheduler.spawn_after(Duration::from_millis(10), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
