//! Deferred work executor
//!
//! A bounded worker pool (`rust_box::task_exec_queue`) shared by everything the broker
//! wants to run off the connection tasks: connect / disconnect notifications and delayed
//! jobs. Every task is isolated, a panic inside one is caught and logged and never reaches
//! the workers or the other queued tasks.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use rust_box::task_exec_queue::{Builder, SpawnExt, TaskExecQueue};
use tokio::task::JoinHandle;

use crate::net::panic_message;
use crate::Result;

pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_MAX: usize = 100_000;

pub struct TaskExecutor {
    exec: TaskExecQueue,
    runner: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl TaskExecutor {
    /// Must be called inside a tokio runtime.
    pub fn new(workers: usize, queue_max: usize) -> Self {
        let (exec, task_runner) = Builder::default().workers(workers).queue_max(queue_max).build();

        let runner = tokio::spawn(async move {
            task_runner.await;
        });

        Self { exec, runner: Mutex::new(Some(runner)), shutdown: AtomicBool::new(false) }
    }

    #[inline]
    fn isolate<F>(name: &'static str, task: F) -> impl Future<Output = ()> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        async move {
            if let Err(e) = AssertUnwindSafe(task).catch_unwind().await {
                log::error!("{} task panicked, {}", name, panic_message(e.as_ref()));
            }
        }
    }

    /// Queues `task`. Fails only when the executor is shut down or its queue is gone.
    pub async fn execute<F>(&self, name: &'static str, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(anyhow!("task executor is shut down, {} dropped", name));
        }
        Self::isolate(name, task).spawn(&self.exec).await.map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }

    /// Queues `task` once `delay` has elapsed.
    pub fn schedule<F>(&self, name: &'static str, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let exec = self.exec.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = Self::isolate(name, task).spawn(&exec).await {
                log::warn!("{} scheduled task dropped, {}", name, e.to_string());
            }
        })
    }

    #[inline]
    pub fn active_count(&self) -> isize {
        self.exec.active_count()
    }

    #[inline]
    pub fn waiting_count(&self) -> isize {
        self.exec.waiting_count()
    }

    #[inline]
    pub async fn completed_count(&self) -> isize {
        self.exec.completed_count().await
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks, gives queued ones up to `grace` to finish, then stops the workers.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = tokio::time::Instant::now() + grace;
        while (self.waiting_count() > 0 || self.active_count() > 0) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Some(runner) = self.runner.lock().take() {
            runner.abort();
        }
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_QUEUE_MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn panic_does_not_affect_other_tasks() {
        let exec = TaskExecutor::new(2, 100);
        let done = Arc::new(AtomicUsize::new(0));

        exec.execute("panics", async { panic!("listener bug") }).await.unwrap();
        for _ in 0..3 {
            let done = done.clone();
            exec.execute("counts", async move {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        wait_for(|| done.load(Ordering::SeqCst) == 3).await;
    }

    #[tokio::test]
    async fn schedule_runs_after_delay() {
        let exec = TaskExecutor::default();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        exec.schedule("delayed", Duration::from_millis(50), async move {
            d.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 0);
        wait_for(|| done.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn rejects_after_shutdown() {
        let exec = TaskExecutor::default();
        exec.shutdown(Duration::from_millis(100)).await;
        assert!(exec.is_shutdown());
        assert!(exec.execute("late", async {}).await.is_err());
        //idempotent
        exec.shutdown(Duration::from_millis(100)).await;
    }
}
