//! Fire-once and recurring background tasks.
//!
//! Timing runs on a tokio runtime owned by the scheduler; task bodies are
//! synchronous and run on its blocking pool. Errors and panics are logged and
//! never stop a recurring task.

use crate::spool::pool::panic_message;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a scheduled task.
pub struct TaskHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop future runs. A run already in progress completes.
    pub fn cancel(&self) {
        debug!("Cancelling task {}", self.name);
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Runs tasks on a dedicated runtime.
pub struct TaskScheduler {
    runtime: Mutex<Option<Runtime>>,
}

impl TaskScheduler {
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("feedspool-scheduler")
            .enable_all()
            .build()?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
        })
    }

    fn spawn<F>(&self, name: &str, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| Error::Scheduler(format!("cannot schedule '{name}': scheduler is shut down")))?;

        Ok(TaskHandle {
            name: name.to_string(),
            handle: runtime.spawn(future),
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F>(&self, name: &str, delay: Duration, task: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let task_name = name.to_string();
        self.spawn(name, async move {
            tokio::time::sleep(delay).await;
            run_blocking(&task_name, task).await;
        })
    }

    /// Run `task` every `period`, first after one period.
    ///
    /// Runs never overlap; a slow run delays the next one.
    pub fn schedule_recurring<F>(&self, name: &str, period: Duration, task: F) -> Result<TaskHandle>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(Error::Scheduler(format!("task '{name}' needs a positive period")));
        }

        let task = Arc::new(task);
        let task_name = name.to_string();
        info!("Scheduling {} every {:?}", name, period);

        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                let task = task.clone();
                run_blocking(&task_name, move || task()).await;
            }
        })
    }

    /// Stop the runtime, waiting up to `grace` for running tasks.
    pub fn shutdown(&self, grace: Duration) {
        if let Some(runtime) = self.runtime.lock().take() {
            info!("Shutting down scheduler");
            runtime.shutdown_timeout(grace);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

async fn run_blocking<F>(name: &str, task: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(task))).await;

    match outcome {
        Ok(Ok(Ok(()))) => debug!("Task {} completed", name),
        Ok(Ok(Err(e))) => warn!("Task {} failed: {}", name, e),
        Ok(Err(panic)) => warn!("Task {} panicked: {}", name, panic_message(panic.as_ref())),
        Err(e) => warn!("Task {} did not complete: {}", name, e),
    }
}
