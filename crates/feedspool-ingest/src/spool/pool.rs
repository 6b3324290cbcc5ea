//! Bounded worker pool that runs spool processors in parallel.
//!
//! Every task runs under `catch_unwind`, so a panicking processor is reported
//! as that processor's failure and the worker thread keeps serving.

use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One unit of work submitted to [`ProcessorPool::run_all`].
pub struct ProcessorTask {
    pub processor: &'static str,
    pub run: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
}

impl ProcessorTask {
    pub fn new<F>(processor: &'static str, run: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            processor,
            run: Box::new(run),
        }
    }
}

/// Fixed set of named worker threads fed from a shared queue.
pub struct ProcessorPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ProcessorPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self> {
        let size = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("spool-processor-{index}"))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| Error::Spool(format!("failed to spawn processor thread: {e}")))?;
            workers.push(handle);
        }

        info!("Processor pool started with {} threads", size);
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run every task in parallel and wait for all of them.
    ///
    /// Results are in task order. Errors and panics are reported per task;
    /// tasks submitted after [`shutdown`](Self::shutdown) fail immediately.
    pub fn run_all(&self, tasks: Vec<ProcessorTask>) -> Vec<Result<()>> {
        let mut pending = Vec::with_capacity(tasks.len());

        {
            let sender = self.sender.lock();
            for task in tasks {
                let (result_tx, result_rx) = crossbeam_channel::bounded(1);
                let processor = task.processor;
                let run = task.run;

                let job: Job = Box::new(move || {
                    let result = match catch_unwind(AssertUnwindSafe(run)) {
                        Ok(result) => result,
                        Err(panic) => Err(Error::Processor {
                            processor,
                            reason: format!("panicked: {}", panic_message(panic.as_ref())),
                        }),
                    };
                    let _ = result_tx.send(result);
                });

                let submitted = sender.as_ref().is_some_and(|s| s.send(job).is_ok());
                pending.push((processor, submitted.then_some(result_rx)));
            }
        }

        pending
            .into_iter()
            .map(|(processor, receiver)| {
                let Some(receiver) = receiver else {
                    return Err(Error::Processor {
                        processor,
                        reason: "processor pool is shut down".to_string(),
                    });
                };
                receiver.recv().unwrap_or_else(|_| {
                    Err(Error::Processor {
                        processor,
                        reason: "task dropped before completion".to_string(),
                    })
                })
            })
            .collect()
    }

    /// Stop accepting work and wait up to `grace` for workers to finish.
    ///
    /// Returns `false` if workers were still busy when the grace period ran
    /// out; those threads are detached.
    pub fn shutdown(&self, grace: Duration) -> bool {
        drop(self.sender.lock().take());

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let deadline = Instant::now() + grace;

        while workers.iter().any(|w| !w.is_finished()) {
            if Instant::now() >= deadline {
                let busy = workers.iter().filter(|w| !w.is_finished()).count();
                warn!(
                    "Processor pool did not stop within {:?}, detaching {} busy threads",
                    grace, busy
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }

        for worker in workers {
            if worker.join().is_err() {
                warn!("Processor thread panicked");
            }
        }
        info!("Processor pool stopped");
        true
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    debug!(
        "{} waiting for work",
        thread::current().name().unwrap_or("spool-processor")
    );
    for job in receiver {
        job();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
