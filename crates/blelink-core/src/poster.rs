//! Execution contexts for observer and callback delivery.
//!
//! A [`Poster`] routes a unit of work to one of three contexts:
//!
//! - [`ExecutionContext::Caller`] runs it immediately on the posting task
//! - [`ExecutionContext::Main`] serializes it onto a single host-supplied executor
//! - [`ExecutionContext::Background`] hands it to a fixed pool of workers
//!
//! Background jobs are pinned to a worker by an affinity key, so jobs posted
//! with the same key (one observer, or one connection's callbacks) run in
//! submission order while different keys proceed in parallel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// A unit of work handed to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// Synchronously, on the task that produced the event.
    Caller,
    /// On the single main executor.
    #[default]
    Main,
    /// On the background pool.
    Background,
}

/// The host's single-threaded event loop.
///
/// Implementations must run jobs one at a time in submission order.
pub trait MainExecutor: Send + Sync {
    /// Queue `job` for execution.
    fn execute(&self, job: Job);
}

/// Default [`MainExecutor`]: one tokio task draining a queue.
#[derive(Debug, Clone)]
pub struct SerialExecutor {
    jobs: mpsc::UnboundedSender<Job>,
}

impl SerialExecutor {
    /// Spawn the draining task on `handle`.
    #[must_use]
    pub fn spawn(handle: &Handle, name: &'static str) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        handle.spawn(drain(rx, name));
        Self { jobs }
    }
}

impl MainExecutor for SerialExecutor {
    fn execute(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            warn!("serial executor is gone, running job inline");
            run_guarded(job, "inline");
        }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Job>, name: &'static str) {
    while let Some(job) = rx.recv().await {
        run_guarded(job, name);
    }
}

fn run_guarded(job: Job, context: &str) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(context, "observer callback panicked");
    }
}

/// Routes jobs to execution contexts.
pub struct Poster {
    main: Arc<dyn MainExecutor>,
    workers: Vec<SerialExecutor>,
    default_context: ExecutionContext,
}

impl Poster {
    /// Create a poster with `workers` background workers spawned on `handle`.
    #[must_use]
    pub fn new(
        handle: &Handle,
        main: Arc<dyn MainExecutor>,
        workers: usize,
        default_context: ExecutionContext,
    ) -> Self {
        let workers = (0..workers.max(1))
            .map(|_| SerialExecutor::spawn(handle, "background"))
            .collect();
        Self {
            main,
            workers,
            default_context,
        }
    }

    /// Context used when neither the event nor the observer chooses one.
    #[must_use]
    pub const fn default_context(&self) -> ExecutionContext {
        self.default_context
    }

    /// Run `job` on `context`, or the default context if `None`.
    pub fn post(&self, context: Option<ExecutionContext>, affinity: u64, job: Job) {
        match context.unwrap_or(self.default_context) {
            ExecutionContext::Caller => run_guarded(job, "caller"),
            ExecutionContext::Main => self.main.execute(job),
            ExecutionContext::Background => {
                let index = usize::try_from(affinity % self.workers.len() as u64).unwrap_or(0);
                self.workers[index].execute(job);
            }
        }
    }
}

impl std::fmt::Debug for Poster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poster")
            .field("workers", &self.workers.len())
            .field("default_context", &self.default_context)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |n: u32| -> Job {
            let sink = sink.clone();
            Box::new(move || sink.lock().push(n))
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_caller_context_runs_inline() {
        let handle = Handle::current();
        let main = Arc::new(SerialExecutor::spawn(&handle, "main"));
        let poster = Poster::new(&handle, main, 2, ExecutionContext::Caller);
        let (log, job) = recorder();

        poster.post(None, 0, job(1));
        poster.post(Some(ExecutionContext::Caller), 0, job(2));

        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_main_context_preserves_order() {
        let handle = Handle::current();
        let main = Arc::new(SerialExecutor::spawn(&handle, "main"));
        let poster = Poster::new(&handle, main, 2, ExecutionContext::Main);
        let (log, job) = recorder();

        for n in 0..50 {
            poster.post(None, u64::from(n), job(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_background_same_affinity_preserves_order() {
        let handle = Handle::current();
        let main = Arc::new(SerialExecutor::spawn(&handle, "main"));
        let poster = Poster::new(&handle, main, 4, ExecutionContext::Background);
        let (log, job) = recorder();

        for n in 0..50 {
            poster.post(None, 7, job(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let handle = Handle::current();
        let main = Arc::new(SerialExecutor::spawn(&handle, "main"));
        let poster = Poster::new(&handle, main, 1, ExecutionContext::Background);
        let (log, job) = recorder();

        poster.post(None, 0, Box::new(|| panic!("observer bug")));
        poster.post(None, 0, job(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_execution_context_serde() {
        let json = serde_json::to_string(&ExecutionContext::Background).unwrap();
        assert_eq!(json, "\"background\"");
        let parsed: ExecutionContext = serde_json::from_str("\"caller\"").unwrap();
        assert_eq!(parsed, ExecutionContext::Caller);
    }
}
