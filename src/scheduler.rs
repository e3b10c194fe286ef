//! Concurrent task scheduling
//!
//! All tasks of a run share one browser connection and one cancellation
//! token. A semaphore bounds how many tasks hold a tab at once; retries of
//! a task run back-to-back inside its permit, so a flaky page never gives
//! up its slot to get back in line. The first fatal or hard-fail error
//! cancels everything still pending.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::browser::engine::BrowserEngine;
use crate::error::{PageError, RunError, TaskError};
use crate::options::PageOptions;
use crate::reporter::{NullReporter, Reporter};
use crate::task::{run_task, TaskEnv, TaskResult};

/// One unit of work for the scheduler.
pub struct PageTask {
    pub location: String,
    pub options: PageOptions,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Successful tasks, in submission order
    pub results: Vec<TaskResult>,
    /// Tasks that exhausted their attempts
    pub failures: Vec<PageError>,
    /// Set when the run was aborted early
    pub error: Option<RunError>,
}

impl RunOutcome {
    /// Whether every submitted task produced its output.
    pub fn is_complete(&self, total: usize) -> bool {
        self.error.is_none() && self.results.len() == total
    }
}

/// How one task left the run.
enum Completion {
    Done(TaskResult),
    /// `None` when the task's error became the run's terminal error
    Failed(Option<PageError>),
    Cancelled,
}

/// Runs a worklist of tasks against a browser engine.
pub struct Scheduler {
    engine: Arc<dyn BrowserEngine>,
    out_dir: PathBuf,
    base_url: Option<Url>,
    max_concurrent: Option<usize>,
    reporter: Arc<dyn Reporter>,
}

impl Scheduler {
    pub fn new(engine: Arc<dyn BrowserEngine>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            out_dir: out_dir.into(),
            base_url: None,
            max_concurrent: None,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Base URL that relative locations resolve against.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Bound on tasks holding a tab at once. `None` means unbounded.
    pub fn with_max_concurrent(mut self, max_concurrent: Option<usize>) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Run all tasks to completion or until the run aborts.
    ///
    /// Every task is attempted up to `max_retries + 1` times. A fatal error
    /// or an exhausted `throw_on_fail` task cancels all tasks that have not
    /// finished; cancelled tasks are neither successes nor failures.
    pub async fn run(&self, tasks: Vec<PageTask>) -> RunOutcome {
        let total = tasks.len();
        let run_start = Instant::now();
        let cancel = CancellationToken::new();
        let env = TaskEnv {
            engine: Arc::clone(&self.engine),
            out_dir: self.out_dir.clone(),
            base_url: self.base_url.clone(),
            cancel: cancel.clone(),
        };
        // a zero bound would never hand out a permit; treat it as one
        let semaphore = Arc::new(Semaphore::new(
            self.max_concurrent
                .map(|c| c.max(1))
                .unwrap_or(Semaphore::MAX_PERMITS),
        ));
        let completed = Arc::new(AtomicUsize::new(0));
        let run_error: Arc<Mutex<Option<RunError>>> = Arc::new(Mutex::new(None));

        let mut set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let env = env.clone();
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let run_error = Arc::clone(&run_error);
            let reporter = Arc::clone(&self.reporter);
            let cancel = cancel.clone();
            set.spawn(async move {
                let completion = execute(
                    task, &env, semaphore, cancel, run_error, reporter, &completed, total,
                )
                .await;
                (index, completion)
            });
        }

        let mut slots: Vec<Option<Completion>> = Vec::new();
        slots.resize_with(total, || None);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, completion)) => slots[index] = Some(completion),
                Err(err) => warn!("task aborted unexpectedly: {}", err),
            }
        }

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for slot in slots.into_iter().flatten() {
            match slot {
                Completion::Done(result) => results.push(result),
                Completion::Failed(Some(err)) => failures.push(err),
                Completion::Failed(None) | Completion::Cancelled => {}
            }
        }

        self.reporter
            .run_finished(results.len(), total, run_start.elapsed());

        let error = run_error.lock().take();
        RunOutcome {
            results,
            failures,
            error,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    task: PageTask,
    env: &TaskEnv,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    run_error: Arc<Mutex<Option<RunError>>>,
    reporter: Arc<dyn Reporter>,
    completed: &AtomicUsize,
    total: usize,
) -> Completion {
    // waiting for a slot is interruptible; a cancelled run must not keep
    // opening tabs
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return Completion::Cancelled,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Completion::Cancelled,
        },
    };

    let max_attempts = task.options.max_retries + 1;
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Completion::Cancelled;
        }
        reporter.attempt_started(&task.location, attempt, max_attempts);
        let start = Instant::now();
        match run_task(&task.location, &task.options, env).await {
            Ok(result) => {
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                reporter.task_succeeded(&result, attempt, start.elapsed(), done, total);
                return Completion::Done(result);
            }
            Err(TaskError::Page(err)) => {
                let will_retry = attempt < max_attempts;
                reporter.task_failed(&err, attempt, max_attempts, start.elapsed(), will_retry);
                if will_retry {
                    attempt += 1;
                    continue;
                }
                if task.options.throw_on_fail {
                    cancel.cancel();
                    let mut slot = run_error.lock();
                    if slot.is_none() {
                        *slot = Some(RunError::HardFail(err));
                        return Completion::Failed(None);
                    }
                }
                return Completion::Failed(Some(err));
            }
            Err(TaskError::Fatal(fatal)) => {
                cancel.cancel();
                let mut slot = run_error.lock();
                if slot.is_none() {
                    *slot = Some(RunError::Fatal(fatal));
                }
                return Completion::Failed(None);
            }
            Err(TaskError::Cancelled) => return Completion::Cancelled,
        }
    }
}
