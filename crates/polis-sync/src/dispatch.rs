//! Bounded worker pool: a shared queue drained by `workers` tasks.
//!
//! Every item is attempted at most once. A failing item is logged and
//! counted; it never aborts the batch. Once the deadline passes, workers stop
//! taking items and whatever is left is reported as skipped.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub label: String,
    pub workers: usize,
    /// Log progress every this many finished items; 0 disables it.
    pub progress_every: usize,
    pub deadline: Option<Instant>,
}

impl DispatchOptions {
    pub fn new(label: impl Into<String>, workers: usize) -> Self {
        Self {
            label: label.into(),
            workers,
            progress_every: 0,
            deadline: None,
        }
    }

    pub fn progress_every(mut self, every: usize) -> Self {
        self.progress_every = every;
        self
    }

    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub label: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Never attempted: the deadline passed or a worker died.
    pub skipped: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Default)]
struct Progress {
    succeeded: usize,
    failed: usize,
}

impl Progress {
    fn done(&self) -> usize {
        self.succeeded + self.failed
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Runs `handler` over `items` with up to `options.workers` concurrent tasks
/// and returns once every worker has exited.
pub async fn dispatch<T, D, F, Fut>(items: Vec<T>, options: &DispatchOptions, describe: D, handler: F) -> DispatchReport
where
    T: Send + 'static,
    D: Fn(&T) -> String + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let total = items.len();
    let label = options.label.clone();
    if total == 0 {
        return DispatchReport {
            label,
            ..Default::default()
        };
    }

    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let progress = Arc::new(Mutex::new(Progress::default()));
    let describe = Arc::new(describe);
    let handler = Arc::new(handler);
    let workers = options.workers.clamp(1, total);

    let mut set = JoinSet::new();
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let progress = Arc::clone(&progress);
        let describe = Arc::clone(&describe);
        let handler = Arc::clone(&handler);
        let label = label.clone();
        let deadline = options.deadline;
        let every = options.progress_every;

        set.spawn(async move {
            loop {
                if deadline_passed(deadline) {
                    break;
                }
                let Some(item) = queue.lock().await.pop_front() else {
                    break;
                };
                let what = describe(&item);
                let outcome = handler(item).await;

                let mut progress = progress.lock().await;
                match outcome {
                    Ok(()) => progress.succeeded += 1,
                    Err(err) => {
                        progress.failed += 1;
                        warn!(stage = %label, item = %what, error = %format!("{err:#}"), "item failed");
                    }
                }
                let done = progress.done();
                if every > 0 && done % every == 0 {
                    info!(stage = %label, done, total, failed = progress.failed, "progress");
                }
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            warn!(stage = %label, %err, "worker task ended abnormally");
        }
    }

    let progress = progress.lock().await;
    let remaining = queue.lock().await.len();
    if remaining > 0 {
        warn!(stage = %label, remaining, "deadline reached; remaining items skipped");
    }
    DispatchReport {
        label,
        total,
        succeeded: progress.succeeded,
        failed: progress.failed,
        skipped: total - progress.done(),
    }
}
