//! A small bounded worker pool with per-item retries.

use std::{collections::VecDeque, future::Future, sync::Arc};

use anyhow::anyhow;
use tokio::{sync::Mutex, task::JoinSet};

/// How many times each item is attempted before it is given up on.
pub const MAX_ATTEMPTS: usize = 3;

/// The result of running the task on one item.
#[derive(Debug)]
pub enum TaskOutcome<I, R> {
    Done(R),
    /// Every attempt failed.  Carries the item back together with the last error seen.
    Failed { item: I, error: anyhow::Error },
}

impl<I, R> TaskOutcome<I, R> {
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    pub fn done(self) -> Option<R> {
        match self {
            TaskOutcome::Done(result) => Some(result),
            TaskOutcome::Failed { .. } => None,
        }
    }
}

async fn attempt<I, R, F, Fut>(task: &F, item: I) -> TaskOutcome<I, R>
where
    I: Clone,
    R: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let mut last_error = anyhow!("never attempted");

    for n in 1..=MAX_ATTEMPTS {
        // Each attempt runs as its own task so that a panic counts as a failed attempt instead of
        // taking the worker (and the rest of its queue) down with it.  The set aborts the attempt
        // if the worker is dropped while it runs.
        let mut running = JoinSet::new();
        running.spawn(task(item.clone()));
        let error = match running.join_next().await {
            Some(Ok(Ok(result))) => return TaskOutcome::Done(result),
            Some(Ok(Err(error))) => error,
            Some(Err(join_error)) => anyhow!(join_error),
            None => anyhow!("attempt was never started"),
        };
        log::warn!("attempt {n}/{MAX_ATTEMPTS} failed: {error:#}");
        last_error = error;
    }

    TaskOutcome::Failed {
        item,
        error: last_error,
    }
}

/// Runs `task` on every item using `concurrency` workers pulling from a shared queue.
///
/// Each item is attempted up to [`MAX_ATTEMPTS`] times.  Failures never abort the pool: an item
/// whose attempts are exhausted is reported as [`TaskOutcome::Failed`] and the workers carry on
/// with the remaining items.
///
/// The returned outcomes are in completion order, not in the order of `items`.
pub async fn run<I, R, F, Fut>(
    concurrency: usize,
    items: impl IntoIterator<Item = I>,
    task: F,
) -> Vec<TaskOutcome<I, R>>
where
    I: Clone + Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    let queue = Arc::new(Mutex::new(items.into_iter().collect::<VecDeque<I>>()));
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let task = Arc::new(task);

    let mut workers = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let queue = Arc::clone(&queue);
        let outcomes = Arc::clone(&outcomes);
        let task = Arc::clone(&task);

        workers.spawn(async move {
            loop {
                // don't hold the queue lock while the task runs
                let Some(item) = queue.lock().await.pop_front() else {
                    break;
                };
                let outcome = attempt(task.as_ref(), item).await;
                outcomes.lock().await.push(outcome);
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            log::error!("worker pool task stopped unexpectedly: {e}");
        }
    }

    let outcomes = std::mem::take(&mut *outcomes.lock().await);
    outcomes
}
