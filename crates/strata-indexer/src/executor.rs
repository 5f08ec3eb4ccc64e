use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("batch handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("worker task panicked: {0}")]
    WorkerPanicked(String),
}

type WorkerHandle = JoinHandle<Result<(), ExecutorError>>;

/// Runs a handler over fixed-size batches of work items on a bounded pool of
/// tokio worker tasks fed from an async-channel queue.
///
/// Batches are dispatched in order. With `max_workers == 1` they also run in
/// order; otherwise they may complete in any order. The first handler error
/// stops dispatch, lets in-flight batches finish, and is then returned.
pub struct BatchWorkExecutor {
    batch_size: usize,
    max_workers: usize,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl BatchWorkExecutor {
    pub fn new(batch_size: usize, max_workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Invoke `handler` once per batch of `items`. `total_items` is only used
    /// for progress logging and defaults to `items.len()`.
    pub async fn execute<T, F, Fut>(
        &self,
        items: Vec<T>,
        handler: F,
        total_items: Option<usize>,
    ) -> Result<(), ExecutorError>
    where
        T: Send + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if items.is_empty() {
            return Ok(());
        }
        let total = total_items.unwrap_or(items.len());
        let handler = Arc::new(handler);
        let failed = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicUsize::new(0));

        let mut batches = Vec::with_capacity(items.len().div_ceil(self.batch_size));
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            batches.push(items.by_ref().take(self.batch_size).collect::<Vec<T>>());
        }
        let num_workers = self.max_workers.min(batches.len());

        let (work_tx, work_rx) = async_channel::bounded::<Vec<T>>(num_workers);

        {
            let mut workers = self.lock_workers();
            for worker_id in 0..num_workers {
                let work_rx = work_rx.clone();
                let handler = Arc::clone(&handler);
                let failed = Arc::clone(&failed);
                let processed = Arc::clone(&processed);

                workers.push(tokio::spawn(async move {
                    while let Ok(batch) = work_rx.recv().await {
                        if failed.load(Ordering::SeqCst) {
                            continue;
                        }
                        let len = batch.len();
                        // Run the batch as its own task so a panic fails the run like an error
                        let outcome = match tokio::spawn(handler(batch)).await {
                            Ok(Ok(())) => None,
                            Ok(Err(e)) => Some(ExecutorError::Handler(e)),
                            Err(e) => Some(ExecutorError::WorkerPanicked(e.to_string())),
                        };
                        if let Some(e) = outcome {
                            tracing::debug!("Worker {} batch failed: {}", worker_id, e);
                            failed.store(true, Ordering::SeqCst);
                            work_rx.close();
                            return Err(e);
                        }
                        let done = processed.fetch_add(len, Ordering::SeqCst) + len;
                        tracing::debug!("Progress: {}/{} items", done, total);
                    }
                    Ok(())
                }));
            }
        }
        drop(work_rx);

        for batch in batches {
            if failed.load(Ordering::SeqCst) || work_tx.send(batch).await.is_err() {
                break;
            }
        }
        drop(work_tx);

        let handles: Vec<WorkerHandle> = self.lock_workers().drain(..).collect();
        let result = join_workers(handles).await;

        match &result {
            Ok(()) => tracing::debug!("Executed {} items in batches of {}", total, self.batch_size),
            Err(e) => tracing::warn!(
                "Batch execution aborted after {}/{} items: {}",
                processed.load(Ordering::SeqCst),
                total,
                e
            ),
        }
        result
    }

    /// Wait for any workers left behind by a cancelled `execute`.
    pub async fn shutdown(self) -> Result<(), ExecutorError> {
        let handles = match self.workers.into_inner() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        join_workers(handles).await
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Await every handle, keeping the first failure.
async fn join_workers(handles: Vec<WorkerHandle>) -> Result<(), ExecutorError> {
    let mut first_error = None;
    for handle in handles {
        let outcome = match handle.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(e) => ExecutorError::WorkerPanicked(e.to_string()),
        };
        if first_error.is_none() {
            first_error = Some(outcome);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
