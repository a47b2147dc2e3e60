//! Fail-fast worker pool
//!
//! One tokio task per worker. The first task to fail aborts every sibling
//! and its error becomes the run's error; there is no partial continuation.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::error;

use crate::errors::{Error, Result};

pub struct WorkerPool<T> {
    tasks: JoinSet<Result<T>>,
}

impl<T: Send + 'static> Default for WorkerPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task, aborting the rest on the first failure
    pub async fn join(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok(Ok(value)) => {
                    results.push(value);
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join_err) => Error::Internal(format!("worker task failed: {}", join_err)),
            };
            error!(code = err.code(), error = %err, "Worker failed, stopping all workers");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            return Err(err);
        }
        Ok(results)
    }
}
