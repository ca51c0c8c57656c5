//! Worker pool dispatching upload tasks.
//!
//! The queue is shuffled once before dispatch: alphabetical task order puts
//! sibling images next to each other and makes every worker fight for the
//! same base-layer leases. Randomizing the order spreads the contention.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;

use crate::copier::Copier;
use crate::task::{TaskResult, UploadTask};

/// Worker cap for single-process runs.
const MAX_WORKERS: usize = 8;
const MIN_WORKERS: usize = 2;

/// Fixed worker count when a cross-process lock coordinates several
/// mirroring processes; more buys no throughput and costs RAM.
const MULTI_PROCESS_WORKERS: usize = 4;

/// Default worker count: half the CPUs, clamped to [2, 8].
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS);
    (cpus / 2).clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Dispatches `(Copier, UploadTask)` work across async workers.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// `workers` overrides the CPU-based default; `multi_process` selects
    /// the fixed cross-process worker count instead.
    pub fn new(workers: Option<usize>, multi_process: bool) -> Self {
        let workers = match (workers, multi_process) {
            (Some(n), _) => n,
            (None, true) => MULTI_PROCESS_WORKERS,
            (None, false) => default_worker_count(),
        };
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task to completion and collect per-task results. A
    /// cancellation signal stops workers from dequeuing; tasks still queued
    /// at that point come back failed as cancelled.
    pub async fn run(
        &self,
        copier: Arc<Copier>,
        mut tasks: Vec<UploadTask>,
        cancel: watch::Receiver<bool>,
    ) -> Vec<TaskResult> {
        tasks.shuffle(&mut rand::thread_rng());
        let total = tasks.len();
        let queue = Arc::new(Mutex::new(tasks.into_iter().collect::<VecDeque<_>>()));
        let results = Arc::new(Mutex::new(Vec::with_capacity(total)));

        tracing::info!(workers = self.workers, tasks = total, "Dispatching task queue");

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let copier = Arc::clone(&copier);
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if *cancel.borrow() {
                        tracing::debug!(worker, "Cancellation observed; worker stops dequeuing");
                        return;
                    }
                    let task = match queue.lock().pop_front() {
                        Some(task) => task,
                        None => return,
                    };
                    let result = copier.run(&task).await;
                    results.lock().push(result);
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        // Tasks never dequeued (cancellation) are reported, not dropped.
        let mut collected = match Arc::try_unwrap(results) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => shared.lock().clone(),
        };
        for task in queue.lock().drain(..) {
            collected.push(TaskResult::failed(
                task,
                &ferry_core::error::FerryError::Cancelled,
            ));
        }
        collected
    }
}
