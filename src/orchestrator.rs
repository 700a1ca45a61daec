// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded async worker pool for model inference.
//!
//! Inference is CPU/GPU-bound, so request-layer concurrency is funneled
//! into at most `worker_count` concurrently executing backend calls. Two
//! semaphores do the bounding: a worker semaphore sized `N` gates
//! execution, and an admission semaphore sized `N + queue_bound` caps
//! running-plus-queued work. When admission is exhausted, submissions
//! fail fast with [`GateError::ServiceBusy`] instead of growing memory.
//!
//! Work runs on spawned tasks. A caller that stops awaiting (dropping a
//! timeout, for instance) abandons its result, but the task itself runs
//! to completion and releases its permits; nothing leaks.
//!
//! The pool also owns lazy one-time backend initialization: an async
//! mutex plus a completion flag, re-checked after the lock is acquired,
//! so concurrent first requests load the model exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GateError;

/// Admitted work waiting on its spawned task.
struct Ticket<T> {
    handle: JoinHandle<Result<T, GateError>>,
}

/// Counters exposed in the metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub queue_bound: usize,
    pub active: usize,
    /// Highest concurrent execution observed over the pool's lifetime.
    pub peak_active: usize,
    pub queued: usize,
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
}

pub struct WorkerPool {
    worker_count: usize,
    queue_bound: usize,
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: Arc<AtomicU64>,
    init_done: AtomicBool,
    init_lock: Mutex<()>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(worker_count: usize, queue_bound: usize) -> Self {
        let worker_count = worker_count.max(1);
        info!(worker_count, queue_bound, "Worker pool created");
        Self {
            worker_count,
            queue_bound,
            workers: Arc::new(Semaphore::new(worker_count)),
            admission: Arc::new(Semaphore::new(worker_count + queue_bound)),
            active: Arc::new(AtomicUsize::new(0)),
            peak_active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
            init_done: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Run one operation through the pool, waiting for its result.
    pub async fn run<Fut, T>(&self, work: Fut) -> Result<T, GateError>
    where
        Fut: Future<Output = Result<T, GateError>> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = self.submit(work)?;
        self.collect(ticket).await
    }

    /// Run a batch concurrently, bounded by the same pool.
    ///
    /// Returns one result per input, in input order. A failing item (or
    /// one rejected at admission) becomes its slot's error; the rest of
    /// the batch is unaffected.
    pub async fn run_batch<Fut, T>(
        &self,
        work: impl IntoIterator<Item = Fut>,
    ) -> Vec<Result<T, GateError>>
    where
        Fut: Future<Output = Result<T, GateError>> + Send + 'static,
        T: Send + 'static,
    {
        // Submit everything up front so admitted items run concurrently
        let tickets: Vec<Result<Ticket<T>, GateError>> =
            work.into_iter().map(|fut| self.submit(fut)).collect();

        let mut results = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            match ticket {
                Ok(ticket) => results.push(self.collect(ticket).await),
                Err(err) => results.push(Err(err)),
            }
        }
        results
    }

    /// Admit work and spawn it. Fails fast when the queue is full.
    fn submit<Fut, T>(&self, work: Fut) -> Result<Ticket<T>, GateError>
    where
        Fut: Future<Output = Result<T, GateError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_pool_rejection();
                warn!(
                    queue_bound = self.queue_bound,
                    "Worker pool saturated, rejecting submission"
                );
                return Err(GateError::ServiceBusy);
            }
            Err(TryAcquireError::Closed) => return Err(GateError::Internal),
        };

        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.queued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_pool_queued(self.queued.load(Ordering::Relaxed));

        let workers = self.workers.clone();
        let active = self.active.clone();
        let peak_active = self.peak_active.clone();
        let queued = self.queued.clone();
        let completed = self.completed.clone();

        let handle = tokio::spawn(async move {
            // Holds the admission slot for the task's whole lifetime
            let _admission = permit;
            let Ok(_worker) = workers.acquire_owned().await else {
                return Err(GateError::Internal);
            };

            queued.fetch_sub(1, Ordering::Relaxed);
            let now_active = active.fetch_add(1, Ordering::Relaxed) + 1;
            peak_active.fetch_max(now_active, Ordering::Relaxed);
            crate::metrics::set_pool_active(now_active);
            crate::metrics::set_pool_queued(queued.load(Ordering::Relaxed));

            let result = work.await;

            let now_active = active.fetch_sub(1, Ordering::Relaxed) - 1;
            crate::metrics::set_pool_active(now_active);
            completed.fetch_add(1, Ordering::Relaxed);
            result
        });

        Ok(Ticket { handle })
    }

    async fn collect<T>(&self, ticket: Ticket<T>) -> Result<T, GateError> {
        match ticket.handle.await {
            Ok(result) => result,
            Err(join_err) => {
                warn!(error = %join_err, "Pool task failed to complete");
                Err(GateError::Internal)
            }
        }
    }

    /// Run `init` exactly once across all concurrent callers.
    ///
    /// The flag is checked before and after taking the lock; losers of the
    /// race find it set and return immediately. A failed initialization
    /// leaves the flag clear so the next caller retries.
    pub async fn initialize_once<F, Fut>(&self, init: F) -> Result<(), GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), GateError>>,
    {
        if self.init_done.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.init_done.load(Ordering::Acquire) {
            debug!("Initialization already completed by a concurrent caller");
            return Ok(());
        }
        init().await?;
        self.init_done.store(true, Ordering::Release);
        info!("One-time initialization complete");
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.worker_count,
            queue_bound: self.queue_bound,
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}
