//! Shared batch state and the join that turns worker outcomes into one result.
//!
//! [`WorkerPool`] spawns one Tokio task per worker and joins them in
//! completion order. It owns the batch-wide fail-fast token; tripping the
//! abort flag is a single atomic swap, so the token is cancelled exactly once
//! no matter how many workers fail at the same time.
//!
//! The failure that aborts a batch is stored before the token fires. Peers
//! that fail only because they observed the token can finish first, but
//! their errors lose the swap and never reach the caller.

use super::worker::worker_loop;
use crate::{
    IndexAllocator, ResultCollector,
    cancel::{CancelCause, CancelSource},
    error::DispatchError,
    executor::Executor,
};
use core::time::Duration;
use futures::{StreamExt, stream::FuturesUnordered};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything the workers of one batch share.
pub(crate) struct Batch<E: Executor> {
    pub(crate) executor: Arc<E>,
    pub(crate) inputs: Box<[E::Input]>,
    pub(crate) allocator: IndexAllocator,
    pub(crate) results: ResultCollector<E::Output>,
    pub(crate) fail_fast: bool,
    timeout_per_task: Option<Duration>,
    caller_token: Option<CancellationToken>,
    fail_fast_token: CancellationToken,
    aborted: AtomicBool,
    failure: Mutex<Option<DispatchError<E::Error>>>,
}

impl<E: Executor> Batch<E> {
    pub(crate) fn new(
        executor: Arc<E>,
        inputs: Box<[E::Input]>,
        caller_token: Option<CancellationToken>,
        timeout_per_task: Option<Duration>,
        fail_fast: bool,
    ) -> Self {
        let len = inputs.len();
        Self {
            executor,
            inputs,
            allocator: IndexAllocator::new(len),
            results: ResultCollector::new(len),
            fail_fast,
            timeout_per_task,
            caller_token,
            fail_fast_token: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Cancellation sources for one task, in attribution priority order.
    pub(crate) fn sources(&self) -> Vec<CancelSource> {
        let mut sources = Vec::with_capacity(3);
        if let Some(token) = &self.caller_token {
            sources.push(CancelSource::caller(token.clone()));
        }
        if let Some(timeout) = self.timeout_per_task {
            sources.push(CancelSource::timeout(timeout));
        }
        sources.push(CancelSource::fail_fast(self.fail_fast_token.clone()));
        sources
    }

    fn caller_cancelled(&self) -> bool {
        self.caller_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Workers stop claiming once the batch was aborted or the caller
    /// cancelled it.
    pub(crate) fn is_halted(&self) -> bool {
        self.aborted.load(Ordering::Acquire) || self.caller_cancelled()
    }

    /// Sets the abort flag and fires the fail-fast token.
    ///
    /// Returns `true` only for the call that flipped the flag.
    pub(crate) fn trip_abort(&self) -> bool {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel_outstanding();
        true
    }

    /// Aborts the batch on behalf of `err`.
    ///
    /// Only the call that flips the abort flag stores its error, and it does so
    /// before the fail-fast token fires. Returns `true` for that call.
    pub(crate) fn abort_with(&self, err: DispatchError<E::Error>) -> bool {
        {
            let mut failure = self.failure.lock();
            if self.aborted.swap(true, Ordering::AcqRel) {
                return false;
            }
            *failure = Some(err);
        }
        self.cancel_outstanding();
        true
    }

    fn cancel_outstanding(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Batch aborted, cancelling outstanding tasks");
        self.fail_fast_token.cancel();
    }

    /// Keeps the earliest failure; later ones are dropped.
    pub(crate) fn record_failure(&self, err: DispatchError<E::Error>) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn take_failure(&self) -> Option<DispatchError<E::Error>> {
        self.failure.lock().take()
    }

    fn halt_cause(&self) -> CancelCause {
        if self.caller_cancelled() {
            CancelCause::Caller
        } else {
            CancelCause::FailFast
        }
    }
}

/// The running workers of one batch.
///
/// Dropping a pool before [`join`](WorkerPool::join) completes aborts the
/// batch: no further task is started and every in-flight task is cancelled.
pub(crate) struct WorkerPool<E: Executor> {
    batch: Arc<Batch<E>>,
    workers: FuturesUnordered<JoinHandle<()>>,
}

impl<E: Executor> WorkerPool<E> {
    /// Spawns `min(max_concurrency, len)` workers on the current runtime.
    pub(crate) fn spawn(batch: Batch<E>, max_concurrency: usize) -> Self {
        let batch = Arc::new(batch);
        let size = max_concurrency.min(batch.inputs.len());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Spawning {size} workers for {} tasks (fail_fast: {})",
            batch.inputs.len(),
            batch.fail_fast
        );

        let workers = (0..size)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&batch))))
            .collect();

        Self { batch, workers }
    }

    /// Number of spawned workers.
    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Joins workers in completion order and produces the batch outcome.
    ///
    /// - With fail-fast, the error that aborted the batch is returned as soon
    ///   as any worker is joined after it; the other workers are left to
    ///   observe the fired token.
    /// - Without fail-fast, every worker runs to the end and the earliest
    ///   recorded failure is returned.
    /// - A panicking worker aborts the batch and the panic is resumed here.
    pub(crate) async fn join(mut self) -> Result<Vec<E::Output>, DispatchError<E::Error>> {
        while let Some(joined) = self.workers.next().await {
            if let Err(join_err) = joined {
                self.batch.trip_abort();
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                // The runtime is shutting down underneath us.
                let index = self.batch.results.first_missing().unwrap_or_default();
                return Err(DispatchError::Cancelled {
                    index,
                    cause: CancelCause::Caller,
                });
            }

            if self.batch.fail_fast {
                if let Some(err) = self.batch.take_failure() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Batch failed: {err}");
                    return Err(err);
                }
            }
        }

        if let Some(err) = self.batch.take_failure() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Batch failed: {err}");
            return Err(err);
        }

        self.batch
            .results
            .take_ordered()
            .map_err(|index| DispatchError::Cancelled {
                index,
                cause: self.batch.halt_cause(),
            })
    }
}

impl<E: Executor> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.batch.trip_abort();
        }
    }
}
