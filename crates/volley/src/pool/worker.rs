use super::Batch;
use crate::{cancel::compose, error::DispatchError, executor::Executor};
use std::sync::Arc;

/// Worker task draining one batch.
///
/// Each iteration claims the next index from the batch allocator and runs it
/// to completion before claiming again, so a worker never has more than one
/// task in flight. The loop ends when the allocator is exhausted or the batch
/// is halted by an abort or by the caller. The halt check is repeated after
/// claiming, so an index claimed while the batch halts is never started.
///
/// With fail-fast enabled the first failing task aborts the batch and stores
/// its failure there. Without fail-fast the failure is recorded on the batch
/// and the worker keeps claiming.
pub(crate) async fn worker_loop<E: Executor>(worker_id: usize, batch: Arc<Batch<E>>) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while !batch.is_halted() {
        let Some(index) = batch.allocator.next_index() else {
            break;
        };
        if batch.is_halted() {
            break;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Worker {worker_id} claimed task {index}");

        match run_task(&batch, index).await {
            Ok(output) => {
                batch.results.write(index, output);
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id}: {err}");

                if batch.fail_fast {
                    batch.abort_with(err);
                    break;
                }
                batch.record_failure(err);
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;
}

/// Runs the task at `index` under its composed token.
///
/// The executor future is raced against the token with a bias toward the
/// executor, so a call that already completed wins over a token that fired in
/// the same poll. An executor error seen after the token fired is reported as
/// the cancellation it most likely is.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip(batch)))]
async fn run_task<E: Executor>(
    batch: &Batch<E>,
    index: usize,
) -> Result<E::Output, DispatchError<E::Error>> {
    let composed = compose(batch.sources());
    let token = composed.token().clone();

    if let Some(cause) = token.cause() {
        return Err(DispatchError::Cancelled { index, cause });
    }

    let input = &batch.inputs[index];
    let outcome = tokio::select! {
        biased;
        outcome = batch.executor.execute(input, token.clone()) => outcome,
        cause = token.cancelled() => return Err(DispatchError::Cancelled { index, cause }),
    };

    outcome.map_err(|source| match token.cause() {
        Some(cause) => DispatchError::Cancelled { index, cause },
        None => DispatchError::Task { index, source },
    })
}
