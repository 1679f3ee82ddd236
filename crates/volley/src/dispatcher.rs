use crate::{
    error::{Result, ValidationError},
    executor::Executor,
    pool::{Batch, WorkerPool},
};
use core::time::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call configuration of a batch.
///
/// | Option              | Default | Effect                                             |
/// |---------------------|---------|----------------------------------------------------|
/// | `caller_token`      | none    | Cancelling it cancels every task of the batch.     |
/// | `timeout_per_task`  | none    | Fires one task's token once it ran for this long.  |
/// | `fail_fast`         | `true`  | The first failure cancels every other task.        |
#[derive(Debug, Clone)]
pub struct DispatchOptions<E> {
    pub executor: E,
    pub caller_token: Option<CancellationToken>,
    pub timeout_per_task: Option<Duration>,
    pub fail_fast: bool,
}

impl<E> DispatchOptions<E> {
    /// Options for `executor` with every other setting at its default.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            caller_token: None,
            timeout_per_task: None,
            fail_fast: true,
        }
    }

    #[must_use]
    pub fn with_caller_token(mut self, token: CancellationToken) -> Self {
        self.caller_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_timeout_per_task(mut self, timeout: Duration) -> Self {
        self.timeout_per_task = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

impl<E: Default> Default for DispatchOptions<E> {
    fn default() -> Self {
        Self::new(E::default())
    }
}

/// A reusable batch runner bound to one executor and one set of options.
///
/// Every call to [`dispatch`](Dispatcher::dispatch) runs an independent batch:
/// batches share the executor but never their allocator, results, or
/// fail-fast token.
#[derive(Debug)]
pub struct Dispatcher<E> {
    executor: Arc<E>,
    max_concurrency: usize,
    caller_token: Option<CancellationToken>,
    timeout_per_task: Option<Duration>,
    fail_fast: bool,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            max_concurrency: self.max_concurrency,
            caller_token: self.caller_token.clone(),
            timeout_per_task: self.timeout_per_task,
            fail_fast: self.fail_fast,
        }
    }
}

impl<E: Executor> Dispatcher<E> {
    /// Creates a dispatcher running at most `max_concurrency` tasks at once.
    ///
    /// `max_concurrency` is checked per call, so that dispatching an empty
    /// batch succeeds whatever the cap.
    pub fn new(max_concurrency: usize, options: DispatchOptions<E>) -> Self {
        Self {
            executor: Arc::new(options.executor),
            max_concurrency,
            caller_token: options.caller_token,
            timeout_per_task: options.timeout_per_task,
            fail_fast: options.fail_fast,
        }
    }

    /// The executor every batch of this dispatcher runs.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The concurrency cap.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Runs `inputs` as one batch and returns the outputs in input order.
    ///
    /// Before anything runs:
    /// - An empty batch returns `Ok(vec![])` without touching the executor.
    /// - A zero cap fails with [`ValidationError::InvalidConcurrency`].
    /// - The first absent input fails with [`ValidationError::MissingInput`].
    /// - The first input rejected by [`Executor::validate`] fails with
    ///   [`ValidationError::InvalidInput`].
    ///
    /// Once running, the batch either yields one output per input or a single
    /// [`DispatchError`](crate::DispatchError); partial results are never
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`](crate::DispatchError::Validation) for a
    ///   malformed call.
    /// - [`DispatchError::Task`](crate::DispatchError::Task) for the failure of
    ///   one task.
    /// - [`DispatchError::Cancelled`](crate::DispatchError::Cancelled) when a
    ///   task was stopped by its token, or when the caller cancelled the batch
    ///   before every task ran.
    ///
    /// # Panics
    ///
    /// A panic inside the executor aborts the batch and is resumed on the
    /// caller's task.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            level = "debug",
            skip_all,
            fields(max_concurrency = self.max_concurrency, fail_fast = self.fail_fast)
        )
    )]
    pub async fn dispatch<I, T>(&self, inputs: I) -> Result<Vec<E::Output>, E::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<Option<E::Input>>,
    {
        let inputs: Vec<Option<E::Input>> = inputs.into_iter().map(Into::into).collect();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let inputs = self.validate(inputs)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatching {} tasks", inputs.len());

        let batch = Batch::new(
            Arc::clone(&self.executor),
            inputs,
            self.caller_token.clone(),
            self.timeout_per_task,
            self.fail_fast,
        );
        WorkerPool::spawn(batch, self.max_concurrency).join().await
    }

    fn validate(
        &self,
        inputs: Vec<Option<E::Input>>,
    ) -> core::result::Result<Box<[E::Input]>, ValidationError> {
        if self.max_concurrency == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let input = input.ok_or(ValidationError::MissingInput { index })?;
                self.executor
                    .validate(&input)
                    .map_err(|reason| ValidationError::InvalidInput { index, reason })?;
                Ok(input)
            })
            .collect()
    }
}

/// Runs `inputs` with at most `max_concurrency` tasks in flight and returns
/// the outputs in input order.
///
/// One-shot form of [`Dispatcher::dispatch`]; see there for the validation
/// rules and the error contract.
///
/// # Example
/// ```
/// use std::{convert::Infallible, time::Duration};
/// use volley::{DispatchOptions, dispatch, executor_fn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let sleepy = executor_fn(|ms: u64, _token| async move {
///     tokio::time::sleep(Duration::from_millis(ms)).await;
///     Ok::<_, Infallible>(ms)
/// });
///
/// let out = dispatch(vec![30_u64, 10, 20], 2, DispatchOptions::new(sleepy))
///     .await
///     .unwrap();
/// assert_eq!(out, vec![30, 10, 20]);
/// # }
/// ```
pub async fn dispatch<E, I, T>(
    inputs: I,
    max_concurrency: usize,
    options: DispatchOptions<E>,
) -> Result<Vec<E::Output>, E::Error>
where
    E: Executor,
    I: IntoIterator<Item = T>,
    T: Into<Option<E::Input>>,
{
    Dispatcher::new(max_concurrency, options)
        .dispatch(inputs)
        .await
}
