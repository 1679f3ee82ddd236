use crate::cancel::TaskToken;
use core::{fmt, future::Future, marker::PhantomData};

/// The operation a batch runs once per input.
///
/// The dispatcher is agnostic to what an operation does: it hands each input
/// to [`execute`] together with that task's [`TaskToken`] and only looks at
/// whether the returned future resolved to `Ok` or `Err`.
///
/// Executors should observe the token and stop early once it fires; the
/// dispatcher additionally drops the in-flight future when the token fires,
/// so an executor that ignores the token is still cut off at its next
/// suspension point.
///
/// [`execute`]: Executor::execute
pub trait Executor: Send + Sync + 'static {
    /// One element of the batch.
    type Input: Send + Sync + 'static;
    /// The value produced for a successful input.
    type Output: Send + 'static;
    /// The failure reported for an unsuccessful input.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs the operation for `input`.
    fn execute(
        &self,
        input: &Self::Input,
        token: TaskToken,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;

    /// Checks an input before the batch starts. A rejected input fails the
    /// whole call and no task is run.
    ///
    /// Accepts every input by default.
    fn validate(&self, _input: &Self::Input) -> Result<(), String> {
        Ok(())
    }
}

/// An [`Executor`] backed by a closure. See [`executor_fn`].
pub struct FnExecutor<I, F> {
    f: F,
    _input: PhantomData<fn(I)>,
}

impl<I, F> fmt::Debug for FnExecutor<I, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

impl<I, F: Clone> Clone for FnExecutor<I, F> {
    fn clone(&self) -> Self {
        Self {
            f: self.f.clone(),
            _input: PhantomData,
        }
    }
}

/// Adapts an async closure into an [`Executor`].
///
/// The closure receives an owned clone of each input, so the returned future
/// does not borrow from the batch.
///
/// # Example
/// ```
/// use std::convert::Infallible;
/// use volley::{DispatchOptions, dispatch, executor_fn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let double = executor_fn(|n: u32, _token| async move { Ok::<_, Infallible>(n * 2) });
/// let doubled = dispatch(vec![1_u32, 2, 3], 2, DispatchOptions::new(double))
///     .await
///     .unwrap();
/// assert_eq!(doubled, vec![2, 4, 6]);
/// # }
/// ```
pub fn executor_fn<I, F, Fut>(f: F) -> FnExecutor<I, F>
where
    F: Fn(I, TaskToken) -> Fut,
{
    FnExecutor {
        f,
        _input: PhantomData,
    }
}

impl<I, F, Fut, O, Err> Executor for FnExecutor<I, F>
where
    I: Clone + Send + Sync + 'static,
    F: Fn(I, TaskToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, Err>> + Send,
    O: Send + 'static,
    Err: std::error::Error + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;
    type Error = Err;

    fn execute(
        &self,
        input: &Self::Input,
        token: TaskToken,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send {
        (self.f)(input.clone(), token)
    }
}
