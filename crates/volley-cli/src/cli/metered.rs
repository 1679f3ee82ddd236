use super::telemetry::{
    decrement_tasks_inflight, increment_task_failures, increment_tasks_inflight,
    increment_tasks_started,
};
use core::future::Future;
use volley::{Executor, TaskToken};

/// Wraps an [`Executor`] and reports every task to the metric handles.
#[derive(Debug, Clone)]
pub struct MeteredExecutor<E> {
    inner: E,
}

impl<E> MeteredExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }
}

/// Keeps the in-flight gauge balanced when a task is dropped mid-flight.
struct InFlightGuard;

impl InFlightGuard {
    fn enter() -> Self {
        increment_tasks_inflight();
        Self
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        decrement_tasks_inflight();
    }
}

impl<E: Executor> Executor for MeteredExecutor<E> {
    type Input = E::Input;
    type Output = E::Output;
    type Error = E::Error;

    fn execute(
        &self,
        input: &Self::Input,
        token: TaskToken,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send {
        let call = self.inner.execute(input, token);
        async move {
            increment_tasks_started();
            let _in_flight = InFlightGuard::enter();
            let outcome = call.await;
            if outcome.is_err() {
                increment_task_failures();
            }
            outcome
        }
    }

    fn validate(&self, input: &Self::Input) -> Result<(), String> {
        self.inner.validate(input)
    }
}
