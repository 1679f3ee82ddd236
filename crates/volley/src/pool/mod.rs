//! Bounded worker pool for a single batch.
//!
//! A batch is run by `min(max_concurrency, len)` Tokio tasks. Workers share
//! one [`Batch`] and pull indices from its
//! [`IndexAllocator`](crate::IndexAllocator) until the batch is exhausted or
//! halted, so at most one task per worker is ever in flight.

mod manager;
mod worker;

pub(crate) use manager::{Batch, WorkerPool};
