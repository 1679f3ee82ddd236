#![doc = include_str!("../README.md")]

mod allocator;
mod cancel;
mod collector;
mod dispatcher;
mod error;
mod executor;
#[cfg(feature = "http")]
mod http;
mod pool;

pub use crate::allocator::*;
pub use crate::cancel::*;
pub use crate::collector::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::executor::*;
#[cfg(feature = "http")]
pub use crate::http::*;

pub use tokio_util::sync::CancellationToken;
