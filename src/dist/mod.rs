//! Client-side routing: the range descriptor cache and the distributed
//! sender.

pub mod range_cache;
pub mod sender;

use crate::api::request::{Request, Response};
use crate::core::error::Result;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`KvSender::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// Anything that can carry a typed request to the right range and return
/// its response: the distributed sender, a single store (in tests), or a
/// remote client.
pub trait KvSender: Send + Sync {
    fn send(&self, request: Request) -> SendFuture<'_>;
}
