//! `courier` is a promise-based HTTP request layer for API SDKs.
//!
//! Every request is queued on a worker pool and returns a [`Promise`] that
//! completes exactly once with the terminal outcome of the chain: the final
//! response after redirect handling, or the fault that ended it. Callers can
//! block on the promise, poll it, or attach continuations; any number of
//! waiters observe the same outcome.
//!
//! # Quick Start
//!
//! ```no_run
//! use courier::prelude::{Dispatcher, DispatcherConfig, RedirectPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreateItemResponse {
//!     id: String,
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new(
//!         DispatcherConfig::default()
//!             .with_user_agent("my-sdk/1.0")
//!             .with_redirect_policy(RedirectPolicy::limited(5)),
//!     );
//!
//!     let response = dispatcher
//!         .post("https://api.example.com/v1/items")
//!         .json(&serde_json::json!({ "name": "demo" }))?
//!         .call()?;
//!     let created: CreateItemResponse = response.json()?;
//!
//!     println!("created id={}", created.id);
//!     Ok(())
//! }
//! ```
//!
//! # Notes
//!
//! - Any HTTP status is a valid response. The dispatcher never turns a 4xx
//!   or 5xx into an error; status policy belongs to the embedding SDK.
//! - Requests are never retried here. Retry layers, if any, sit above.
//! - Use [`RequestBuilder::streaming`] for large bodies; the relay buffer is
//!   bounded, so a slow consumer backpressures the delivery thread.

mod config;
mod dispatch;
mod error;
mod metrics;
mod promise;
mod redirect;
mod relay;
mod request;
mod response;
mod tls;
mod transport;
mod util;

pub use crate::config::DispatcherConfig;
pub use crate::dispatch::Dispatcher;
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::{DispatchObserver, DispatcherMetricsSnapshot};
pub use crate::promise::{Deliverer, Promise};
pub use crate::redirect::RedirectPolicy;
pub use crate::relay::{BodyStream, EventSink, ResponseHead};
pub use crate::request::{BodyMode, RequestBuilder, RequestDescription, ResponseTransform};
pub use crate::response::{Response, ResponseBody, ResponseEnvelope, StreamHandle};
pub use crate::tls::TlsMaterial;
pub use crate::transport::{Transport, TransportRequest, UreqTransport};

pub type CourierResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BodyMode, CourierResult, DispatchObserver, Dispatcher, DispatcherConfig,
        DispatcherMetricsSnapshot, Error, ErrorCode, RedirectPolicy, Response, ResponseEnvelope,
        StreamHandle, TlsMaterial, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
