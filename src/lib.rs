//! `reqtrace` is an instrumented HTTP/1.1 client: it layers per-request
//! connection-lifecycle timing, raw wire capture, and a trace-event pipeline
//! on top of request execution.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use reqtrace::prelude::{Client, FileSink, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = Arc::new(FileSink::create("trace-events.txt")?);
//!     let client = Client::builder()
//!         .client_name("my-scanner")
//!         .request_timeout(Duration::from_secs(3))
//!         .retry_policy(RetryPolicy::standard().max_attempts(3))
//!         .event_sink(sink.clone())
//!         .try_build()?;
//!
//!     let response = client
//!         .get("http://example.com/")
//!         .index("example-probe")
//!         .send()
//!         .await?;
//!
//!     let timing = response.trace_info();
//!     println!(
//!         "status={} total={:?} reused={}",
//!         response.status(),
//!         timing.total_time,
//!         timing.is_conn_reused
//!     );
//!     sink.close();
//!     Ok(())
//! }
//! ```
//!
//! Every completed request, success or failure, is reported as exactly one
//! trace event to each registered sink. A request canceled through its
//! [`CancellationToken`](tokio_util::sync::CancellationToken) returns
//! promptly and is never retried, regardless of remaining attempt budget.

mod client;
mod engine;
mod error;
mod event;
mod raw;
mod request;
mod response;
mod retry;
mod sink;
mod trace;
mod util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::engine::{EngineRequest, EngineResponse, HttpEngine};
pub use crate::error::{Error, ErrorCode, TransportErrorKind};
pub use crate::event::{IndexValue, TraceEvent, TraceEventWithIndex};
pub use crate::request::RequestBuilder;
pub use crate::response::Response;
pub use crate::retry::{RetryDecision, RetryPolicy};
pub use crate::sink::{EventSink, FileSink, RemoteSink, SinkError};
pub use crate::trace::{ConnectInfo, ConnectionAcquired, ConnectionTracer, TraceInfo, TracePhase};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Client, ConnectInfo, Error, ErrorCode, EventSink, FileSink, IndexValue, RemoteSink,
        Response, Result, RetryPolicy, SinkError, TraceEvent, TraceInfo, TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
