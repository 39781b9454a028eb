//! HTTP/1.1 wire layer of the onion request-processing core.
//!
//! This crate turns a pair of async byte streams into a sequence of
//! `http::Request<ReqBody>` values and writes the matching responses back,
//! one exchange at a time. Everything above the wire (middleware, request
//! contexts, error rendering, the listening server) lives in `onion-web`.
//!
//! # Example
//!
//! ```no_run
//! use std::error::Error;
//! use std::sync::Arc;
//!
//! use http::{Request, Response};
//! use http_body_util::BodyExt;
//! use onion_http::connection::HttpConnection;
//! use onion_http::handler::make_handler;
//! use onion_http::protocol::body::ReqBody;
//! use tokio::net::TcpListener;
//! use tracing::{info, warn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let handler = Arc::new(make_handler(echo));
//!
//!     loop {
//!         let (stream, remote_addr) = listener.accept().await?;
//!         let handler = Arc::clone(&handler);
//!
//!         tokio::spawn(async move {
//!             let (reader, writer) = stream.into_split();
//!             match HttpConnection::new(reader, writer).process(handler).await {
//!                 Ok(()) => info!(%remote_addr, "connection closed"),
//!                 Err(e) => warn!(%remote_addr, cause = %e, "connection failed"),
//!             }
//!         });
//!     }
//! }
//!
//! async fn echo(request: Request<ReqBody>) -> Result<Response<String>, Box<dyn Error + Send + Sync>> {
//!     let body = request.into_body().collect().await?.to_bytes();
//!     Ok(Response::new(String::from_utf8_lossy(&body).into_owned()))
//! }
//! ```
//!
//! # Modules
//!
//! - [`connection`]: the per-socket request loop, keep-alive, idle timeout
//!   and the [`connection::ConnectionObserver`] hook used for graceful shutdown.
//! - [`codec`]: request head/body decoding and response encoding.
//! - [`protocol`]: message, framing and error types shared by the above.
//! - [`handler`]: the [`handler::Handler`] contract the loop drives.
//!
//! # Limits
//!
//! - HTTP/1.1 only (HTTP/1.0 requests are accepted, responses are always 1.1)
//! - request heads are limited to 8 KiB and 64 headers
//! - response trailers are not sent

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
