//! Request-processing core built on `onion-http`.
//!
//! Requests flow through a [`MiddlewareChain`] of [`HttpHandler`]s sharing
//! one mutable [`RequestContext`]. Each handler may act before and after the
//! rest of the chain, or stop it. The [`Server`] owns the listener, counts
//! in-flight requests per connection and drains them on [`Server::stop`].
//!
//! ```no_run
//! use futures::FutureExt;
//! use http::StatusCode;
//! use onion_web::{MiddlewareChain, Server, ServerConfig, StandardHandler, handler_fn};
//!
//! # async fn run() -> Result<(), onion_web::ServerError> {
//! let hello = handler_fn(|ctx, next| {
//!     async move {
//!         if ctx.path() != "/hello" {
//!             return next.run(ctx).await;
//!         }
//!         ctx.set_status(StatusCode::OK);
//!         ctx.set_body("Hello World!");
//!         Ok(())
//!     }
//!     .boxed()
//! });
//!
//! let root = MiddlewareChain::builder().add_last(StandardHandler::new()).add_last(hello).build();
//! let server = Server::new(ServerConfig::from_env()?.with_port(8080), root);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod body;
mod chain;
mod config;
mod context;
mod date;
mod dict;
mod error;
mod handlers;
mod server;
mod tls;

pub use body::{Body, BoxBody, ResponseBody};
pub use chain::{ChainBuilder, FnHandler, HttpHandler, MiddlewareChain, Next, handler_fn};
pub use config::{ServerConfig, TlsConfig};
pub use context::{BodyType, RequestBody, RequestContext, State};
pub use dict::HttpDict;
pub use error::{ConfigError, HttpError, ServerError};
pub use handlers::{ACTOR_STATE_KEY, ERROR_STATE_KEY, ErrorHandler, RequestLog, RequestLogEntry, StandardHandler, TracingRequestLog};
pub use server::{Server, ServerState};
