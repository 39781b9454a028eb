//! Per-socket request/response loop.

mod http_connection;
mod observer;

pub use http_connection::HttpConnection;
pub use observer::{ConnectionAction, ConnectionObserver, NoopObserver};
