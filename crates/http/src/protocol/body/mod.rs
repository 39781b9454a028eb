//! Streaming request body.
//!
//! The connection owns the socket reader, so the body handed to a handler can't
//! read from it directly. Instead [`ReqBody`] asks for data over a channel and a
//! [`BodySender`] running next to the handler pulls the next payload item off the
//! decoder and passes it back. Data is only read from the socket when the
//! handler polls for it, so an unread body costs nothing until it is drained.

mod req_body;

pub use req_body::ReqBody;
pub(crate) use req_body::{BodySender, body_channel};
