//! Protocol types shared by the codec and the connection loop.
//!
//! - [`Message`], [`PayloadItem`] and [`PayloadSize`] describe how a message
//!   is split into a head and body pieces, and how the body is framed.
//! - [`RequestHeader`] wraps `http::Request<()>` for the decoded head.
//! - [`body::ReqBody`] is the streaming request body handed to handlers.
//! - [`HttpError`], [`ParseError`] and [`SendError`] are the wire-level errors.

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

pub mod body;
