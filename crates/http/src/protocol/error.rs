use std::io;

use thiserror::Error;

/// Why a connection stopped: a request we couldn't read, or a response we
/// couldn't write.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {0}")]
    Request(#[from] ParseError),

    #[error("response error: {0}")]
    Response(#[from] SendError),
}

/// A malformed or unreadable request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("request head is {size} bytes, limit is {limit}")]
    HeadTooLarge { size: usize, limit: usize },

    #[error("more than {limit} headers")]
    TooManyHeaders { limit: usize },

    #[error("invalid header: {0}")]
    Header(String),

    #[error("unsupported http version: {0:?}")]
    Version(Option<u8>),

    #[error("invalid method")]
    Method,

    #[error("invalid request target")]
    Target,

    #[error("invalid content-length: {0}")]
    ContentLength(String),

    #[error("invalid body: {0}")]
    Body(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ParseError {
    pub fn header(reason: impl ToString) -> Self {
        Self::Header(reason.to_string())
    }

    pub fn content_length(reason: impl ToString) -> Self {
        Self::ContentLength(reason.to_string())
    }

    pub fn body(reason: impl ToString) -> Self {
        Self::Body(reason.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid response body: {0}")]
    Body(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SendError {
    pub fn body(reason: impl ToString) -> Self {
        Self::Body(reason.to_string())
    }
}
