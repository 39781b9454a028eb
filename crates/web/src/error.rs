//! Error types of the request-processing core.
//!
//! [`HttpError`] is what handlers return and what [`crate::ErrorHandler`]
//! turns into a response. Only errors carrying a valid status (100-599) are
//! shown to clients verbatim; everything else is rendered as a generic 500.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;

use http::{Method, StatusCode};
use onion_http::protocol::ParseError;
use serde_json::Value;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

pub(crate) const GENERIC_SERVER_MESSAGE: &str = "The request cannot be processed";

#[derive(Debug, Error)]
pub enum HttpError {
    /// No handler in the chain produced a response.
    #[error("no handler for {method} {path}")]
    NotFound { method: Method, path: String },

    #[error("request body exceeds the limit of {limit} bytes")]
    RequestSizeExceeded { limit: usize },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("malformed json body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("can't read request: {0}")]
    Transport(#[from] ParseError),

    #[error("{message}")]
    Application {
        name: String,
        status: Option<u16>,
        message: String,
        details: Option<Value>,
        #[source]
        source: Option<BoxError>,
    },
}

impl HttpError {
    fn application(name: &str, status: u16, message: impl Into<String>) -> Self {
        Self::Application { name: name.to_string(), status: Some(status), message: message.into(), details: None, source: None }
    }

    pub fn client_error(message: impl Into<String>) -> Self {
        Self::application("ClientError", 400, message)
    }

    pub fn authentication_required(message: impl Into<String>) -> Self {
        Self::application("AuthenticationRequiredError", 401, message)
    }

    pub fn invalid_authentication(message: impl Into<String>) -> Self {
        Self::application("InvalidAuthenticationError", 401, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::application("AccessDeniedError", 403, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::application("NotFoundError", 404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::application("ConflictError", 409, message)
    }

    pub fn server_error() -> Self {
        Self::application("ServerError", 500, GENERIC_SERVER_MESSAGE)
    }

    /// An application error with an arbitrary status. Statuses outside
    /// 100-599 are kept but treated as "no status" when rendered.
    pub fn with_status(name: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Application { name: name.into(), status: Some(status), message: message.into(), details: None, source: None }
    }

    /// Wraps an arbitrary error. It carries no status, so clients only ever
    /// see the generic server error for it.
    pub fn from_error<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = error.into();
        Self::Application { name: "Error".to_string(), status: None, message: source.to_string(), details: None, source: Some(source) }
    }

    #[must_use]
    pub fn with_details(mut self, value: Value) -> Self {
        if let Self::Application { details, .. } = &mut self {
            *details = Some(value);
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NotFound { .. } => "NotFoundError",
            Self::RequestSizeExceeded { .. } => "RequestSizeExceededError",
            Self::InvalidState(_) => "InvalidStateError",
            Self::Json(_) => "BodyParseError",
            Self::Transport(_) => "ClientError",
            Self::Application { name, .. } => name,
        }
    }

    /// The status to answer with, if this error declares a valid one.
    pub fn status(&self) -> Option<StatusCode> {
        let code = match self {
            Self::NotFound { .. } => 404,
            Self::RequestSizeExceeded { .. } => 413,
            Self::Json(_) | Self::Transport(_) => 400,
            Self::InvalidState(_) => return None,
            Self::Application { status, .. } => (*status)?,
        };

        if (100..=599).contains(&code) { StatusCode::from_u16(code).ok() } else { None }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Application { details, .. } => details.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("can't bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid tls setup: {0}")]
    Tls(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rustls::Error> for ServerError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't parse {key}={value:?}: {error}")]
    Parse { key: &'static str, value: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_carry_status_and_name() {
        let cases = [
            (HttpError::client_error("bad"), 400, "ClientError"),
            (HttpError::authentication_required("who"), 401, "AuthenticationRequiredError"),
            (HttpError::invalid_authentication("nope"), 401, "InvalidAuthenticationError"),
            (HttpError::access_denied("no"), 403, "AccessDeniedError"),
            (HttpError::not_found("gone"), 404, "NotFoundError"),
            (HttpError::conflict("again"), 409, "ConflictError"),
            (HttpError::server_error(), 500, "ServerError"),
        ];

        for (error, status, name) in cases {
            assert_eq!(error.status().map(|s| s.as_u16()), Some(status));
            assert_eq!(error.name(), name);
        }
    }

    #[test]
    fn out_of_range_status_is_ignored() {
        assert_eq!(HttpError::with_status("Teapot", 418, "short and stout").status(), Some(StatusCode::IM_A_TEAPOT));
        assert_eq!(HttpError::with_status("Weird", 99, "too low").status(), None);
        assert_eq!(HttpError::with_status("Weird", 600, "too high").status(), None);
    }

    #[test]
    fn wrapped_errors_have_no_status() {
        let error = HttpError::from_error(std::io::Error::other("disk on fire"));

        assert_eq!(error.status(), None);
        assert_eq!(error.to_string(), "disk on fire");
        assert!(error.source().is_some());
    }

    #[test]
    fn not_found_describes_request() {
        let error = HttpError::NotFound { method: Method::GET, path: "/missing".to_string() };

        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(error.to_string(), "no handler for GET /missing");
    }

    #[test]
    fn details_only_on_application_errors() {
        let error = HttpError::client_error("invalid").with_details(json!({"field": "email"}));
        assert_eq!(error.details(), Some(&json!({"field": "email"})));

        let error = HttpError::InvalidState("sent".to_string()).with_details(json!(1));
        assert_eq!(error.details(), None);
    }
}
