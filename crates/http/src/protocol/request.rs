//! Decoded request head.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version, header};

/// The head of an incoming request: method, target, version and headers.
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body, producing the request handed to a [`Handler`](crate::handler::Handler).
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// HEAD responses carry headers only, never a body.
    pub fn is_head(&self) -> bool {
        self.method() == Method::HEAD
    }

    /// Whether the client asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        let connection = self.headers().get(header::CONNECTION).map(http::HeaderValue::as_bytes);
        let has_token = |token: &[u8]| {
            connection.is_some_and(|value| value.split(|b| *b == b',').any(|t| t.trim_ascii().eq_ignore_ascii_case(token)))
        };

        match self.version() {
            Version::HTTP_10 => !has_token(b"keep-alive"),
            _ => has_token(b"close"),
        }
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
