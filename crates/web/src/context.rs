//! The per-request context shared by every handler of a chain.
//!
//! A [`RequestContext`] holds the parsed request, the response being built,
//! a lazily read request body and a free-form [`State`] bag. It is created
//! by the server for each request and dropped once the response is written.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::mem;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use mime::Mime;
use onion_http::protocol::ParseError;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::body::{Body, ResponseBody};
use crate::dict::HttpDict;
use crate::error::HttpError;

const OCTET_STREAM: &str = "application/x-octet-stream";

type RawBody = UnsyncBoxBody<Bytes, ParseError>;

/// How [`RequestContext::read_request_body`] interprets the body bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
    /// Chosen from the request `Content-Type`.
    #[default]
    Auto,
    Raw,
    Json,
    Text,
    UrlEncoded,
}

/// A request body after it has been read.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Raw(Bytes),
    Json(Value),
    Text(String),
    Form(HttpDict),
}

static NO_BODY: RequestBody = RequestBody::None;

/// Request-scoped values passed between handlers, keyed by name.
#[derive(Default)]
pub struct State {
    entries: HashMap<Cow<'static, str>, Box<dyn Any + Send + Sync>>,
}

impl State {
    /// The value under `key`, if there is one and it is a `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key)?.downcast_mut()
    }

    /// Stores `value` under `key`, returning the previous value if it was a `T`.
    pub fn insert<T>(&mut self, key: impl Into<Cow<'static, str>>, value: T) -> Option<T>
    where
        T: Any + Send + Sync,
    {
        let previous = self.entries.insert(key.into(), Box::new(value))?;
        previous.downcast().ok().map(|boxed| *boxed)
    }

    /// Removes whatever is stored under `key`; returns it if it was a `T`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key)?.downcast().ok().map(|boxed| *boxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

#[derive(Debug)]
pub struct RequestContext {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    query: HttpDict,

    status: StatusCode,
    response_headers: HeaderMap,
    body: Body,
    response_sent: bool,

    raw_body: Option<RawBody>,
    body_cache: Option<RequestBody>,
    body_limit: usize,

    state: State,
    started_at: Instant,
}

impl RequestContext {
    /// Builds the context of one request. Reads of the body are capped at `body_limit` bytes.
    pub fn new<B>(request: Request<B>, body_limit: usize) -> Self
    where
        B: HttpBody<Data = Bytes, Error = ParseError> + Send + 'static,
    {
        let (parts, body) = request.into_parts();
        let query = parts.uri.query().map(HttpDict::from_query).unwrap_or_default();

        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            query,
            status: StatusCode::NOT_FOUND,
            response_headers: HeaderMap::new(),
            body: Body::Empty,
            response_sent: false,
            raw_body: Some(UnsyncBoxBody::new(body)),
            body_cache: None,
            body_limit,
            state: State::default(),
            started_at: Instant::now(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The `Host` header, falling back to the authority of an absolute request target.
    pub fn host(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|value| value.to_str().ok()).or_else(|| self.uri.host())
    }

    pub fn query(&self) -> &HttpDict {
        &self.query
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The first value of a request header, if it is valid UTF-8.
    pub fn request_header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get(name.as_ref()).and_then(|value| value.to_str().ok())
    }

    pub fn request_headers_dict(&self) -> HttpDict {
        HttpDict::from_headers(&self.headers)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.response_headers
    }

    /// Replaces every value of a response header.
    pub fn set_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }

    pub fn add_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.append(name, value);
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Sets a JSON body from any serializable value.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), HttpError> {
        self.body = Body::Json(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn headers_sent(&self) -> bool {
        self.response_sent
    }

    /// Reads and decodes the request body.
    ///
    /// GET, HEAD and DELETE requests always yield [`RequestBody::None`] without
    /// touching the connection. The first successful read is cached; later
    /// calls return it whatever `body_type` they ask for. A failed read
    /// consumes the body, so reading again fails with `InvalidState`.
    pub async fn read_request_body(&mut self, body_type: BodyType) -> Result<&RequestBody, HttpError> {
        if matches!(self.method, Method::GET | Method::HEAD | Method::DELETE) {
            return Ok(&NO_BODY);
        }

        if self.body_cache.is_none() {
            let parsed = self.load_body(body_type).await?;
            self.body_cache = Some(parsed);
        }

        self.body_cache.as_ref().ok_or_else(|| HttpError::InvalidState("request body is not available".to_string()))
    }

    async fn load_body(&mut self, body_type: BodyType) -> Result<RequestBody, HttpError> {
        let Some(raw_body) = self.raw_body.take() else {
            return Err(HttpError::InvalidState("request body was consumed by a failed read".to_string()));
        };

        let limit = self.body_limit;
        if let Some(declared) = self.declared_length() {
            ensure_within(declared, limit)?;
        }

        let bytes = collect_limited(raw_body, limit).await?;
        debug!(size = bytes.len(), "read request body");

        let body_type = match body_type {
            BodyType::Auto => self.infer_body_type(),
            explicit => explicit,
        };

        Ok(match body_type {
            BodyType::Json => RequestBody::Json(serde_json::from_slice(&bytes)?),
            BodyType::Text => RequestBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
            BodyType::UrlEncoded => RequestBody::Form(HttpDict::from_query(&String::from_utf8_lossy(&bytes))),
            BodyType::Raw | BodyType::Auto => RequestBody::Raw(bytes),
        })
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
    }

    fn infer_body_type(&self) -> BodyType {
        let Some(mime) = self.request_header(CONTENT_TYPE).and_then(|value| value.parse::<Mime>().ok()) else {
            return BodyType::Raw;
        };

        match (mime.type_(), mime.subtype()) {
            (mime::APPLICATION, mime::JSON) => BodyType::Json,
            (mime::APPLICATION, mime::WWW_FORM_URLENCODED) => BodyType::UrlEncoded,
            (mime::TEXT, _) => BodyType::Text,
            _ if mime.suffix() == Some(mime::JSON) => BodyType::Json,
            _ => BodyType::Raw,
        }
    }

    /// Serializes the response built so far. Can only be called once per request.
    ///
    /// Bodyless responses (204, 205, 304, HEAD requests, empty body) lose any
    /// `Content-Length` and `Content-Encoding`. Otherwise `Content-Type` is
    /// inferred from the body unless already set, and `Content-Length` is
    /// always computed from the encoded bytes. Streams are passed through as is.
    pub fn send_response(&mut self) -> Result<Response<ResponseBody>, HttpError> {
        if self.response_sent {
            return Err(HttpError::InvalidState("response headers were already sent".to_string()));
        }
        self.response_sent = true;

        let body = mem::take(&mut self.body);
        let mut headers = mem::take(&mut self.response_headers);

        let bodyless_status = matches!(self.status.as_u16(), 204 | 205 | 304);
        let response_body = if bodyless_status || self.method == Method::HEAD || body.is_empty() {
            headers.remove(CONTENT_LENGTH);
            headers.remove(CONTENT_ENCODING);
            ResponseBody::empty()
        } else {
            let (content_type, bytes) = match body {
                Body::Stream(stream) => return Ok(build_response(self.status, headers, ResponseBody::stream(stream))),
                Body::Bytes(bytes) => (OCTET_STREAM, bytes),
                Body::Text(text) => ("text/plain", Bytes::from(text)),
                Body::Json(value) => ("application/json", Bytes::from(serde_json::to_vec(&value)?)),
                Body::Empty => ("", Bytes::new()),
            };

            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            ResponseBody::once(bytes)
        };

        Ok(build_response(self.status, headers, response_body))
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn ensure_within(size: u64, limit: usize) -> Result<(), HttpError> {
    if usize::try_from(size).map_or(true, |size| size > limit) {
        return Err(HttpError::RequestSizeExceeded { limit });
    }
    Ok(())
}

async fn collect_limited(mut body: RawBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else { continue };
        ensure_within((buf.len() + data.len()) as u64, limit)?;
        buf.extend_from_slice(&data);
    }
    Ok(buf.freeze())
}
