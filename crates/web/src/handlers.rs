//! Standard middleware: error presentation and request logging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::USER_AGENT;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::chain::{HttpHandler, Next};
use crate::context::RequestContext;
use crate::error::{GENERIC_SERVER_MESSAGE, HttpError};

/// State key under which [`ErrorHandler`] keeps the error it caught.
pub const ERROR_STATE_KEY: &str = "error";

/// State key an authentication layer may set (to a `String` or `&'static str`)
/// to name who made the request; [`StandardHandler`] logs it.
pub const ACTOR_STATE_KEY: &str = "actor";

const SERVER_TIMING: HeaderName = HeaderName::from_static("server-timing");
const REQUEST_ID: &str = "x-request-id";

/// Turns errors from the rest of the chain into JSON responses.
///
/// Errors with a valid status are shown as `{name, message, details?}`;
/// anything else becomes a 500 with a generic message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorHandler;

impl ErrorHandler {
    fn present(ctx: &mut RequestContext, error: HttpError) {
        let mut body = Map::new();
        match error.status() {
            Some(status) => {
                ctx.set_status(status);
                body.insert("name".to_string(), Value::from(error.name()));
                body.insert("message".to_string(), Value::from(error.to_string()));
                if let Some(details) = error.details() {
                    body.insert("details".to_string(), details.clone());
                }
            }
            None => {
                ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                body.insert("name".to_string(), Value::from("ServerError"));
                body.insert("message".to_string(), Value::from(GENERIC_SERVER_MESSAGE));
            }
        }

        ctx.set_body(Value::Object(body));
        ctx.state_mut().insert(ERROR_STATE_KEY, error);
    }
}

#[async_trait]
impl HttpHandler for ErrorHandler {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
        if let Err(error) = next.run(ctx).await {
            Self::present(ctx, error);
        }
        Ok(())
    }
}

/// One finished request, as reported to a [`RequestLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogEntry {
    pub method: Method,
    pub path: String,
    pub status: StatusCode,
    pub latency: Duration,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub actor: Option<String>,
    pub error_name: Option<String>,
    pub error_message: Option<String>,
}

/// Where [`StandardHandler`] sends its request log.
#[cfg_attr(test, mockall::automock)]
pub trait RequestLog: Send + Sync {
    fn record(&self, entry: &RequestLogEntry);
}

/// Logs requests through `tracing`: `error!` for 5xx, `info!` otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRequestLog;

impl RequestLog for TracingRequestLog {
    fn record(&self, entry: &RequestLogEntry) {
        let latency_ms = entry.latency.as_secs_f64() * 1000.0;
        let user_agent = entry.user_agent.as_deref().unwrap_or("");
        let request_id = entry.request_id.as_deref();
        let actor = entry.actor.as_deref();

        if entry.status.is_server_error() {
            error!(
                method = %entry.method,
                path = %entry.path,
                status = entry.status.as_u16(),
                latency_ms,
                user_agent,
                request_id,
                actor,
                error = entry.error_name.as_deref(),
                cause = entry.error_message.as_deref(),
                "http error"
            );
        } else if entry.error_name.is_some() {
            info!(
                method = %entry.method,
                path = %entry.path,
                status = entry.status.as_u16(),
                latency_ms,
                user_agent,
                request_id,
                actor,
                error = entry.error_name.as_deref(),
                cause = entry.error_message.as_deref(),
                "http error"
            );
        } else {
            info!(method = %entry.method, path = %entry.path, status = entry.status.as_u16(), latency_ms, user_agent, request_id, actor, "http request");
        }
    }
}

/// [`ErrorHandler`] plus request logging and a `Server-Timing` header.
/// Meant to sit first in the root chain.
#[derive(Clone)]
pub struct StandardHandler {
    errors: ErrorHandler,
    log: Arc<dyn RequestLog>,
}

impl StandardHandler {
    pub fn new() -> Self {
        Self::with_log(Arc::new(TracingRequestLog))
    }

    pub fn with_log(log: Arc<dyn RequestLog>) -> Self {
        Self { errors: ErrorHandler, log }
    }

    fn entry(ctx: &RequestContext, latency: Duration) -> RequestLogEntry {
        let error = ctx.state().get::<HttpError>(ERROR_STATE_KEY);
        RequestLogEntry {
            method: ctx.method().clone(),
            path: ctx.path().to_string(),
            status: ctx.status(),
            latency,
            user_agent: ctx.request_header(USER_AGENT).map(str::to_string),
            request_id: ctx.request_header(REQUEST_ID).map(str::to_string),
            actor: actor(ctx),
            error_name: error.map(|e| e.name().to_string()),
            error_message: error.map(ToString::to_string),
        }
    }
}

fn actor(ctx: &RequestContext) -> Option<String> {
    let state = ctx.state();
    state.get::<String>(ACTOR_STATE_KEY).cloned().or_else(|| state.get::<&'static str>(ACTOR_STATE_KEY).map(|actor| (*actor).to_string()))
}

impl Default for StandardHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StandardHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpHandler for StandardHandler {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
        let result = self.errors.handle(ctx, next).await;

        let latency = ctx.elapsed();
        self.log.record(&Self::entry(ctx, latency));

        if let Ok(value) = HeaderValue::from_str(&format!("total;dur={}", latency.as_millis())) {
            ctx.set_response_header(SERVER_TIMING, value);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::FutureExt;
    use http::Request;
    use http_body_util::{BodyExt, Empty};
    use onion_http::protocol::ParseError;
    use serde_json::json;

    use crate::body::Body;
    use crate::chain::{MiddlewareChain, handler_fn};

    fn context(path: &str) -> RequestContext {
        let body = Empty::<Bytes>::new().map_err(|never| -> ParseError { match never {} });
        let request = Request::get(path).header("user-agent", "tests/1.0").header(REQUEST_ID, "req-42").body(body).unwrap();
        RequestContext::new(request, 1024)
    }

    fn failing(error: fn() -> HttpError) -> impl HttpHandler {
        handler_fn(move |_ctx, _next| async move { Err(error()) }.boxed())
    }

    fn json_body(ctx: &RequestContext) -> Value {
        match ctx.body() {
            Body::Json(value) => value.clone(),
            other => panic!("expected json body, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn statused_errors_are_shown() {
        let chain = MiddlewareChain::builder()
            .add_last(ErrorHandler)
            .add_last(failing(|| HttpError::conflict("already exists").with_details(json!({"id": 7}))))
            .build();

        let mut ctx = context("/items");
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(&ctx), json!({"name": "ConflictError", "message": "already exists", "details": {"id": 7}}));
        assert!(ctx.state().contains(ERROR_STATE_KEY));
    }

    #[tokio::test]
    async fn unstatused_errors_are_hidden() {
        let chain = MiddlewareChain::builder()
            .add_last(ErrorHandler)
            .add_last(failing(|| HttpError::from_error(std::io::Error::other("secret connection string"))))
            .build();

        let mut ctx = context("/items");
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(&ctx), json!({"name": "ServerError", "message": "The request cannot be processed"}));
        let stored = ctx.state().get::<HttpError>(ERROR_STATE_KEY).unwrap();
        assert_eq!(stored.to_string(), "secret connection string");
    }

    #[tokio::test]
    async fn missing_route_becomes_404() {
        let chain = MiddlewareChain::builder().add_last(ErrorHandler).build();

        let mut ctx = context("/nowhere");
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(&ctx)["name"], "NotFoundError");
    }

    #[tokio::test]
    async fn standard_handler_logs_and_times() {
        let mut log = MockRequestLog::new();
        log.expect_record()
            .withf(|entry| {
                entry.status == StatusCode::FORBIDDEN
                    && entry.path == "/admin"
                    && entry.user_agent.as_deref() == Some("tests/1.0")
                    && entry.request_id.as_deref() == Some("req-42")
                    && entry.actor.as_deref() == Some("user-7")
                    && entry.error_name.as_deref() == Some("AccessDeniedError")
            })
            .times(1)
            .return_const(());

        let chain = MiddlewareChain::builder()
            .add_last(StandardHandler::with_log(Arc::new(log)))
            .add_last(failing(|| HttpError::access_denied("admins only")))
            .build();

        let mut ctx = context("/admin");
        ctx.state_mut().insert(ACTOR_STATE_KEY, "user-7".to_string());
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::FORBIDDEN);
        let timing = ctx.response_headers()[SERVER_TIMING].to_str().unwrap();
        assert!(timing.starts_with("total;dur="));
    }

    #[tokio::test]
    async fn standard_handler_logs_successful_requests() {
        let mut log = MockRequestLog::new();
        log.expect_record()
            .withf(|entry| entry.status == StatusCode::OK && entry.error_name.is_none() && entry.actor.as_deref() == Some("service"))
            .times(1)
            .return_const(());

        let ok = handler_fn(|ctx, _next| {
            async move {
                ctx.state_mut().insert(ACTOR_STATE_KEY, "service");
                ctx.set_status(StatusCode::OK);
                Ok(())
            }
            .boxed()
        });
        let chain = MiddlewareChain::builder().add_last(StandardHandler::with_log(Arc::new(log))).add_last(ok).build();

        chain.dispatch(&mut context("/")).await.unwrap();
    }
}
