//! A small server showing the middleware chain end to end.
//!
//! Run with `HTTP_PORT=8080 cargo run --example chain_server`, then:
//!
//! ```text
//! curl -i localhost:8080/hello?name=onion
//! curl -i -X POST -H 'content-type: application/json' -d '{"a":1}' localhost:8080/echo
//! curl -i localhost:8080/admin
//! ```
//!
//! Ctrl-C drains in-flight requests before exiting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use http::{HeaderName, HeaderValue, StatusCode};
use onion_web::{BodyType, HttpError, HttpHandler, MiddlewareChain, Next, RequestBody, RequestContext, Server, ServerConfig, StandardHandler, handler_fn};
use serde_json::json;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Tags every response with a sequential request id.
struct RequestCounter {
    next: AtomicU64,
}

#[async_trait]
impl HttpHandler for RequestCounter {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        ctx.state_mut().insert("request-id", id);
        let result = next.run(ctx).await;
        ctx.set_response_header(HeaderName::from_static("x-request-number"), HeaderValue::from(id));
        result
    }
}

fn routes() -> MiddlewareChain {
    let hello = handler_fn(|ctx, next| {
        async move {
            if ctx.path() != "/hello" {
                return next.run(ctx).await;
            }
            let name = ctx.query().get("name").unwrap_or("world").to_string();
            ctx.set_status(StatusCode::OK);
            ctx.set_body(format!("hello {name}"));
            Ok(())
        }
        .boxed()
    });

    let echo = handler_fn(|ctx, next| {
        async move {
            if ctx.path() != "/echo" {
                return next.run(ctx).await;
            }
            let echoed = match ctx.read_request_body(BodyType::Auto).await? {
                RequestBody::Json(value) => value.clone(),
                RequestBody::Text(text) => json!({ "text": text }),
                RequestBody::Form(form) => json!(form),
                RequestBody::Raw(bytes) => json!({ "bytes": bytes.len() }),
                RequestBody::None => json!(null),
            };
            ctx.set_status(StatusCode::OK);
            ctx.set_body(echoed);
            Ok(())
        }
        .boxed()
    });

    let admin = handler_fn(|ctx, next| {
        async move {
            if ctx.path().starts_with("/admin") {
                return Err(HttpError::access_denied("admins only"));
            }
            next.run(ctx).await
        }
        .boxed()
    });

    MiddlewareChain::builder().add_last(admin).add_last(hello).add_last(echo).build()
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(cause = %e, "invalid configuration");
            return;
        }
    };

    let root = MiddlewareChain::builder()
        .add_last(StandardHandler::new())
        .add_last(RequestCounter { next: AtomicU64::new(1) })
        .add_shared(Arc::new(routes()))
        .build();

    let server = Server::new(config, root);
    if let Err(e) = server.start().await {
        error!(cause = %e, "can't start");
        return;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(cause = %e, "can't listen for ctrl-c");
    }
    info!("shutting down");
    server.stop().await;
}
