//! Onion-style middleware composition.
//!
//! Every [`HttpHandler`] receives the request context and a [`Next`]
//! continuation standing for the rest of the chain. Code before
//! `next.run(ctx)` runs on the way in, code after it on the way out, and not
//! calling it at all short-circuits the chain. `Next` is consumed when run,
//! so a handler can't invoke the rest of the chain twice.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::context::RequestContext;
use crate::error::HttpError;

#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError>;
}

/// The remainder of a chain, as seen by one handler.
pub struct Next<'a> {
    handlers: &'a [Arc<dyn HttpHandler>],
    outer: Option<Box<Next<'a>>>,
}

impl Next<'static> {
    /// The end of every chain: fails with [`HttpError::NotFound`].
    pub fn terminal() -> Self {
        Next { handlers: &[], outer: None }
    }
}

impl<'a> Next<'a> {
    /// Runs the rest of the chain.
    pub fn run<'c>(self, ctx: &'c mut RequestContext) -> BoxFuture<'c, Result<(), HttpError>>
    where
        'a: 'c,
    {
        match self.handlers.split_first() {
            Some((handler, rest)) => handler.handle(ctx, Next { handlers: rest, outer: self.outer }),
            None => match self.outer {
                Some(outer) => outer.run(ctx),
                None => {
                    let error = HttpError::NotFound { method: ctx.method().clone(), path: ctx.path().to_string() };
                    future::ready(Err(error)).boxed()
                }
            },
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").field("remaining", &self.handlers.len()).field("nested", &self.outer.is_some()).finish()
    }
}

/// An ordered list of handlers, composed once and shared by every request.
///
/// A chain is itself a handler; when nested, the inner chain falls through to
/// the outer chain's continuation.
#[derive(Clone)]
pub struct MiddlewareChain {
    handlers: Arc<[Arc<dyn HttpHandler>]>,
}

impl MiddlewareChain {
    pub fn new(handlers: Vec<Arc<dyn HttpHandler>>) -> Self {
        Self { handlers: handlers.into() }
    }

    pub fn builder() -> ChainBuilder {
        ChainBuilder { handlers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the chain with the terminal continuation after its last handler.
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<(), HttpError> {
        Next { handlers: &self.handlers, outer: None }.run(ctx).await
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareChain").field("len", &self.handlers.len()).finish()
    }
}

#[async_trait]
impl HttpHandler for MiddlewareChain {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
        Next { handlers: &self.handlers, outer: Some(Box::new(next)) }.run(ctx).await
    }
}

pub struct ChainBuilder {
    handlers: Vec<Arc<dyn HttpHandler>>,
}

impl ChainBuilder {
    #[must_use]
    pub fn add_last<H: HttpHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn add_first<H: HttpHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.insert(0, Arc::new(handler));
        self
    }

    #[must_use]
    pub fn add_shared(mut self, handler: Arc<dyn HttpHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> MiddlewareChain {
        MiddlewareChain::new(self.handlers)
    }
}

impl fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBuilder").field("len", &self.handlers.len()).finish()
    }
}

/// A handler backed by a closure returning a boxed future.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a closure as an [`HttpHandler`]:
///
/// ```
/// use futures::FutureExt;
/// use http::StatusCode;
/// use onion_web::handler_fn;
///
/// let hello = handler_fn(|ctx, _next| {
///     async move {
///         ctx.set_status(StatusCode::OK);
///         ctx.set_body("hello");
///         Ok(())
///     }
///     .boxed()
/// });
/// # let _ = hello;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, Result<(), HttpError>> + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> HttpHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, Result<(), HttpError>> + Send + Sync,
{
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
        (self.f)(ctx, next).await
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::Bytes;
    use http::{Method, Request, StatusCode};
    use http_body_util::Empty;
    use http_body_util::BodyExt;
    use onion_http::protocol::ParseError;

    type Events = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        events: Events,
    }

    #[async_trait]
    impl HttpHandler for Recorder {
        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<(), HttpError> {
            self.events.lock().unwrap().push(format!("{}-start", self.name));
            let result = next.run(ctx).await;
            self.events.lock().unwrap().push(format!("{}-end", self.name));
            result
        }
    }

    struct Endpoint {
        events: Events,
    }

    #[async_trait]
    impl HttpHandler for Endpoint {
        async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> Result<(), HttpError> {
            self.events.lock().unwrap().push("Endpoint-start".to_string());
            ctx.set_status(StatusCode::OK);
            self.events.lock().unwrap().push("Endpoint-end".to_string());
            Ok(())
        }
    }

    fn context() -> RequestContext {
        let body = Empty::<Bytes>::new().map_err(|never| -> ParseError { match never {} });
        RequestContext::new(Request::get("/chain").body(body).unwrap(), 1024)
    }

    fn recorder(name: &'static str, events: &Events) -> Recorder {
        Recorder { name, events: Arc::clone(events) }
    }

    fn events(events: &Events) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn handlers_unwind_in_reverse_order() {
        let log = Events::default();
        let chain = MiddlewareChain::builder()
            .add_last(recorder("A", &log))
            .add_last(recorder("B", &log))
            .add_last(Endpoint { events: Arc::clone(&log) })
            .build();

        let mut ctx = context();
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(events(&log), ["A-start", "B-start", "Endpoint-start", "Endpoint-end", "B-end", "A-end"]);
        assert_eq!(ctx.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn short_circuit_skips_downstream() {
        let log = Events::default();
        let chain = MiddlewareChain::builder()
            .add_last(recorder("A", &log))
            .add_last(Endpoint { events: Arc::clone(&log) })
            .add_last(recorder("never", &log))
            .build();

        chain.dispatch(&mut context()).await.unwrap();

        assert_eq!(events(&log), ["A-start", "Endpoint-start", "Endpoint-end", "A-end"]);
    }

    #[tokio::test]
    async fn falling_off_the_end_is_not_found() {
        let log = Events::default();
        let chain = MiddlewareChain::builder().add_last(recorder("A", &log)).build();

        let error = chain.dispatch(&mut context()).await.unwrap_err();

        assert!(matches!(&error, HttpError::NotFound { method, path } if *method == Method::GET && path == "/chain"));
        assert_eq!(events(&log), ["A-start", "A-end"]);
    }

    #[tokio::test]
    async fn empty_chain_is_terminal() {
        let error = MiddlewareChain::new(Vec::new()).dispatch(&mut context()).await.unwrap_err();
        assert!(matches!(error, HttpError::NotFound { .. }));
    }

    #[tokio::test]
    async fn nested_chain_continues_into_outer_chain() {
        let log = Events::default();
        let inner = MiddlewareChain::builder().add_last(recorder("inner-1", &log)).add_last(recorder("inner-2", &log)).build();
        let outer = MiddlewareChain::builder()
            .add_last(recorder("outer", &log))
            .add_last(inner)
            .add_last(Endpoint { events: Arc::clone(&log) })
            .build();

        outer.dispatch(&mut context()).await.unwrap();

        assert_eq!(
            events(&log),
            ["outer-start", "inner-1-start", "inner-2-start", "Endpoint-start", "Endpoint-end", "inner-2-end", "inner-1-end", "outer-end"]
        );
    }

    #[tokio::test]
    async fn upstream_handler_catches_downstream_error() {
        let log = Events::default();
        let catcher = handler_fn(|ctx, next| {
            async move {
                if next.run(ctx).await.is_err() {
                    ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.set_body("caught");
                }
                Ok(())
            }
            .boxed()
        });
        let thrower = handler_fn(|_ctx, _next| async { Err(HttpError::conflict("boom")) }.boxed());
        let chain = MiddlewareChain::builder()
            .add_last(catcher)
            .add_last(thrower)
            .add_last(Endpoint { events: Arc::clone(&log) })
            .build();

        let mut ctx = context();
        chain.dispatch(&mut ctx).await.unwrap();

        assert_eq!(ctx.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(events(&log).is_empty());
    }
}
