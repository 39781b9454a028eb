/// What the connection should do once a response is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    KeepAlive,
    Close,
}

/// Per-connection lifecycle hooks.
///
/// `request_started` fires when a request head has been decoded and
/// `response_finished` after the matching response has been flushed, so the
/// two calls always come in pairs for a request that reaches a handler.
pub trait ConnectionObserver: Send + Sync {
    fn request_started(&self) {}

    fn response_finished(&self) -> ConnectionAction {
        ConnectionAction::KeepAlive
    }
}

/// Observer that never asks for a close.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
