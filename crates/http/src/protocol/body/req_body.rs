use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use tracing::{debug, error};

use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

type Decoded = Result<Message<(RequestHeader, PayloadSize)>, ParseError>;

/// Creates the two halves of a request body bound to the connection's decoded stream.
pub(crate) fn body_channel<S>(payload_stream: &mut S, payload_size: PayloadSize) -> (ReqBody, BodySender<'_, S>)
where
    S: Stream<Item = Decoded> + Unpin,
{
    let (demand_tx, demand_rx) = mpsc::channel(1);
    let (data_tx, data_rx) = mpsc::channel(1);

    let body = ReqBody { demand: demand_tx, data: data_rx, payload_size, waiting: false, finished: payload_size.is_empty() };
    let sender = BodySender { payload_stream, demand: demand_rx, data: data_tx, eof: payload_size.is_empty() };

    (body, sender)
}

/// Producer half: reads payload items from the connection on demand.
pub(crate) struct BodySender<'conn, S> {
    payload_stream: &'conn mut S,
    demand: mpsc::Receiver<()>,
    data: mpsc::Sender<Result<PayloadItem, ParseError>>,
    eof: bool,
}

impl<S> BodySender<'_, S>
where
    S: Stream<Item = Decoded> + Unpin,
{
    /// Serves read requests from the body until it reaches EOF, fails, or is dropped.
    pub(crate) async fn serve(&mut self) -> Result<(), ParseError> {
        while !self.eof {
            if self.demand.next().await.is_none() {
                // body dropped by the handler
                return Ok(());
            }

            let item = self.read_item().await;
            let failed = item.is_err();
            if let Ok(payload_item) = &item {
                self.eof = payload_item.is_eof();
            }

            if self.data.send(item).await.is_err() {
                debug!("request body dropped while data was in flight");
                return Ok(());
            }

            if failed {
                return Err(ParseError::body("request body stream failed"));
            }
        }

        Ok(())
    }

    /// Discards body bytes that can be decoded without waiting on the peer, up to
    /// `budget` bytes. Returns whether the body reached EOF, in which case the next
    /// request head starts at the right offset.
    pub(crate) fn skip_available(&mut self, budget: usize) -> Result<bool, ParseError> {
        let mut skipped = 0usize;
        while !self.eof && skipped <= budget {
            let Some(item) = self.read_item().now_or_never() else { break };
            match item? {
                PayloadItem::Chunk(bytes) => skipped += bytes.len(),
                PayloadItem::Eof => self.eof = true,
            }
        }

        if skipped > 0 {
            debug!(size = skipped, eof = self.eof, "skipped unread request body");
        }
        Ok(self.eof)
    }

    #[cfg(test)]
    pub(crate) fn is_eof(&self) -> bool {
        self.eof
    }

    async fn read_item(&mut self) -> Result<PayloadItem, ParseError> {
        match self.payload_stream.next().await {
            Some(Ok(Message::Payload(payload_item))) => Ok(payload_item),
            Some(Ok(Message::Header(_))) => {
                error!("received a request head while reading a body");
                Err(ParseError::body("unexpected request head inside body"))
            }
            Some(Err(e)) => Err(e),
            None => Err(ParseError::body("connection closed before the body was complete")),
        }
    }
}

/// The request body seen by handlers; implements [`http_body::Body`].
#[derive(Debug)]
pub struct ReqBody {
    demand: mpsc::Sender<()>,
    data: mpsc::Receiver<Result<PayloadItem, ParseError>>,
    payload_size: PayloadSize,
    waiting: bool,
    finished: bool,
}

impl ReqBody {
    pub fn payload_size(&self) -> PayloadSize {
        self.payload_size
    }
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }

        if !this.waiting {
            match Pin::new(&mut this.demand).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if Pin::new(&mut this.demand).start_send(()).is_err() {
                        this.finished = true;
                        return Poll::Ready(Some(Err(ParseError::body("connection stopped serving the body"))));
                    }
                    this.waiting = true;
                }
                Poll::Ready(Err(_closed)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(ParseError::body("connection stopped serving the body"))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.data.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(PayloadItem::Chunk(bytes)))) => {
                this.waiting = false;
                Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            Poll::Ready(Some(Ok(PayloadItem::Eof))) => {
                this.waiting = false;
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.waiting = false;
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(ParseError::body("connection stopped serving the body"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished
    }

    fn size_hint(&self) -> SizeHint {
        self.payload_size.into()
    }
}
