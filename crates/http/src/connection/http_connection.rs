use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT};
use http::{HeaderValue, Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Empty};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::connection::{ConnectionAction, ConnectionObserver, NoopObserver};
use crate::handler::Handler;
use crate::protocol::body::body_channel;
use crate::protocol::{HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHeader, ResponseHead, SendError};

const READ_BUFFER_SIZE: usize = 8 * 1024;
/// Unread body bytes discarded to keep a connection alive; beyond this it is closed.
const DRAIN_BUDGET: usize = 64 * 1024;

type Decoded = Option<Result<Message<(RequestHeader, PayloadSize)>, ParseError>>;

enum Incoming {
    Decoded(Decoded),
    IdleTimeout,
    CloseRequested,
}

/// Serves HTTP/1.1 requests from one socket, one request at a time.
///
/// The request body is streamed to the handler while it runs. Unread body bytes
/// that have already arrived are drained so the connection can be reused; a body
/// still in flight when the handler returns gets a `Connection: close` response
/// and the socket is not read again.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
    idle_timeout: Option<Duration>,
    close_signal: CancellationToken,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(reader, RequestDecoder::new(), READ_BUFFER_SIZE),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            idle_timeout: None,
            close_signal: CancellationToken::new(),
        }
    }

    /// Closes the connection when no request head arrives within `timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Closes the connection once `signal` is cancelled and the socket is between requests.
    /// A request already in progress is finished first.
    #[must_use]
    pub fn with_close_signal(mut self, signal: CancellationToken) -> Self {
        self.close_signal = signal;
        self
    }

    pub async fn process<H>(self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler,
        H::RespBody: Body<Data = Bytes> + Unpin,
        <H::RespBody as Body>::Error: Display,
    {
        self.process_observed(handler, &NoopObserver).await
    }

    pub async fn process_observed<H, O>(mut self, handler: Arc<H>, observer: &O) -> Result<(), HttpError>
    where
        H: Handler,
        H::RespBody: Body<Data = Bytes> + Unpin,
        <H::RespBody as Body>::Error: Display,
        O: ConnectionObserver + ?Sized,
    {
        loop {
            match self.next_request().await {
                Incoming::Decoded(Some(Ok(Message::Header((header, payload_size))))) => {
                    observer.request_started();
                    let outcome = self.do_process(header, payload_size, handler.as_ref()).await;
                    let action = observer.response_finished();

                    if !outcome? || action == ConnectionAction::Close {
                        return self.shutdown().await;
                    }
                }

                Incoming::Decoded(Some(Ok(Message::Payload(_)))) => {
                    error!("received body bytes while waiting for a request head");
                    self.send_bad_request().await;
                    return Err(ParseError::body("body bytes without a request head").into());
                }

                Incoming::Decoded(Some(Err(e))) => {
                    warn!(cause = %e, "can't decode request");
                    self.send_bad_request().await;
                    return Err(e.into());
                }

                Incoming::Decoded(None) => {
                    debug!("peer closed the connection");
                    return Ok(());
                }

                Incoming::IdleTimeout => {
                    info!("connection idle for too long, closing");
                    return self.shutdown().await;
                }

                Incoming::CloseRequested => {
                    debug!("closing idle connection on request");
                    return self.shutdown().await;
                }
            }
        }
    }

    async fn next_request(&mut self) -> Incoming {
        let close_signal = self.close_signal.clone();
        let read = async {
            match self.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, self.framed_read.next()).await {
                    Ok(decoded) => Incoming::Decoded(decoded),
                    Err(_elapsed) => Incoming::IdleTimeout,
                },
                None => Incoming::Decoded(self.framed_read.next().await),
            }
        };

        select! {
            biased;
            () = close_signal.cancelled() => Incoming::CloseRequested,
            incoming = read => incoming,
        }
    }

    /// Runs one exchange. Returns whether the connection may serve another request.
    async fn do_process<H>(&mut self, header: RequestHeader, payload_size: PayloadSize, handler: &H) -> Result<bool, HttpError>
    where
        H: Handler,
        H::RespBody: Body<Data = Bytes> + Unpin,
        <H::RespBody as Body>::Error: Display,
    {
        if !payload_size.is_empty() && expects_continue(&header) {
            let writer = self.framed_write.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::from)?;
            writer.flush().await.map_err(SendError::from)?;
            debug!("sent 100 continue");
        }

        let is_head = header.is_head();
        let mut keep_alive = !header.wants_close();

        let (req_body, mut body_sender) = body_channel(&mut self.framed_read, payload_size);
        let request = header.body(req_body);

        // The handler and the body sender must be polled together: the handler
        // may be waiting on body bytes that only the sender can read.
        let response_result = {
            let handler_future = handler.call(request);
            let serve_future = body_sender.serve();
            tokio::pin!(handler_future, serve_future);

            let mut serving = true;
            loop {
                select! {
                    biased;
                    response = &mut handler_future => break response,
                    served = &mut serve_future, if serving => {
                        serving = false;
                        if let Err(e) = served {
                            warn!(cause = %e, "request body stream failed");
                        }
                    }
                }
            }
        };

        match body_sender.skip_available(DRAIN_BUDGET) {
            Ok(true) => {}
            Ok(false) => {
                debug!("request body left unread, closing after the response");
                keep_alive = false;
            }
            Err(e) => {
                warn!(cause = %e, "can't drain request body");
                keep_alive = false;
            }
        }
        drop(body_sender);

        let reusable = match response_result {
            Ok(response) => self.do_send_response(response, is_head, !keep_alive).await?,
            Err(e) => {
                let cause: Box<dyn Error + Send + Sync> = e.into();
                error!(%cause, "handler failed without a response");
                self.do_send_response(status_only(StatusCode::INTERNAL_SERVER_ERROR), is_head, true).await?
            }
        };

        Ok(keep_alive && reusable)
    }

    /// Writes a response. Returns whether its framing lets the connection be reused.
    async fn do_send_response<T>(&mut self, response: Response<T>, is_head: bool, close: bool) -> Result<bool, HttpError>
    where
        T: Body + Unpin,
        T::Error: Display,
    {
        let (mut parts, mut body) = response.into_parts();

        let payload_size = if is_head { PayloadSize::Empty } else { PayloadSize::from(body.size_hint()) };

        let status = parts.status;
        let status_allows_body = !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED);
        // a bodyless message without content-length can only be ended by closing
        let close_delimited = payload_size.is_empty() && status_allows_body && !is_head && !parts.headers.contains_key(CONTENT_LENGTH);

        let reusable = !close && !close_delimited;
        if !reusable {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let head = ResponseHead::from_parts(parts, ());
        self.framed_write.feed(Message::<_, T::Data>::Header((head, payload_size))).await?;

        if !payload_size.is_empty() {
            let flush_each_frame = payload_size.is_chunked();
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| SendError::body(format!("response body failed: {e}")))?;
                // trailers are not sent
                let Ok(data) = frame.into_data() else { continue };

                let item = Message::<(ResponseHead, PayloadSize), T::Data>::Payload(PayloadItem::Chunk(data));
                if flush_each_frame {
                    self.framed_write.send(item).await?;
                } else {
                    self.framed_write.feed(item).await?;
                }
            }
        }

        self.framed_write.send(Message::<(ResponseHead, PayloadSize), T::Data>::Payload(PayloadItem::Eof)).await?;
        Ok(reusable)
    }

    async fn send_bad_request(&mut self) {
        if let Err(e) = self.do_send_response(status_only(StatusCode::BAD_REQUEST), false, true).await {
            debug!(cause = %e, "can't send bad request response");
        }
    }

    async fn shutdown(&mut self) -> Result<(), HttpError> {
        if let Err(e) = self.framed_write.get_mut().shutdown().await {
            debug!(cause = %e, "error while shutting down connection");
        }
        Ok(())
    }
}

fn expects_continue(header: &RequestHeader) -> bool {
    header.headers().get(EXPECT).is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

fn status_only(status: StatusCode) -> Response<Empty<Bytes>> {
    let mut response = Response::new(Empty::new());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http::Request;
    use http_body_util::Full;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf, duplex};
    use tokio::task::JoinHandle;

    use crate::handler::make_handler;
    use crate::protocol::body::ReqBody;

    type BoxError = Box<dyn Error + Send + Sync>;

    async fn echo(request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
        let path = request.uri().path().to_string();
        let body = request.into_body().collect().await?.to_bytes();
        let text = format!("{path}:{}", String::from_utf8_lossy(&body));
        Ok(Response::new(Full::new(Bytes::from(text))))
    }

    async fn ignore_body(_request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
        Ok(Response::new(Full::new(Bytes::from_static(b"ignored"))))
    }

    async fn too_large(_request: Request<ReqBody>) -> Result<Response<Full<Bytes>>, BoxError> {
        let mut response = Response::new(Full::new(Bytes::from_static(b"too large")));
        *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
        Ok(response)
    }

    async fn no_body(_request: Request<ReqBody>) -> Result<Response<Empty<Bytes>>, BoxError> {
        Ok(Response::new(Empty::new()))
    }

    type TestConnection = HttpConnection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn serve<F, Fut, B>(f: F, configure: impl FnOnce(TestConnection) -> TestConnection) -> (DuplexStream, JoinHandle<Result<(), HttpError>>)
    where
        F: Fn(Request<ReqBody>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<B>, BoxError>> + Send + 'static,
        B: Body<Data = Bytes> + Unpin + Send + 'static,
        B::Error: Display + Send,
    {
        let (client, server) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let connection = configure(HttpConnection::new(reader, writer));
        let handle = tokio::spawn(connection.process(Arc::new(make_handler(f))));
        (client, handle)
    }

    async fn read_to_end(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_keep_alive_requests_in_order() {
        let (mut client, handle) = serve(echo, |c| c);
        let requests = "POST /first HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /second HTTP/1.1\r\nConnection: close\r\n\r\n";
        client.write_all(requests.as_bytes()).await.unwrap();

        let output = read_to_end(&mut client).await;
        let first = output.find("/first:hello").unwrap();
        let second = output.find("/second:").unwrap();
        assert!(first < second);
        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(output.contains("connection: close"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unread_body_is_drained_before_next_request() {
        let (mut client, handle) = serve(ignore_body, |c| c);
        let requests = "POST /a HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nGET /b HTTP/1.1\r\nConnection: close\r\n\r\n";
        client.write_all(requests.as_bytes()).await.unwrap();

        let output = read_to_end(&mut client).await;
        assert_eq!(output.matches("ignored").count(), 2);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn rejection_is_sent_before_the_body_arrives() {
        let (mut client, handle) = serve(too_large, |c| c.with_idle_timeout(Duration::from_secs(5)));
        client.write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 100000000\r\n\r\n0123456789").await.unwrap();

        let output = tokio::time::timeout(Duration::from_secs(1), read_to_end(&mut client)).await.unwrap();
        assert!(output.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(output.contains("connection: close"));
        assert!(output.ends_with("too large"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bodyless_response_is_close_delimited() {
        let (mut client, handle) = serve(no_body, |c| c);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let output = read_to_end(&mut client).await;
        assert_eq!(output, "HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n");
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn expect_continue_is_answered() {
        let (mut client, handle) = serve(echo, |c| c);
        client
            .write_all(b"PUT /up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();

        let output = read_to_end(&mut client).await;
        assert!(output.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert!(output.ends_with("/up:ok"));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn malformed_request_gets_bad_request() {
        let (mut client, handle) = serve(echo, |c| c);
        client.write_all(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n").await.unwrap();

        let output = read_to_end(&mut client).await;
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn close_signal_ends_idle_connection() {
        let signal = CancellationToken::new();
        let connection_signal = signal.clone();
        let (mut client, handle) = serve(echo, move |c| c.with_close_signal(connection_signal));

        client.write_all(b"GET /one HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("/one:"));

        signal.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(read_to_end(&mut client).await, "");
    }

    #[tokio::test]
    async fn idle_timeout_closes_connection() {
        let (mut client, handle) = serve(echo, |c| c.with_idle_timeout(Duration::from_millis(50)));

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(read_to_end(&mut client).await, "");
    }

    #[derive(Default)]
    struct CountingObserver {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionObserver for CountingObserver {
        fn request_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn response_finished(&self) -> ConnectionAction {
            self.finished.fetch_add(1, Ordering::SeqCst);
            ConnectionAction::Close
        }
    }

    #[tokio::test]
    async fn observer_sees_each_exchange_and_may_close() {
        let (mut client, server) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let observer = Arc::new(CountingObserver::default());
        let task_observer = Arc::clone(&observer);
        let handle = tokio::spawn(async move {
            HttpConnection::new(reader, writer).process_observed(Arc::new(make_handler(echo)), task_observer.as_ref()).await
        });

        client.write_all(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").await.unwrap();
        let output = read_to_end(&mut client).await;

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(output.matches("HTTP/1.1 200 OK").count(), 1);
        assert!(output.ends_with("/a:"));
        assert_eq!(observer.started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.finished.load(Ordering::SeqCst), 1);
    }
}
