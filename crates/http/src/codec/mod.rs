//! HTTP/1.1 codecs for `tokio_util::codec::{FramedRead, FramedWrite}`.
//!
//! [`RequestDecoder`] turns socket bytes into a request head plus body items;
//! [`ResponseEncoder`] does the reverse for responses. Body framing
//! (content-length, chunked, or none) is chosen per message from a
//! [`PayloadSize`](crate::protocol::PayloadSize).

mod chunked;
mod header;
mod payload;
mod request_decoder;
mod response_encoder;

use std::io;

use bytes::{BufMut, BytesMut};

pub use header::{HeaderDecoder, HeaderEncoder};
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;

/// `io::Write` over a `BytesMut`, for `write!` into an already reserved buffer.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
