//! `Transfer-Encoding: chunked` framing, RFC 9112 section 7.1.

use std::io::Write;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::codec::FastWrite;
use crate::protocol::{ParseError, PayloadItem, SendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    Done,
}

/// Byte-at-a-time decoder for chunked bodies. Extensions and trailers are
/// validated for shape and then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, remaining: 0 }
    }

    fn advance(&mut self, byte: u8) -> Result<State, ParseError> {
        use State::{DataCr, DataLf, Done, EndCr, EndLf, Extension, Size, SizeLf, SizeLws, Trailer, TrailerLf};

        let next = match (self.state, byte) {
            (Size, b) if b.is_ascii_hexdigit() => {
                self.remaining = self
                    .remaining
                    .checked_mul(16)
                    .and_then(|n| n.checked_add(hex_value(b)))
                    .ok_or_else(|| ParseError::body("chunk size overflows u64"))?;
                Size
            }
            (Size | SizeLws, b'\t' | b' ') => SizeLws,
            (Size | SizeLws | Extension, b';') => Extension,
            (Size | SizeLws | Extension, b'\r') => SizeLf,
            (Extension, b'\n') => return Err(ParseError::body("bare newline in chunk extension")),
            (Extension, _) => Extension,
            (SizeLf, b'\n') if self.remaining == 0 => EndCr,
            (SizeLf, b'\n') => State::Data,
            (DataCr, b'\r') => DataLf,
            (DataLf, b'\n') => Size,
            (EndCr, b'\r') => EndLf,
            (EndCr | Trailer, _) if byte != b'\r' => Trailer,
            (Trailer, b'\r') => TrailerLf,
            (TrailerLf, b'\n') => EndCr,
            (EndLf, b'\n') => Done,
            (state, byte) => return Err(ParseError::body(format!("unexpected byte {byte:#04x} in chunk state {state:?}"))),
        };
        Ok(next)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(b: u8) -> u64 {
    let value = match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    };
    u64::from(value)
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Done => {
                    trace!("finished reading chunked body");
                    return Ok(Some(PayloadItem::Eof));
                }
                State::Data => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let len = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(src.len());
                    let bytes = src.split_to(len).freeze();
                    self.remaining -= bytes.len() as u64;
                    if self.remaining == 0 {
                        self.state = State::DataCr;
                    }
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }
                _ => {
                    let Some(&byte) = src.first() else {
                        return Ok(None);
                    };
                    src.advance(1);
                    self.state = self.advance(byte)?;
                }
            }
        }
    }
}

/// Frames each data item as one chunk; `Eof` writes the terminating zero chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedEncoder {
    eof: bool,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            // an empty chunk would read as the terminator
            PayloadItem::Chunk(bytes) if !bytes.has_remaining() => Ok(()),
            PayloadItem::Chunk(mut bytes) => {
                dst.reserve(bytes.remaining() + 12);
                write!(FastWrite(dst), "{:X}\r\n", bytes.remaining())?;
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
                dst.extend_from_slice(b"\r\n");
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}
