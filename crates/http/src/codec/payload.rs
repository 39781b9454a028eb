//! Body framing selected per message.

use std::cmp;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::chunked::{ChunkedDecoder, ChunkedEncoder};
use crate::protocol::{ParseError, PayloadItem, PayloadSize, SendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadDecoder {
    Length(u64),
    Chunked(ChunkedDecoder),
    Empty,
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => PayloadDecoder::Length(length),
            PayloadSize::Chunked => PayloadDecoder::Chunked(ChunkedDecoder::new()),
            PayloadSize::Empty => PayloadDecoder::Empty,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            PayloadDecoder::Length(0) | PayloadDecoder::Empty => Ok(Some(PayloadItem::Eof)),
            PayloadDecoder::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = cmp::min(*remaining, src.len() as u64);
                let bytes = src.split_to(usize::try_from(len).unwrap_or(usize::MAX)).freeze();
                *remaining -= bytes.len() as u64;
                Ok(Some(PayloadItem::Chunk(bytes)))
            }
            PayloadDecoder::Chunked(decoder) => decoder.decode(src),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PayloadEncoder {
    Length(u64),
    Chunked(ChunkedEncoder),
    Empty,
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => PayloadEncoder::Length(length),
            PayloadSize::Chunked => PayloadEncoder::Chunked(ChunkedEncoder::new()),
            PayloadSize::Empty => PayloadEncoder::Empty,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            PayloadEncoder::Length(remaining) => match item {
                PayloadItem::Chunk(mut bytes) => {
                    let len = bytes.remaining() as u64;
                    if len > *remaining {
                        return Err(SendError::body("body is longer than its content-length"));
                    }
                    *remaining -= len;
                    while bytes.has_remaining() {
                        let chunk = bytes.chunk();
                        let n = chunk.len();
                        dst.extend_from_slice(chunk);
                        bytes.advance(n);
                    }
                    Ok(())
                }
                PayloadItem::Eof if *remaining > 0 => Err(SendError::body("body is shorter than its content-length")),
                PayloadItem::Eof => Ok(()),
            },
            PayloadEncoder::Chunked(encoder) => encoder.encode(item, dst),
            PayloadEncoder::Empty => Ok(()),
        }
    }
}
