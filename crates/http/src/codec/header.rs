//! Request head parsing and response head serialization.

use std::io::{self, ErrorKind, Write};

use bytes::{BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version, header};
use httparse::Status;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, trace};

use crate::codec::FastWrite;
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader, ResponseHead, SendError};

pub(crate) const MAX_HEADER_NUM: usize = 64;

pub(crate) const MAX_HEADER_BYTES: usize = 8 * 1024;

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Decodes a request head and picks the framing of the body that follows it.
#[derive(Debug, Default)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // "GET / HTTP/1.1\r\n" is the shortest request line worth parsing
        if src.len() < 14 {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let body_offset = match req.parse(src).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::TooManyHeaders { limit: MAX_HEADER_NUM },
            e => ParseError::header(e),
        })? {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::HeadTooLarge { size: src.len(), limit: MAX_HEADER_BYTES });
                return Ok(None);
            }
        };
        trace!(head_size = body_offset, "parsed request head");
        ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::HeadTooLarge { size: body_offset, limit: MAX_HEADER_BYTES });

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            other => return Err(ParseError::Version(other)),
        };
        let method = req.method.ok_or(ParseError::Method)?;
        let method = Method::from_bytes(method.as_bytes()).map_err(|_invalid| ParseError::Method)?;
        let uri = req.path.ok_or(ParseError::Target)?.parse::<Uri>().map_err(|_invalid| ParseError::Target)?;

        // remember where each name and value lives so they can share the frozen buffer
        let base = src.as_ptr() as usize;
        let ranges: Vec<_> = req
            .headers
            .iter()
            .map(|h| {
                let name_start = h.name.as_ptr() as usize - base;
                let value_start = h.value.as_ptr() as usize - base;
                (name_start..name_start + h.name.len(), value_start..value_start + h.value.len())
            })
            .collect();

        let head_bytes = src.split_to(body_offset).freeze();
        let mut header_map = HeaderMap::with_capacity(ranges.len());
        for (name, value) in ranges {
            let name = HeaderName::from_bytes(&head_bytes[name]).map_err(ParseError::header)?;
            let value = HeaderValue::from_maybe_shared(head_bytes.slice(value)).map_err(ParseError::header)?;
            header_map.append(name, value);
        }

        let mut request = Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = header_map;

        let header = RequestHeader::from(request);
        let payload_size = parse_payload(&header)?;
        Ok(Some((header, payload_size)))
    }
}

/// Body framing per RFC 9112 section 6.
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let headers = header.headers();
    match (headers.get(http::header::TRANSFER_ENCODING), headers.get(http::header::CONTENT_LENGTH)) {
        (None, None) => Ok(PayloadSize::Empty),
        (Some(coding), None) if is_chunked(coding) => Ok(PayloadSize::Chunked),
        (Some(_), None) => Err(ParseError::header("transfer-encoding must end with chunked")),
        (None, Some(length)) => {
            let text = length.to_str().map_err(|_not_ascii| ParseError::content_length("value is not ascii"))?;
            let length = text.trim().parse::<u64>().map_err(|_not_number| ParseError::content_length(format!("{text:?} is not a length")))?;
            Ok(PayloadSize::Length(length))
        }
        (Some(_), Some(_)) => Err(ParseError::content_length("transfer-encoding and content-length both present")),
    }
}

/// `chunked` must be the final transfer coding.
fn is_chunked(value: &HeaderValue) -> bool {
    value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}

/// Writes the status line and headers of a response.
///
/// `Length` and `Chunked` framing overwrite `Content-Length` / `Transfer-Encoding`;
/// `Empty` leaves the header map exactly as given.
#[derive(Debug, Default)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        if head.version() != Version::HTTP_11 {
            error!(http_version = ?head.version(), "unsupported response version");
            return Err(io::Error::from(ErrorKind::Unsupported).into());
        }

        dst.reserve(INIT_HEADER_SIZE);
        let status = head.status();
        write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        let headers = head.headers_mut();
        match payload_size {
            PayloadSize::Length(n) => {
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
            }
            PayloadSize::Chunked => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            }
            PayloadSize::Empty => {}
        }

        for (name, value) in headers.iter() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
