use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::header::HeaderDecoder;
use crate::codec::payload::PayloadDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

/// Decodes a stream of requests: one `Header` message, then the body as
/// `Payload` messages ending in `Eof`, then the next request. A request whose
/// framing is [`PayloadSize::Empty`] produces no `Payload` messages at all.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            if matches!(item, Some(PayloadItem::Eof)) {
                self.payload_decoder = None;
            }
            return Ok(item.map(Message::Payload));
        }

        let message = self.header_decoder.decode(src)?.map(|(header, payload_size)| {
            if !payload_size.is_empty() {
                self.payload_decoder = Some(payload_size.into());
            }
            Message::Header((header, payload_size))
        });
        Ok(message)
    }
}
