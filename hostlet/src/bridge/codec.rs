//! Framed codec for control-channel traffic.
//!
//! One JSON object per newline-terminated frame (NDJSON). Wraps LinesCodec for
//! framing and serde_json for serialization; works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Codec that frames messages one-per-line and serializes with JSON.
///
/// serde_json never emits raw newlines, so the line framing is unambiguous.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn framing_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum length")
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src).map_err(framing_error)? {
            Some(line) => {
                let item = serde_json::from_str(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src).map_err(framing_error)? {
            Some(line) => {
                let item = serde_json::from_str(&line)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_string(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst).map_err(framing_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlMessage, MessageKind, RequestId, commands};
    use serde_json::json;

    #[test]
    fn codec_roundtrip_notify() {
        let mut codec = JsonLineCodec::<ControlMessage>::new();
        let mut buf = BytesMut::new();

        let msg = ControlMessage::notify(commands::URL, json!("http://127.0.0.1:51000"));
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.kind, MessageKind::Notify);
        assert_eq!(decoded.command, "url");
        assert_eq!(decoded.payload, json!("http://127.0.0.1:51000"));
    }

    #[test]
    fn codec_roundtrip_request_response_pair() {
        let mut codec = JsonLineCodec::<ControlMessage>::new();
        let mut buf = BytesMut::new();

        let req_id = RequestId::new();
        codec
            .encode(
                ControlMessage::request(req_id, commands::FETCH, json!({"url": "http://api.internal/v1"})),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                ControlMessage::response(req_id, commands::FETCH, json!({"status": 200})),
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.req_id, Some(req_id));
        assert!(first.is_request());
        assert_eq!(second.req_id, Some(req_id));
        assert!(second.is_response());
    }

    #[test]
    fn partial_frame_yields_none() {
        let mut codec = JsonLineCodec::<ControlMessage>::new();
        let mut buf = BytesMut::from(&br#"{"kind":"notify","co"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_frame_is_invalid_data() {
        let mut codec = JsonLineCodec::<ControlMessage>::new();
        let mut buf = BytesMut::from(&b"NOT-JSON\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
