//! Port frame codec.
//!
//! Every frame on a port is a 4-byte big-endian length followed by that many
//! bytes of JSON. The same framing carries the socket handshake.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Length of the big-endian frame length prefix.
pub const LENGTH_FIELD_BYTES: usize = 4;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Payloads above this size are logged at debug.
const LARGE_FRAME_BYTES: usize = 100_000;

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Length-prefixed JSON frames of type `T`.
pub struct JsonCodec<T> {
    framing: LengthDelimitedCodec,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let framing = LengthDelimitedCodec::builder()
            .length_field_length(LENGTH_FIELD_BYTES)
            .max_frame_length(MAX_FRAME_BYTES)
            .big_endian()
            .new_codec();
        Self {
            framing,
            _frame: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(body) = self.framing.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&body).map(Some).map_err(invalid_data)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, frame: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&frame).map_err(invalid_data)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit", body.len()),
            ));
        }
        if body.len() > LARGE_FRAME_BYTES {
            tracing::debug!(frame_bytes = body.len(), "Encoding large frame");
        }
        self.framing.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationToken, HubFrame, PortFrame, RejectReason};

    #[test]
    fn decodes_response_frame() {
        let mut codec = JsonCodec::<PortFrame>::new();
        let mut buf = BytesMut::new();

        let token = CorrelationToken::new();
        codec
            .encode(
                PortFrame::Response {
                    token,
                    payload: serde_json::json!("HOWDY!"),
                },
                &mut buf,
            )
            .unwrap();

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PortFrame::Response {
                token,
                payload: serde_json::json!("HOWDY!"),
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<HubFrame>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                HubFrame::Rejected {
                    reason: RejectReason::InvalidName,
                },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(HubFrame::Rejected { .. })
        ));
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut codec = JsonCodec::<PortFrame>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"nope");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_refused_on_encode() {
        let mut codec = JsonCodec::<PortFrame>::new();
        let mut buf = BytesMut::new();
        let err = codec
            .encode(
                PortFrame::Request {
                    target: "popup:main".to_string(),
                    token: None,
                    payload: serde_json::json!("x".repeat(MAX_FRAME_BYTES)),
                },
                &mut buf,
            )
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }
}
