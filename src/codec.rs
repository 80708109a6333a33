//! Length-prefixed JSON framing codec.
//!
//! Wire layout: 4-byte big-endian length prefix, then that many bytes of
//! UTF-8 JSON encoding a `relay_protocol::Envelope`. Built on
//! `tokio_util::codec::LengthDelimitedCodec` (its default `u32` big-endian
//! length field matches this layout exactly) plus `serde_json` for the
//! payload. Grounded in the `other_examples` broker's
//! `Framed<UnixStream, LengthPrefixedCodec>` usage.

use bytes::{Bytes, BytesMut};
use relay_protocol::Envelope;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds max_frame_bytes")]
    FrameTooLarge,
    #[error("malformed frame: {0}")]
    BadFrame(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope-level codec. Wraps `LengthDelimitedCodec` so the byte layer
/// handles length-prefix framing and partial-frame buffering; this layer
/// only (de)serializes the JSON payload of each complete frame.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_bytes: u32) -> Self {
        let mut inner = LengthDelimitedCodec::new();
        inner.set_max_frame_length(max_frame_bytes as usize);
        FrameCodec { inner }
    }

    /// Reset any buffered partial-frame state.
    pub fn reset(&mut self) {
        self.inner = LengthDelimitedCodec::new();
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = match self.inner.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(CodecError::FrameTooLarge);
            }
            Err(e) => return Err(CodecError::Io(e)),
        };
        if frame.is_empty() {
            return Err(CodecError::BadFrame(
                serde_json::from_slice::<serde_json::Value>(b"").unwrap_err(),
            ));
        }
        let envelope: Envelope = serde_json::from_slice(&frame)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item)?;
        self.inner
            .encode(Bytes::from(bytes), dst)
            .map_err(CodecError::Io)
    }
}
