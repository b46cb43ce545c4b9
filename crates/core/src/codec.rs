//! Payload codec: payload value <-> opaque bytes stored on the job record.

use crate::error::CodecError;
use crate::payload::Payload;

/// Encodes payloads for storage.
///
/// Implementations must be lossless for every payload they accept:
/// `decode(encode(v)) == v`.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError>;
}

/// JSON codec (default).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
