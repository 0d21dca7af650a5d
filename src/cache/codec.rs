use bytes::Bytes;
use thiserror::Error;

use crate::render::RenderResult;

#[derive(Debug, Error)]
#[error("failed to {op} render result: {source}")]
pub struct CodecError {
    op: &'static str,
    #[source]
    source: serde_json::Error,
}

/// Turns render results into storable bytes and back.
pub trait Codec: Send + Sync {
    fn encode(&self, result: &RenderResult) -> Result<Bytes, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<RenderResult, CodecError>;
}

/// JSON codec; lossless for every [`RenderResult`] field.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, result: &RenderResult) -> Result<Bytes, CodecError> {
        serde_json::to_vec(result)
            .map(Bytes::from)
            .map_err(|source| CodecError {
                op: "encode",
                source,
            })
    }

    fn decode(&self, bytes: &[u8]) -> Result<RenderResult, CodecError> {
        serde_json::from_slice(bytes).map_err(|source| CodecError {
            op: "decode",
            source,
        })
    }
}
