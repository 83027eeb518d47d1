//! Payload codecs for audio frames, selected by the name negotiated in the handshake.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;

use crate::error::SessionError;

/// Converts between raw 16-bit PCM and the string payload carried in
/// `audio_data`. Implementations are stateless per frame.
pub trait AudioCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw PCM into the frame payload.
    fn encode(&self, pcm: &[u8]) -> String;

    /// Frame payload back into raw PCM.
    fn decode(&self, payload: &str) -> Result<Bytes, SessionError>;
}

/// Codec `"none"`: raw PCM, base64-wrapped for the JSON frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcmPassthrough;

impl AudioCodec for PcmPassthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn encode(&self, pcm: &[u8]) -> String {
        B64.encode(pcm)
    }

    fn decode(&self, payload: &str) -> Result<Bytes, SessionError> {
        B64.decode(payload)
            .map(Bytes::from)
            .map_err(|e| SessionError::Protocol(format!("invalid audio payload: {}", e)))
    }
}

/// Look up a codec by its wire name.
pub fn create_codec(name: &str) -> Result<Box<dyn AudioCodec>, SessionError> {
    match name {
        // 服务端省略字段时按 none 处理
        "" | "none" => Ok(Box::new(PcmPassthrough)),
        other => Err(SessionError::UnsupportedCodec(other.to_string())),
    }
}
