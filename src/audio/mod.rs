//! audio - Inbound chunk buffering, payload codecs and caller-side voice gating
//!
//! Resampling and device I/O stay with the caller: chunks come out at the
//! negotiated server rate, and raw PCM goes in at the caller's capture rate.

mod buffer;
mod codec;
mod vad;

use bytes::Bytes;

pub use buffer::AudioBuffer;
pub use codec::{create_codec, AudioCodec, PcmPassthrough};
pub use vad::VoiceActivityGate;

/// One block of 16-bit little-endian mono PCM received from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
    /// Rate negotiated for the Open period this chunk arrived in.
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
