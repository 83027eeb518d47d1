use std::borrow::Cow;

use crate::config::AudioConfig;

/// Caller-side silence gate for outbound microphone frames.
///
/// Loud frames pass through and reset the silence counter. Once
/// `silence_limit` quiet frames arrive in a row, frames are replaced with
/// digital silence of the same length until speech resumes.
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    amplitude_threshold: f32,
    silence_limit: u32,
    silent_frames: u32,
}

impl VoiceActivityGate {
    pub fn new(amplitude_threshold: f32, silence_limit: u32) -> Self {
        Self {
            amplitude_threshold,
            silence_limit,
            silent_frames: 0,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.amplitude_threshold, config.silence_limit)
    }

    /// RMS amplitude of 16-bit little-endian PCM. A trailing odd byte is ignored.
    pub fn rms(pcm: &[u8]) -> f32 {
        let samples = pcm.len() / 2;
        if samples == 0 {
            return 0.0;
        }
        let sum: f64 = pcm
            .chunks_exact(2)
            .map(|b| {
                let s = f64::from(i16::from_le_bytes([b[0], b[1]]));
                s * s
            })
            .sum();
        (sum / samples as f64).sqrt() as f32
    }

    pub fn process<'a>(&mut self, frame: &'a [u8]) -> Cow<'a, [u8]> {
        if Self::rms(frame) > self.amplitude_threshold {
            self.silent_frames = 0;
            return Cow::Borrowed(frame);
        }
        self.silent_frames = self.silent_frames.saturating_add(1);
        if self.silent_frames >= self.silence_limit {
            Cow::Owned(vec![0; frame.len()])
        } else {
            Cow::Borrowed(frame)
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.silent_frames < self.silence_limit
    }
}
