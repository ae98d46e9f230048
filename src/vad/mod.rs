//! Voice activity detection.
//!
//! An RMS energy gate rejects quiet frames outright; anything louder is
//! split into classifier-sized sub-frames and scored by webrtc-vad at the
//! configured aggressiveness. The energy gate keeps ambient noise (fan hum,
//! distant chatter) from tripping the classifier.

pub mod utterance;

use tracing::warn;
use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::config::VadConfig;

pub use utterance::{UtteranceDetector, UtteranceState};

/// Frame-level speech/non-speech classifier.
pub struct VoiceActivityDetector {
    vad: Vad,
    sample_rate: u32,
    sub_frame_samples: usize,
    energy_threshold: f64,
}

impl VoiceActivityDetector {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        let mode = match config.aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        let rate = match sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            other => {
                warn!(sample_rate = other, "unsupported VAD rate, assuming 16 kHz");
                SampleRate::Rate16kHz
            }
        };
        let sub_frame_samples =
            (sample_rate as usize * config.frame_duration_ms as usize) / 1_000;
        Self {
            vad: Vad::new_with_rate_and_mode(rate, mode),
            sample_rate,
            sub_frame_samples: sub_frame_samples.max(1),
            energy_threshold: config.energy_threshold,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// True when any classifier sub-frame in `frame` contains speech.
    pub fn is_speech(&mut self, frame: &[i16]) -> bool {
        if rms(frame) < self.energy_threshold {
            return false;
        }
        for chunk in frame.chunks_exact(self.sub_frame_samples) {
            if self.vad.is_voice_segment(chunk).unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

/// Root-mean-square energy of an int16 frame.
fn rms(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / frame.len() as f64).sqrt()
}
