//! Utterance segmentation.
//!
//! Tracks speech onset and end-of-utterance over classified frames. A
//! bounded pre-roll ring carries the frames immediately before onset into
//! the utterance so the first syllable is not clipped.

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::VadConfig;

/// Segmentation states. Only ever advances Waiting -> Collecting ->
/// Complete; `reset` is the sole way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceState {
    Waiting,
    Collecting,
    Complete,
}

pub struct UtteranceDetector {
    silence_timeout_s: f64,
    speech_onset_frames: usize,
    pre_roll_capacity: usize,

    state: UtteranceState,
    consecutive_speech: usize,
    last_speech_at: Option<Instant>,
    audio: Vec<i16>,
    pre_roll: VecDeque<Vec<i16>>,
}

impl UtteranceDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            silence_timeout_s: config.silence_timeout_ms as f64 / 1_000.0,
            speech_onset_frames: config.speech_onset_frames,
            pre_roll_capacity: config.speech_onset_frames + 4,
            state: UtteranceState::Waiting,
            consecutive_speech: 0,
            last_speech_at: None,
            audio: Vec::new(),
            pre_roll: VecDeque::new(),
        }
    }

    pub fn state(&self) -> UtteranceState {
        self.state
    }

    /// Clear collected audio and pre-roll and return to Waiting.
    pub fn reset(&mut self) {
        self.state = UtteranceState::Waiting;
        self.consecutive_speech = 0;
        self.last_speech_at = None;
        self.audio.clear();
        self.pre_roll.clear();
    }

    /// Feed one classified frame and return the resulting state.
    pub fn process(&mut self, frame: &[i16], is_speech: bool) -> UtteranceState {
        self.process_at(frame, is_speech, Instant::now())
    }

    pub(crate) fn process_at(
        &mut self,
        frame: &[i16],
        is_speech: bool,
        now: Instant,
    ) -> UtteranceState {
        if self.state == UtteranceState::Complete {
            return self.state;
        }

        if self.state == UtteranceState::Waiting {
            self.pre_roll.push_back(frame.to_vec());
            while self.pre_roll.len() > self.pre_roll_capacity {
                self.pre_roll.pop_front();
            }
        }

        if is_speech {
            self.consecutive_speech += 1;
            self.last_speech_at = Some(now);

            match self.state {
                UtteranceState::Waiting => {
                    if self.consecutive_speech >= self.speech_onset_frames {
                        self.state = UtteranceState::Collecting;
                        for buffered in self.pre_roll.drain(..) {
                            self.audio.extend_from_slice(&buffered);
                        }
                    }
                }
                UtteranceState::Collecting => {
                    self.audio.extend_from_slice(frame);
                }
                UtteranceState::Complete => {}
            }
        } else {
            self.consecutive_speech = 0;

            if self.state == UtteranceState::Collecting {
                self.audio.extend_from_slice(frame);
                if let Some(last) = self.last_speech_at {
                    if now.duration_since(last).as_secs_f64() >= self.silence_timeout_s {
                        self.state = UtteranceState::Complete;
                    }
                }
            }
        }

        self.state
    }

    /// All collected samples in capture order.
    pub fn get_audio(&self) -> Vec<i16> {
        self.audio.clone()
    }
}
