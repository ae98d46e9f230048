//! Audio subsystem: capture, playback, diagnostics ring, earcons.

pub mod capture;
pub mod earcon;
pub mod playback;
pub mod ring_buffer;

pub use capture::AudioCapture;
pub use playback::{AudioPlayer, Playback};
pub use ring_buffer::RingBuffer;
