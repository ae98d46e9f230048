//! Audio playback via rodio with instant stop for barge-in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};

/// Playback surface the state machine and chunk player drive.
///
/// The production implementation is [`AudioPlayer`]; tests substitute fakes.
pub trait Playback: Send + Sync {
    /// Start non-blocking playback, replacing anything currently queued.
    fn play(&self, samples: Vec<f32>, sample_rate: u32);

    /// Halt playback immediately (barge-in).
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Poll until playback finishes or `timeout` elapses. Returns true when
    /// playback completed.
    fn wait_until_done(&self, timeout: Duration) -> bool;
}

/// Plays f32 PCM audio through the default output device.
///
/// `play` is non-blocking; callers observe completion through `is_playing`
/// or `wait_until_done`. `stop` halts immediately and clears the queue.
pub struct AudioPlayer {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Arc<Sink>,
    playing: Arc<AtomicBool>,
}

impl AudioPlayer {
    pub fn new() -> anyhow::Result<Self> {
        let (stream, stream_handle) = OutputStream::try_default()
            .map_err(|e| anyhow::anyhow!("failed to open audio output: {e}"))?;
        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| anyhow::anyhow!("failed to create audio sink: {e}"))?;
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink: Arc::new(sink),
            playing: Arc::new(AtomicBool::new(false)),
        })
    }

    fn play_inner(&self, samples: Vec<f32>, sample_rate: u32) {
        if samples.is_empty() {
            return;
        }
        self.sink.stop();
        self.playing.store(true, Ordering::SeqCst);
        self.sink.append(SamplesBuffer::new(1, sample_rate, samples));

        // Short-lived monitor clears the flag on natural completion.
        let sink = Arc::clone(&self.sink);
        let playing = Arc::clone(&self.playing);
        std::thread::spawn(move || {
            while !sink.empty() {
                if !playing.load(Ordering::SeqCst) {
                    return; // stopped externally
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            playing.store(false, Ordering::SeqCst);
        });
    }
}

impl Playback for AudioPlayer {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) {
        self.play_inner(samples, sample_rate);
    }

    fn stop(&self) {
        self.sink.stop();
        self.playing.store(false, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn wait_until_done(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.playing.load(Ordering::SeqCst) {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }
}

// SAFETY: OutputStream is !Send because of a raw-pointer marker in cpal's
// platform abstraction. All sink access is serialized by the owning
// component (state machine or chunk player consumer), so moving the struct
// between threads is sound.
unsafe impl Send for AudioPlayer {}
unsafe impl Sync for AudioPlayer {}
