//! Microphone capture via cpal.
//!
//! Opens the default input device at its native rate, downmixes to mono,
//! resamples to the configured rate if needed, and emits fixed-size int16
//! frames. The cpal callback never blocks: it writes the diagnostic ring
//! buffer and non-blockingly enqueues frames into a bounded channel,
//! counting drops on overflow.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::ring_buffer::RingBuffer;
use crate::config::AudioConfig;

/// Bounded frame queue capacity between the audio thread and the main loop.
const FRAME_QUEUE_CAPACITY: usize = 200;

/// Captures audio from the default input device.
pub struct AudioCapture {
    config: AudioConfig,
    ring_buffer: Arc<RingBuffer>,
    frame_tx: mpsc::Sender<Vec<i16>>,
    frame_rx: mpsc::Receiver<Vec<i16>>,
    dropped_frames: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
    stream: Option<cpal::Stream>,
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        let ring_buffer = Arc::new(RingBuffer::new(
            config.ring_buffer_seconds,
            config.sample_rate,
        ));
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        Self {
            config,
            ring_buffer,
            frame_tx,
            frame_rx,
            dropped_frames: Arc::new(AtomicU64::new(0)),
            healthy: Arc::new(AtomicBool::new(false)),
            stream: None,
        }
    }

    /// Shared handle to the diagnostic ring buffer.
    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring_buffer)
    }

    /// Open the input stream and begin delivering frames.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let stream = build_input_stream(
            &self.config,
            Arc::clone(&self.ring_buffer),
            self.frame_tx.clone(),
            Arc::clone(&self.dropped_frames),
            Arc::clone(&self.healthy),
        )?;
        stream
            .play()
            .map_err(|e| anyhow::anyhow!("failed to start input stream: {e}"))?;
        self.healthy.store(true, Ordering::SeqCst);
        self.stream = Some(stream);
        info!("audio capture started");
        Ok(())
    }

    /// Release the input device.
    pub fn stop(&mut self) {
        self.stream = None;
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Tear down and rebuild the stream after device loss.
    pub fn restart(&mut self) -> bool {
        self.stream = None;
        match self.start() {
            Ok(()) => true,
            Err(e) => {
                warn!("audio capture restart failed: {e}");
                false
            }
        }
    }

    /// False after a stream error or before `start()`.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Await the next frame for up to `timeout`; `None` when the queue
    /// stays empty.
    pub async fn get_frame(&mut self, timeout: Duration) -> Option<Vec<i16>> {
        match tokio::time::timeout(timeout, self.frame_rx.recv()).await {
            Ok(frame) => frame,
            Err(_) => None,
        }
    }

    /// Return and reset the dropped-frame counter.
    pub fn consume_dropped_frames(&self) -> u64 {
        self.dropped_frames.swap(0, Ordering::SeqCst)
    }
}

fn build_input_stream(
    config: &AudioConfig,
    ring_buffer: Arc<RingBuffer>,
    frame_tx: mpsc::Sender<Vec<i16>>,
    dropped: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
) -> anyhow::Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no default input device available"))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".into());

    let default_config = device
        .default_input_config()
        .map_err(|e| anyhow::anyhow!("failed to get input config: {e}"))?;
    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        device = %device_name,
        native_rate,
        channels,
        target_rate = config.sample_rate,
        "selected input device"
    );

    let target_rate = config.sample_rate;
    let blocksize = config.blocksize;
    let needs_resample = native_rate != target_rate;

    // Accumulates resampled mono int16 samples until a full frame is ready.
    let mut frame_buf: Vec<i16> = Vec::with_capacity(blocksize * 2);

    let error_healthy = Arc::clone(&healthy);
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels > 1 {
                    data.iter().step_by(channels as usize).copied().collect()
                } else {
                    data.to_vec()
                };

                let resampled = if needs_resample {
                    resample_linear(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                for sample in resampled {
                    let clipped = sample.clamp(-1.0, 1.0);
                    frame_buf.push((clipped * 32_767.0) as i16);
                }

                while frame_buf.len() >= blocksize {
                    let frame: Vec<i16> = frame_buf.drain(..blocksize).collect();
                    ring_buffer.write(&frame);
                    if frame_tx.try_send(frame).is_err() {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                error_healthy.store(false, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| anyhow::anyhow!("failed to build input stream: {e}"))?;

    Ok(stream)
}

/// Linear resampler for mono f32 samples.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}
