//! Sequential playback of streamed TTS chunks.
//!
//! The connection enqueues chunks as they arrive; a dedicated consumer
//! thread plays them back to back. Cancellation (barge-in) stops the
//! underlying player immediately, flushes the queue, and unblocks the
//! consumer with a sentinel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio::Playback;

/// Queue capacity in chunks; enqueue drops when full.
const QUEUE_CAPACITY: usize = 100;

/// How long the consumer waits for the next chunk before giving up.
const NEXT_CHUNK_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single chunk's playback time.
const CHUNK_PLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// `None` is the end-of-stream sentinel.
type Item = Option<(Vec<f32>, u32)>;

struct Queue {
    items: Mutex<VecDeque<Item>>,
    available: Condvar,
}

pub struct ChunkPlayer {
    player: Arc<dyn Playback>,
    queue: Arc<Queue>,
    playing: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    consumer: Option<std::thread::JoinHandle<()>>,
}

impl ChunkPlayer {
    pub fn new(player: Arc<dyn Playback>) -> Self {
        Self {
            player,
            queue: Arc::new(Queue {
                items: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
            }),
            playing: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            consumer: None,
        }
    }

    /// True while chunks are queued or playing.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Prepare for a new stream: drop stale chunks and start the consumer.
    pub fn start_stream(&mut self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.playing.store(true, Ordering::SeqCst);
        self.queue.items.lock().unwrap().clear();

        let player = Arc::clone(&self.player);
        let queue = Arc::clone(&self.queue);
        let playing = Arc::clone(&self.playing);
        let cancelled = Arc::clone(&self.cancelled);
        self.consumer = Some(std::thread::spawn(move || {
            playback_loop(&*player, &queue, &cancelled);
            playing.store(false, Ordering::SeqCst);
        }));
    }

    /// Queue a chunk for playback, converting to f32. Drops when full.
    pub fn enqueue(&self, audio: &[i16], sample_rate: u32) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let samples: Vec<f32> = audio.iter().map(|&s| f32::from(s) / 32_767.0).collect();
        let mut items = self.queue.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            warn!("chunk queue full, dropping TTS chunk");
            return;
        }
        items.push_back(Some((samples, sample_rate)));
        drop(items);
        self.queue.available.notify_one();
    }

    /// Signal that all chunks for this stream have been enqueued.
    pub fn finish_stream(&self) {
        let mut items = self.queue.items.lock().unwrap();
        items.push_back(None);
        drop(items);
        self.queue.available.notify_one();
    }

    /// Barge-in: stop playback now, flush the queue, release the consumer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.player.stop();
        let mut items = self.queue.items.lock().unwrap();
        items.clear();
        items.push_back(None);
        drop(items);
        self.queue.available.notify_one();
    }

    /// Wait for the consumer thread to finish (used in shutdown paths).
    pub fn wait_done(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.consumer.take() else {
            return true;
        };
        let deadline = std::time::Instant::now() + timeout;
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                self.consumer = Some(handle);
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
        true
    }
}

fn playback_loop(player: &dyn Playback, queue: &Queue, cancelled: &AtomicBool) {
    loop {
        let item = {
            let items = queue.items.lock().unwrap();
            let (mut items, result) = queue
                .available
                .wait_timeout_while(items, NEXT_CHUNK_TIMEOUT, |q| q.is_empty())
                .unwrap();
            if result.timed_out() && items.is_empty() {
                warn!("chunk playback timed out waiting for next chunk");
                return;
            }
            items.pop_front()
        };

        let Some(item) = item else { continue };
        let Some((samples, sample_rate)) = item else {
            debug!("chunk stream finished");
            return;
        };
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        if samples.is_empty() {
            continue;
        }

        player.play(samples, sample_rate);
        player.wait_until_done(CHUNK_PLAY_TIMEOUT);

        if cancelled.load(Ordering::SeqCst) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Playback fake recording play/stop calls; playback is instantaneous.
    struct FakePlayer {
        plays: StdMutex<Vec<(usize, u32)>>,
        stops: AtomicBool,
    }

    impl FakePlayer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                plays: StdMutex::new(Vec::new()),
                stops: AtomicBool::new(false),
            })
        }
    }

    impl Playback for FakePlayer {
        fn play(&self, samples: Vec<f32>, sample_rate: u32) {
            self.plays.lock().unwrap().push((samples.len(), sample_rate));
        }

        fn stop(&self) {
            self.stops.store(true, Ordering::SeqCst);
        }

        fn is_playing(&self) -> bool {
            false
        }

        fn wait_until_done(&self, _timeout: Duration) -> bool {
            true
        }
    }

    fn wait_until_idle(player: &ChunkPlayer) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while player.is_playing() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!player.is_playing(), "consumer did not finish");
    }

    #[test]
    fn plays_chunks_in_order_then_goes_idle() {
        let fake = FakePlayer::new();
        let mut cp = ChunkPlayer::new(fake.clone());
        cp.start_stream();
        cp.enqueue(&[1; 10], 24_000);
        cp.enqueue(&[2; 20], 24_000);
        cp.finish_stream();
        wait_until_idle(&cp);
        assert_eq!(*fake.plays.lock().unwrap(), vec![(10, 24_000), (20, 24_000)]);
    }

    #[test]
    fn cancel_stops_player_and_unblocks_consumer() {
        let fake = FakePlayer::new();
        let mut cp = ChunkPlayer::new(fake.clone());
        cp.start_stream();
        cp.cancel();
        wait_until_idle(&cp);
        assert!(fake.stops.load(Ordering::SeqCst));
        // Chunks after cancel are ignored.
        cp.enqueue(&[1; 10], 24_000);
        assert!(fake.plays.lock().unwrap().is_empty());
    }

    #[test]
    fn start_stream_drains_stale_chunks() {
        let fake = FakePlayer::new();
        let mut cp = ChunkPlayer::new(fake.clone());
        // Stale entries from a previous stream sit in the queue.
        cp.queue
            .items
            .lock()
            .unwrap()
            .push_back(Some((vec![0.0; 99], 8_000)));
        cp.start_stream();
        cp.enqueue(&[5; 7], 24_000);
        cp.finish_stream();
        wait_until_idle(&cp);
        assert_eq!(*fake.plays.lock().unwrap(), vec![(7, 24_000)]);
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let fake = FakePlayer::new();
        let mut cp = ChunkPlayer::new(fake.clone());
        cp.start_stream();
        cp.enqueue(&[], 24_000);
        cp.enqueue(&[3; 3], 24_000);
        cp.finish_stream();
        wait_until_idle(&cp);
        assert_eq!(*fake.plays.lock().unwrap(), vec![(3, 24_000)]);
    }

    #[test]
    fn int16_is_converted_to_unit_range() {
        let fake = FakePlayer::new();
        let cp = ChunkPlayer::new(fake.clone());
        // Direct conversion check through the queue contents.
        cp.playing.store(true, Ordering::SeqCst);
        cp.enqueue(&[32_767, -32_767, 0], 24_000);
        let items = cp.queue.items.lock().unwrap();
        let (samples, _) = items.front().unwrap().as_ref().unwrap();
        assert!((samples[0] - 1.0).abs() < 1e-6);
        assert!((samples[1] + 1.0).abs() < 1e-6);
        assert_eq!(samples[2], 0.0);
    }
}
