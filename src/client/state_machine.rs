//! Five-state client control loop.
//!
//! PASSIVE listens for the wake phrase; LISTENING segments an utterance;
//! WAITING holds for the server's response; SPEAKING plays streamed TTS
//! chunks (watching for barge-in); FOLLOW_UP keeps the conversation open
//! for a short window without requiring a new wake.
//!
//! The loop ticks at frame cadence: it never blocks longer than the 50 ms
//! frame fetch, and all timeouts are wall-clock deadlines checked per tick
//! rather than frame counts (which drift when capture drops frames).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::earcon::{play_named_earcon, play_wake_earcon};
use crate::audio::{AudioCapture, Playback};
use crate::client::chunk_player::ChunkPlayer;
use crate::client::connection::{InboundEvent, ServerConnection};
use crate::config::Config;
use crate::metrics::MetricsLogger;
use crate::protocol::ServerMessage;
use crate::vad::{UtteranceDetector, UtteranceState, VoiceActivityDetector};
use crate::wake::WakeDetector;

/// Frame fetch timeout per tick.
const FRAME_TIMEOUT: Duration = Duration::from_millis(50);

/// Bound on the pre-roll buffered during SPEAKING / FOLLOW_UP.
const RECENT_FRAMES_MAX: usize = 25;

/// Minimum interval between capture restart attempts.
const CAPTURE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Passive,
    Listening,
    Waiting,
    Speaking,
    FollowUp,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passive => write!(f, "PASSIVE"),
            Self::Listening => write!(f, "LISTENING"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Speaking => write!(f, "SPEAKING"),
            Self::FollowUp => write!(f, "FOLLOW_UP"),
        }
    }
}

pub struct ClientStateMachine {
    config: Config,
    capture: AudioCapture,
    player: Arc<dyn Playback>,
    vad: VoiceActivityDetector,
    utterance: UtteranceDetector,
    wake: WakeDetector,
    conn: ServerConnection,
    chunk_player: ChunkPlayer,
    metrics: Arc<MetricsLogger>,

    state: ClientState,
    running: Arc<AtomicBool>,

    // Wall-clock deadlines, refreshed on the transitions that arm them.
    listening_start: Instant,
    listening_hard_start: Instant,
    speaking_start: Instant,
    follow_up_start: Instant,
    follow_up_deadline: Instant,
    last_drop_report: Instant,
    last_capture_restart: Instant,

    /// Consecutive-speech counter for barge-in and follow-up onset.
    onset_count: usize,
    /// Pre-roll carried across SPEAKING/FOLLOW_UP -> LISTENING transitions.
    recent_frames: VecDeque<(Vec<i16>, bool)>,
}

impl ClientStateMachine {
    pub fn new(
        config: Config,
        capture: AudioCapture,
        player: Arc<dyn Playback>,
        wake: WakeDetector,
        conn: ServerConnection,
        metrics: Arc<MetricsLogger>,
    ) -> Self {
        let vad = VoiceActivityDetector::new(&config.vad, config.audio.sample_rate);
        let utterance = UtteranceDetector::new(&config.vad);
        let chunk_player = ChunkPlayer::new(Arc::clone(&player));
        let now = Instant::now();
        Self {
            config,
            capture,
            player,
            vad,
            utterance,
            wake,
            conn,
            chunk_player,
            metrics,
            state: ClientState::Passive,
            running: Arc::new(AtomicBool::new(false)),
            listening_start: now,
            listening_hard_start: now,
            speaking_start: now,
            follow_up_start: now,
            follow_up_deadline: now,
            last_drop_report: now,
            last_capture_restart: now.checked_sub(CAPTURE_RECONNECT_DELAY).unwrap_or(now),
            onset_count: 0,
            recent_frames: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Handle for requesting shutdown from a signal handler.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn transition(&mut self, new_state: ClientState) {
        info!("[{}] -> [{}]", self.state, new_state);
        self.state = new_state;
    }

    /// Main loop. Returns when the running flag is cleared.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.capture.start()?;
        info!("state [{}] — say the wake word", self.state);

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();

            if now.duration_since(self.last_drop_report).as_secs_f64()
                >= self.config.audio.capture_drop_report_s
            {
                self.report_capture_drops(now);
            }

            if !self.capture.is_healthy() {
                self.try_restart_capture(now);
            }

            self.drain_server_events(now);

            let Some(frame) = self.capture.get_frame(FRAME_TIMEOUT).await else {
                if self.state == ClientState::FollowUp {
                    self.check_follow_up_timeout(now);
                }
                continue;
            };

            match self.state {
                ClientState::Passive => self.handle_passive(&frame),
                ClientState::Listening => {
                    let is_speech = self.vad.is_speech(&frame);
                    self.handle_listening(&frame, is_speech, now);
                }
                ClientState::Waiting => {
                    // Server messages drive this state; frames are ignored.
                }
                ClientState::Speaking => {
                    let is_speech = self.vad.is_speech(&frame);
                    self.handle_speaking(&frame, is_speech, now);
                }
                ClientState::FollowUp => {
                    let is_speech = self.vad.is_speech(&frame);
                    self.handle_follow_up(&frame, is_speech, now);
                }
            }
        }

        self.chunk_player.cancel();
        self.capture.stop();
        self.conn.stop();
        info!("client state machine stopped");
        Ok(())
    }

    fn report_capture_drops(&mut self, now: Instant) {
        self.last_drop_report = now;
        let dropped = self.capture.consume_dropped_frames();
        if dropped > 0 {
            warn!(dropped, "audio capture dropped frames");
            self.metrics.log(
                "audio_frame_drop",
                serde_json::json!({ "dropped_frames": dropped }),
            );
        }
    }

    fn try_restart_capture(&mut self, now: Instant) {
        if now.duration_since(self.last_capture_restart) < CAPTURE_RECONNECT_DELAY {
            return;
        }
        self.last_capture_restart = now;
        warn!("audio device lost — attempting restart");
        if self.state != ClientState::Passive {
            self.transition(ClientState::Passive);
        }
        if self.capture.restart() {
            info!("audio device restarted");
        } else {
            warn!("audio restart failed — retrying in 1s");
        }
    }

    // ── Server messages ─────────────────────────────────────────────

    fn drain_server_events(&mut self, now: Instant) {
        while let Some(event) = self.conn.try_recv() {
            match event {
                InboundEvent::Message(msg) => self.on_server_message(msg),
                InboundEvent::TtsChunk {
                    sample_rate,
                    chunk_index,
                    is_last,
                    samples,
                } => self.on_tts_chunk(sample_rate, chunk_index, is_last, &samples, now),
            }
        }
    }

    fn on_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::WarmupAck => debug!("LLM warmup acknowledged"),
            ServerMessage::Status { stage } => debug!(?stage, "server status"),
            ServerMessage::SttRejected { reason } => {
                warn!(%reason, "utterance rejected by server");
                self.enter_follow_up();
            }
            ServerMessage::TtsDone { cancelled } => {
                if !cancelled {
                    self.chunk_player.finish_stream();
                }
                debug!(cancelled, "tts stream done");
                // No audio ever arrived for this response.
                if self.state == ClientState::Waiting {
                    self.enter_follow_up();
                }
            }
            ServerMessage::SessionCleared => debug!("session cleared by server"),
            ServerMessage::TtsAudio { .. } => {
                unreachable!("TtsAudio is paired with its binary frame into InboundEvent::TtsChunk before reaching on_server_message")
            }
            ServerMessage::Error {
                message,
                stage,
                code,
            } => {
                warn!(?stage, ?code, %message, "server error");
                play_named_earcon(
                    &*self.player,
                    "error",
                    self.config.audio.sample_rate,
                    self.config.earcon.volume,
                );
                self.player.wait_until_done(Duration::from_millis(500));
                if self.state == ClientState::Waiting {
                    self.enter_follow_up();
                }
            }
        }
    }

    fn on_tts_chunk(
        &mut self,
        sample_rate: u32,
        chunk_index: u64,
        is_last: bool,
        samples: &[i16],
        now: Instant,
    ) {
        debug!(
            chunk_index,
            samples = samples.len(),
            sample_rate,
            is_last,
            "tts chunk received"
        );

        if self.state == ClientState::Waiting {
            self.chunk_player.start_stream();
            self.onset_count = 0;
            self.speaking_start = now;
            self.transition(ClientState::Speaking);
        }

        self.chunk_player.enqueue(samples, sample_rate);
        if is_last {
            self.chunk_player.finish_stream();
        }
    }

    // ── State handlers ──────────────────────────────────────────────

    fn handle_passive(&mut self, frame: &[i16]) {
        let (detected, score) = self.wake.process(frame);
        if !detected {
            return;
        }
        info!(score, "wake word detected");
        self.metrics
            .log("wake_detected", serde_json::json!({ "score": score }));
        self.wake.reset();

        play_wake_earcon(
            &*self.player,
            &self.config.earcon,
            self.config.audio.sample_rate,
        );
        self.player.wait_until_done(Duration::from_millis(500));

        // Triggers LLM warmup server-side.
        self.conn.send_wake(f64::from(score));

        self.utterance.reset();
        let now = Instant::now();
        self.listening_start = now;
        self.listening_hard_start = now;
        self.transition(ClientState::Listening);
    }

    fn handle_listening(&mut self, frame: &[i16], is_speech: bool, now: Instant) {
        // Hard cap: never collect longer than max_utterance_s.
        if now.duration_since(self.listening_hard_start).as_secs_f64()
            >= self.config.vad.max_utterance_s
        {
            if self.utterance.state() == UtteranceState::Collecting {
                warn!("max utterance time reached — sending collected audio");
                let audio = self.utterance.get_audio();
                self.finish_utterance(&audio);
            } else {
                self.abandon_listening();
            }
            return;
        }

        // Soft timeout: no speech confirmed yet.
        if now.duration_since(self.listening_start).as_secs_f64()
            >= self.config.vad.listening_timeout_s
        {
            self.abandon_listening();
            return;
        }

        let state = self.utterance.process_at(frame, is_speech, now);

        // Refresh the soft timeout while speech is flowing.
        if self.utterance.state() == UtteranceState::Collecting {
            self.listening_start = now;
        }

        if state == UtteranceState::Complete {
            let audio = self.utterance.get_audio();
            self.finish_utterance(&audio);
        }
    }

    fn abandon_listening(&mut self) {
        warn!("listening timed out, no speech detected");
        self.metrics.log("listening_timeout", serde_json::Value::Null);
        play_named_earcon(
            &*self.player,
            "goodbye",
            self.config.audio.sample_rate,
            self.config.earcon.volume,
        );
        self.player.wait_until_done(Duration::from_millis(500));
        self.conn.send_follow_up_timeout();
        self.transition(ClientState::Passive);
        info!("state [{}] — say the wake word", self.state);
    }

    fn finish_utterance(&mut self, audio: &[i16]) {
        play_named_earcon(
            &*self.player,
            "heard",
            self.config.audio.sample_rate,
            self.config.earcon.volume,
        );
        self.player.wait_until_done(Duration::from_millis(300));
        self.conn
            .send_utterance(audio, self.config.audio.sample_rate);
        self.transition(ClientState::Waiting);
    }

    fn handle_speaking(&mut self, frame: &[i16], is_speech: bool, now: Instant) {
        if !self.chunk_player.is_playing() {
            self.enter_follow_up();
            return;
        }

        if !self.config.vad.barge_in_enabled {
            return;
        }

        // Grace window avoids self-triggering on speaker bleed.
        if now.duration_since(self.speaking_start).as_secs_f64()
            < self.config.vad.barge_in_grace_s
        {
            return;
        }

        self.buffer_recent_frame(frame, is_speech);

        if is_speech {
            self.onset_count += 1;
            if self.onset_count >= self.config.vad.barge_in_frames {
                info!("barge-in detected");
                self.metrics.log("barge_in", serde_json::Value::Null);
                self.chunk_player.cancel();
                self.conn.send_barge_in();
                self.resume_listening_with_buffered_frames(now);
            }
        } else {
            self.onset_count = 0;
        }
    }

    fn handle_follow_up(&mut self, frame: &[i16], is_speech: bool, now: Instant) {
        self.check_follow_up_timeout(now);
        if self.state != ClientState::FollowUp {
            return;
        }

        self.buffer_recent_frame(frame, is_speech);

        // Grace window covers the tail of the "ready" earcon.
        if now.duration_since(self.follow_up_start).as_secs_f64()
            < self.config.vad.follow_up_grace_s
        {
            return;
        }

        if is_speech {
            self.onset_count += 1;
            if self.onset_count >= self.config.vad.speech_onset_frames {
                info!("follow-up speech detected");
                self.resume_listening_with_buffered_frames(now);
            }
        } else {
            self.onset_count = 0;
        }
    }

    fn buffer_recent_frame(&mut self, frame: &[i16], is_speech: bool) {
        self.recent_frames.push_back((frame.to_vec(), is_speech));
        while self.recent_frames.len() > RECENT_FRAMES_MAX {
            self.recent_frames.pop_front();
        }
    }

    /// Seed the utterance detector with the buffered pre-roll and enter
    /// LISTENING (used by barge-in and follow-up onset).
    fn resume_listening_with_buffered_frames(&mut self, now: Instant) {
        self.utterance.reset();
        for (frame, is_speech) in std::mem::take(&mut self.recent_frames) {
            self.utterance.process_at(&frame, is_speech, now);
        }
        self.onset_count = 0;
        self.listening_start = now;
        self.listening_hard_start = now;
        self.transition(ClientState::Listening);
    }

    fn enter_follow_up(&mut self) {
        self.follow_up_deadline =
            Instant::now() + Duration::from_secs_f64(self.config.conversation.follow_up_window_s);
        self.onset_count = 0;
        self.recent_frames.clear();
        play_named_earcon(
            &*self.player,
            "ready",
            self.config.audio.sample_rate,
            self.config.earcon.volume,
        );
        self.player.wait_until_done(Duration::from_millis(500));
        self.follow_up_start = Instant::now();
        self.transition(ClientState::FollowUp);
    }

    fn check_follow_up_timeout(&mut self, now: Instant) {
        if now < self.follow_up_deadline {
            return;
        }
        self.metrics
            .log("follow_up_timeout", serde_json::Value::Null);
        self.conn.send_follow_up_timeout();
        play_named_earcon(
            &*self.player,
            "goodbye",
            self.config.audio.sample_rate,
            self.config.earcon.volume,
        );
        self.player.wait_until_done(Duration::from_millis(500));
        self.transition(ClientState::Passive);
        info!("state [{}] — say the wake word", self.state);
    }
}
