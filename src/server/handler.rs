//! Per-connection session handling.
//!
//! One reactor task owns the WebSocket read side and dispatches control
//! messages. The STT -> LLM -> TTS pipeline runs as a separate task so the
//! reactor keeps receiving (and can observe a barge-in) while a response is
//! being produced. Outbound frames funnel through one writer task; a
//! `tts_audio` meta and its binary payload travel as a single queue item,
//! so they can never interleave with other frames.
//!
//! Cancellation is a shared flag: barge-in sets it, and both the chunk
//! relay loop and the TTS producer observe it within a bounded window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::llm::{self, ChatMessage, ChatOutcome, LlmClient};
use crate::metrics::{llm_metrics_payload, stt_metrics_payload, MetricsLogger};
use crate::protocol::{self, ClientMessage, ServerMessage, Stage};
use crate::server::language::detect_response_language;
use crate::server::sanitize::clean_for_tts;
use crate::server::session::Session;
use crate::stt::filters::check_hallucination;
use crate::stt::{SttAdapter, Transcript};
use crate::tts::{TtsChunk, TtsEngine};

/// Bounded handoff between the TTS producer and the chunk relay.
const TTS_CHANNEL_CAPACITY: usize = 4;

/// Poll interval at which the chunk relay re-checks the cancel flag.
const TTS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a closing connection waits for an in-flight pipeline.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const APOLOGY_EN: &str = "Sorry, something went wrong.";
const APOLOGY_DE: &str = "Entschuldigung, da ist etwas schiefgelaufen.";

fn apology_for(language: &str) -> &'static str {
    match language {
        "de" => APOLOGY_DE,
        _ => APOLOGY_EN,
    }
}

/// Incoming WebSocket frame, reduced to what dispatch needs.
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
}

/// Outbound frame. A pair is one queue item so the meta and its binary
/// payload stay adjacent on the wire.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Pair(String, Vec<u8>),
}

/// Model services the pipeline consumes. The live implementation wraps the
/// configured STT/LLM/TTS engines; tests substitute scripted fakes.
#[async_trait]
pub trait PipelineServices: Send + Sync + 'static {
    async fn transcribe(&self, audio: &[i16], sample_rate: u32) -> anyhow::Result<Transcript>;

    /// Fire-and-forget LLM warmup.
    fn warmup(&self);

    async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<ChatOutcome>;

    /// Stream synthesis chunks into `tx`, stopping early when `cancel` is
    /// set.
    async fn synthesize(
        &self,
        text: &str,
        language: Option<&str>,
        tx: mpsc::Sender<TtsChunk>,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<()>;
}

/// Production services backed by the configured engines.
pub struct LiveServices {
    pub stt: SttAdapter,
    pub llm: LlmClient,
    pub tts: TtsEngine,
}

#[async_trait]
impl PipelineServices for LiveServices {
    async fn transcribe(&self, audio: &[i16], sample_rate: u32) -> anyhow::Result<Transcript> {
        self.stt.transcribe(audio, sample_rate).await
    }

    fn warmup(&self) {
        self.llm.warmup();
    }

    async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<ChatOutcome> {
        self.llm.chat(messages).await
    }

    async fn synthesize(
        &self,
        text: &str,
        language: Option<&str>,
        tx: mpsc::Sender<TtsChunk>,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        self.tts.synthesize_chunks(text, language, &tx, &cancel).await
    }
}

/// Drives one connection's message dispatch and pipeline lifecycle.
pub struct SessionHandler<S: PipelineServices> {
    services: Arc<S>,
    config: Arc<Config>,
    metrics: Arc<MetricsLogger>,
    session: Arc<tokio::sync::Mutex<Session>>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    cancel: Arc<AtomicBool>,
    pipeline: Option<tokio::task::JoinHandle<()>>,
    /// Set after an `utterance_audio` meta, cleared by its binary frame.
    pending_utterance: Option<(u32, usize)>,
    conn_id: Uuid,
}

impl<S: PipelineServices> SessionHandler<S> {
    pub fn new(
        services: Arc<S>,
        config: Arc<Config>,
        metrics: Arc<MetricsLogger>,
        out_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let session = Session::new(&config.conversation);
        Self {
            services,
            config,
            metrics,
            session: Arc::new(tokio::sync::Mutex::new(session)),
            out_tx,
            cancel: Arc::new(AtomicBool::new(false)),
            pipeline: None,
            pending_utterance: None,
            conn_id: Uuid::new_v4(),
        }
    }

    fn send(&self, msg: &ServerMessage) {
        let _ = self.out_tx.send(Outbound::Text(protocol::encode_json(msg)));
    }

    fn send_protocol_error(&self, message: &str, code: &str) {
        warn!(conn = %self.conn_id, code, "{message}");
        self.metrics.log(
            "protocol_error",
            serde_json::json!({ "code": code, "conn": self.conn_id.to_string() }),
        );
        self.send(&ServerMessage::Error {
            message: message.to_string(),
            stage: Some("protocol".to_string()),
            code: Some(code.to_string()),
        });
    }

    /// Dispatch one incoming frame.
    pub async fn on_incoming(&mut self, frame: Incoming) {
        match frame {
            Incoming::Text(text) => {
                if self.pending_utterance.take().is_some() {
                    self.send_protocol_error(
                        "expected binary audio frame after utterance_audio meta",
                        "protocol_missing_binary",
                    );
                }
                match protocol::decode_client(&text) {
                    Ok(msg) => self.on_message(msg).await,
                    Err(e) => {
                        debug!(conn = %self.conn_id, "undecodable client frame: {e}");
                        self.send_protocol_error("invalid message", "protocol_invalid_meta");
                    }
                }
            }
            Incoming::Binary(bytes) => self.on_binary(bytes).await,
        }
    }

    async fn on_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Wake { score } => {
                info!(conn = %self.conn_id, score, "wake received — warming up LLM");
                self.metrics
                    .log("wake_detected", serde_json::json!({ "score": score }));
                self.services.warmup();
                // Warmup acknowledgements never originate inside a pipeline.
                self.send(&ServerMessage::WarmupAck);
            }
            ClientMessage::UtteranceAudio {
                sample_rate,
                samples,
            } => {
                if sample_rate == 0 {
                    self.send_protocol_error(
                        "utterance_audio meta is malformed",
                        "protocol_invalid_meta",
                    );
                    return;
                }
                self.pending_utterance = Some((sample_rate, samples));
            }
            ClientMessage::BargeIn => {
                info!(conn = %self.conn_id, "barge-in received");
                self.metrics.log("barge_in", serde_json::Value::Null);
                self.cancel.store(true, Ordering::SeqCst);
            }
            ClientMessage::FollowUpTimeout => {
                info!(conn = %self.conn_id, "follow-up timeout — clearing session");
                self.session.lock().await.clear();
                self.send(&ServerMessage::SessionCleared);
            }
        }
    }

    async fn on_binary(&mut self, bytes: Vec<u8>) {
        let Some((sample_rate, declared)) = self.pending_utterance.take() else {
            warn!(conn = %self.conn_id, bytes = bytes.len(), "orphan binary frame dropped");
            self.metrics.log(
                "protocol_error",
                serde_json::json!({ "code": "protocol_orphan_binary" }),
            );
            return;
        };

        let audio = match protocol::decode_audio(&bytes) {
            Ok(audio) => audio,
            Err(e) => {
                debug!(conn = %self.conn_id, "{e}");
                self.send_protocol_error("invalid audio payload", "protocol_invalid_meta");
                return;
            }
        };

        let actual = audio.len();
        let mismatch = mismatch_ratio(declared, actual);
        if mismatch > self.config.protocol.audio_mismatch_reject_ratio {
            self.send_protocol_error(
                "utterance audio size does not match meta",
                "protocol_audio_size_mismatch",
            );
            return;
        }
        if declared != actual {
            warn!(
                conn = %self.conn_id,
                declared,
                actual,
                "utterance size mismatch within tolerance"
            );
            self.metrics.log(
                "protocol_warning",
                serde_json::json!({
                    "code": "audio_size_mismatch",
                    "declared": declared,
                    "actual": actual,
                }),
            );
        }

        info!(
            conn = %self.conn_id,
            samples = actual,
            sample_rate,
            "utterance received"
        );

        // One pipeline at a time: cancel and drain any predecessor.
        if let Some(handle) = self.pipeline.take() {
            if !handle.is_finished() {
                self.cancel.store(true, Ordering::SeqCst);
                let _ = handle.await;
            }
        }
        self.cancel.store(false, Ordering::SeqCst);

        let ctx = PipelineContext {
            services: Arc::clone(&self.services),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            session: Arc::clone(&self.session),
            out_tx: self.out_tx.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        self.pipeline = Some(tokio::spawn(async move {
            run_pipeline(ctx, audio, sample_rate).await;
        }));
    }

    /// Wait for an in-flight pipeline on connection close, hard-cancelling
    /// after the drain timeout.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.pipeline.take() {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(conn = %self.conn_id, "pipeline did not drain in time — cancelling");
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
        self.metrics.flush();
    }

    /// Await pipeline completion (test synchronization point).
    #[cfg(test)]
    pub(crate) async fn join_pipeline(&mut self) {
        if let Some(handle) = self.pipeline.take() {
            let _ = handle.await;
        }
    }
}

fn mismatch_ratio(declared: usize, actual: usize) -> f64 {
    let max = declared.max(actual);
    if max == 0 {
        return 0.0;
    }
    declared.abs_diff(actual) as f64 / max as f64
}

struct PipelineContext<S: PipelineServices> {
    services: Arc<S>,
    config: Arc<Config>,
    metrics: Arc<MetricsLogger>,
    session: Arc<tokio::sync::Mutex<Session>>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    cancel: Arc<AtomicBool>,
}

impl<S: PipelineServices> PipelineContext<S> {
    fn send(&self, msg: &ServerMessage) {
        let _ = self.out_tx.send(Outbound::Text(protocol::encode_json(msg)));
    }

    fn send_chunk(&self, chunk: &TtsChunk, chunk_index: u64) {
        let meta = protocol::encode_json(&ServerMessage::TtsAudio {
            sample_rate: chunk.sample_rate,
            samples: chunk.samples.len(),
            chunk_index,
            is_last: chunk.is_last,
        });
        let _ = self
            .out_tx
            .send(Outbound::Pair(meta, protocol::encode_audio(&chunk.samples)));
    }
}

/// Full STT -> LLM -> TTS pipeline for one utterance.
async fn run_pipeline<S: PipelineServices>(
    ctx: PipelineContext<S>,
    audio: Vec<i16>,
    sample_rate: u32,
) {
    let interaction_start = Instant::now();
    let mut detected_language: Option<String> = None;

    let result = run_pipeline_inner(
        &ctx,
        &audio,
        sample_rate,
        interaction_start,
        &mut detected_language,
    )
    .await;

    if let Err(failure) = result {
        error!(
            stage = failure.stage,
            code = failure.code,
            "pipeline failed: {:#}",
            failure.source
        );
        ctx.metrics.log(
            "pipeline_error",
            serde_json::json!({ "stage": failure.stage, "code": failure.code }),
        );
        // Raw error text stays in the server logs; the wire gets the code.
        ctx.send(&ServerMessage::Error {
            message: "pipeline failed".to_string(),
            stage: Some(failure.stage.to_string()),
            code: Some(failure.code.to_string()),
        });
        speak_apology(&ctx, detected_language.as_deref()).await;
        ctx.send(&ServerMessage::TtsDone { cancelled: false });
    }
}

struct PipelineFailure {
    stage: &'static str,
    code: &'static str,
    source: anyhow::Error,
}

impl PipelineFailure {
    fn new(stage: &'static str, code: &'static str, source: anyhow::Error) -> Self {
        Self {
            stage,
            code,
            source,
        }
    }
}

async fn run_pipeline_inner<S: PipelineServices>(
    ctx: &PipelineContext<S>,
    audio: &[i16],
    sample_rate: u32,
    interaction_start: Instant,
    detected_language: &mut Option<String>,
) -> Result<(), PipelineFailure> {
    // ── STT ────────────────────────────────────────────────────────
    ctx.send(&ServerMessage::Status {
        stage: Stage::SttStart,
    });

    let transcript = ctx
        .services
        .transcribe(audio, sample_rate)
        .await
        .map_err(|e| PipelineFailure::new("stt", "pipeline_stt_failed", e))?;
    *detected_language = transcript.language.clone();

    info!(
        language = ?transcript.language,
        transcription_time_s = transcript.transcription_time_s,
        avg_logprob = transcript.avg_logprob,
        no_speech_prob = transcript.no_speech_prob,
        chars = transcript.text.len(),
        "STT complete"
    );
    ctx.metrics.log(
        "stt_complete",
        stt_metrics_payload(&transcript, ctx.config.metrics.log_transcripts),
    );
    ctx.send(&ServerMessage::Status {
        stage: Stage::SttComplete,
    });

    if transcript.text.trim().is_empty() {
        info!("empty transcript — rejecting");
        ctx.send(&ServerMessage::SttRejected {
            reason: "empty_transcript".to_string(),
        });
        return Ok(());
    }

    if let Some(reason) = check_hallucination(
        &transcript.text,
        transcript.no_speech_prob,
        transcript.avg_logprob,
        ctx.config.stt.no_speech_threshold,
        ctx.config.stt.logprob_threshold,
    ) {
        info!(%reason, "transcript rejected");
        let mut payload = serde_json::json!({
            "reason": reason,
            "text_chars": transcript.text.chars().count(),
        });
        if ctx.config.metrics.log_transcripts {
            payload["text"] = serde_json::Value::from(transcript.text.clone());
        }
        ctx.metrics.log("stt_rejected", payload);
        ctx.send(&ServerMessage::SttRejected { reason });
        return Ok(());
    }

    // ── LLM ────────────────────────────────────────────────────────
    ctx.send(&ServerMessage::Status {
        stage: Stage::LlmStart,
    });

    let messages = {
        let mut session = ctx.session.lock().await;
        session.push_user(transcript.text.clone());
        let history = session.messages();
        // History without the user turn just added.
        let prior = &history[..history.len().saturating_sub(1)];
        llm::build_messages(
            &llm::get_system_prompt(transcript.language.as_deref()),
            prior,
            &transcript.text,
        )
    };

    let outcome = ctx
        .services
        .chat(&messages)
        .await
        .map_err(|e| PipelineFailure::new("llm", "pipeline_llm_failed", e))?;

    let response_text = clean_for_tts(&outcome.text);
    if response_text != outcome.text {
        ctx.metrics.log(
            "llm_response_sanitized",
            serde_json::json!({
                "raw_chars": outcome.text.chars().count(),
                "clean_chars": response_text.chars().count(),
            }),
        );
    }

    info!(
        ttft_s = outcome.ttft_s,
        elapsed_s = outcome.elapsed_s,
        chars = response_text.len(),
        "LLM complete"
    );
    ctx.metrics.log(
        "llm_complete",
        llm_metrics_payload(&outcome, ctx.config.metrics.log_llm_text),
    );
    ctx.send(&ServerMessage::Status {
        stage: Stage::LlmComplete,
    });

    if response_text.trim().is_empty() {
        info!("empty LLM response");
        ctx.send(&ServerMessage::TtsDone { cancelled: false });
        return Ok(());
    }

    ctx.session.lock().await.push_assistant(response_text.clone());

    // ── TTS ────────────────────────────────────────────────────────
    let voice_language =
        detect_response_language(&response_text, transcript.language.as_deref());
    ctx.send(&ServerMessage::Status {
        stage: Stage::TtsStart,
    });

    let tts_start = Instant::now();
    let (chunk_tx, chunk_rx) = mpsc::channel(TTS_CHANNEL_CAPACITY);
    let producer = {
        let services = Arc::clone(&ctx.services);
        let cancel = Arc::clone(&ctx.cancel);
        let text = response_text.clone();
        tokio::spawn(async move {
            services
                .synthesize(&text, Some(voice_language), chunk_tx, cancel)
                .await
        })
    };

    let (chunks_sent, cancelled) = relay_chunks(ctx, chunk_rx).await;

    // On cancellation the done marker goes out immediately; the producer
    // may still be mid-synthesis and is joined afterwards for cleanup.
    if cancelled {
        ctx.send(&ServerMessage::TtsDone { cancelled: true });
    }

    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if !cancelled {
                return Err(PipelineFailure::new("tts", "pipeline_tts_failed", e));
            }
        }
        Err(e) => {
            if !cancelled {
                return Err(PipelineFailure::new(
                    "tts",
                    "pipeline_internal_error",
                    anyhow::anyhow!("tts producer panicked: {e}"),
                ));
            }
        }
    }

    let tts_elapsed = tts_start.elapsed().as_secs_f64();
    info!(
        chunks = chunks_sent,
        duration_s = tts_elapsed,
        voice_language,
        cancelled,
        "TTS complete"
    );
    ctx.metrics.log(
        "tts_complete",
        serde_json::json!({
            "duration_s": tts_elapsed,
            "input_language": detected_language,
            "voice_language": voice_language,
            "chunks": chunks_sent,
            "cancelled": cancelled,
        }),
    );
    if !cancelled {
        ctx.send(&ServerMessage::TtsDone { cancelled: false });
        ctx.metrics.log(
            "interaction_complete",
            serde_json::json!({
                "total_elapsed_s": interaction_start.elapsed().as_secs_f64(),
                "stt_time_s": transcript.transcription_time_s,
                "llm_ttft_s": outcome.ttft_s,
                "llm_total_s": outcome.elapsed_s,
                "tts_time_s": tts_elapsed,
                "input_language": detected_language,
                "voice_language": voice_language,
            }),
        );
    }

    Ok(())
}

/// Forward synthesized chunks to the client until the stream ends or the
/// cancel flag trips. Returns (chunks sent, cancelled).
async fn relay_chunks<S: PipelineServices>(
    ctx: &PipelineContext<S>,
    mut chunk_rx: mpsc::Receiver<TtsChunk>,
) -> (u64, bool) {
    let mut chunk_index: u64 = 0;
    let mut cancelled = false;

    loop {
        if ctx.cancel.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        match tokio::time::timeout(TTS_POLL_INTERVAL, chunk_rx.recv()).await {
            Ok(Some(chunk)) => {
                if ctx.cancel.load(Ordering::SeqCst) {
                    cancelled = true;
                    break;
                }
                if chunk.samples.is_empty() {
                    continue;
                }
                ctx.send_chunk(&chunk, chunk_index);
                chunk_index += 1;
            }
            Ok(None) => break,
            Err(_) => continue, // poll tick: re-check the cancel flag
        }
    }

    if cancelled {
        // The producer observes the flag on its next sentence; drop
        // whatever it already queued.
        chunk_rx.close();
        while chunk_rx.try_recv().is_ok() {}
    }
    (chunk_index, cancelled)
}

/// Best-effort localized apology after a pipeline failure.
async fn speak_apology<S: PipelineServices>(ctx: &PipelineContext<S>, language: Option<&str>) {
    let language = match language {
        Some("de") => "de",
        _ => "en",
    };
    let text = apology_for(language);

    let (chunk_tx, mut chunk_rx) = mpsc::channel(TTS_CHANNEL_CAPACITY);
    let producer = {
        let services = Arc::clone(&ctx.services);
        let text = text.to_string();
        // Fresh flag: the apology itself is not cancellable.
        let cancel = Arc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            services
                .synthesize(&text, Some(language), chunk_tx, cancel)
                .await
        })
    };

    let mut chunk_index = 0;
    while let Some(chunk) = chunk_rx.recv().await {
        if chunk.samples.is_empty() {
            continue;
        }
        ctx.send_chunk(&chunk, chunk_index);
        chunk_index += 1;
    }
    if let Ok(Err(e)) = producer.await {
        debug!("apology synthesis failed: {e}");
    }
}

/// Run one accepted WebSocket connection to completion.
pub async fn serve_connection<T>(
    ws: tokio_tungstenite::WebSocketStream<T>,
    services: Arc<LiveServices>,
    config: Arc<Config>,
    metrics: Arc<MetricsLogger>,
) where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                Outbound::Text(text) => sink.send(WsMessage::Text(text)).await,
                Outbound::Pair(meta, bytes) => {
                    // Two sends, one queue item: nothing can interleave.
                    match sink.send(WsMessage::Text(meta)).await {
                        Ok(()) => sink.send(WsMessage::Binary(bytes)).await,
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = result {
                debug!("outbound write failed: {e}");
                break;
            }
        }
    });

    let mut handler = SessionHandler::new(services, config, metrics, out_tx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => handler.on_incoming(Incoming::Text(text)).await,
            Ok(WsMessage::Binary(bytes)) => {
                handler.on_incoming(Incoming::Binary(bytes)).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {} // ping/pong
            Err(e) => {
                warn!("websocket receive error: {e}");
                break;
            }
        }
    }

    handler.shutdown().await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted model services for pipeline tests.
    struct FakeServices {
        transcript: StdMutex<Option<anyhow::Result<Transcript>>>,
        chat_response: StdMutex<Option<anyhow::Result<ChatOutcome>>>,
        chunks: Vec<TtsChunk>,
        /// Delay before each chunk, for cancellation timing tests.
        chunk_delay: Duration,
        chat_requests: StdMutex<Vec<Vec<ChatMessage>>>,
        warmups: StdMutex<usize>,
    }

    impl FakeServices {
        fn new() -> Self {
            Self {
                transcript: StdMutex::new(None),
                chat_response: StdMutex::new(None),
                chunks: Vec::new(),
                chunk_delay: Duration::ZERO,
                chat_requests: StdMutex::new(Vec::new()),
                warmups: StdMutex::new(0),
            }
        }

        fn with_transcript(self, text: &str) -> Self {
            self.with_full_transcript(text, "en", -0.1, 0.01)
        }

        fn with_full_transcript(
            self,
            text: &str,
            language: &str,
            avg_logprob: f64,
            no_speech_prob: f64,
        ) -> Self {
            *self.transcript.lock().unwrap() = Some(Ok(Transcript {
                text: text.to_string(),
                language: Some(language.to_string()),
                duration_s: 1.0,
                transcription_time_s: 0.2,
                avg_logprob,
                no_speech_prob,
            }));
            self
        }

        fn with_chat(self, text: &str) -> Self {
            *self.chat_response.lock().unwrap() = Some(Ok(ChatOutcome {
                text: text.to_string(),
                model: "fake".to_string(),
                elapsed_s: 0.5,
                ttft_s: 0.1,
            }));
            self
        }

        fn with_chunks(mut self, chunks: Vec<TtsChunk>) -> Self {
            self.chunks = chunks;
            self
        }
    }

    #[async_trait]
    impl PipelineServices for FakeServices {
        async fn transcribe(
            &self,
            _audio: &[i16],
            _sample_rate: u32,
        ) -> anyhow::Result<Transcript> {
            self.transcript
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted transcript")))
        }

        fn warmup(&self) {
            *self.warmups.lock().unwrap() += 1;
        }

        async fn chat(&self, messages: &[ChatMessage]) -> anyhow::Result<ChatOutcome> {
            self.chat_requests.lock().unwrap().push(messages.to_vec());
            self.chat_response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted chat response")))
        }

        async fn synthesize(
            &self,
            _text: &str,
            _language: Option<&str>,
            tx: mpsc::Sender<TtsChunk>,
            cancel: Arc<AtomicBool>,
        ) -> anyhow::Result<()> {
            for chunk in &self.chunks {
                if cancel.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if !self.chunk_delay.is_zero() {
                    tokio::time::sleep(self.chunk_delay).await;
                }
                if tx.send(chunk.clone()).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    fn handler_with(
        services: FakeServices,
    ) -> (
        SessionHandler<FakeServices>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handler = SessionHandler::new(
            Arc::new(services),
            Arc::new(Config::default()),
            Arc::new(MetricsLogger::disabled()),
            out_tx,
        );
        (handler, out_rx)
    }

    /// Flatten outbound traffic into comparable strings.
    fn drain_outbound(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Outbound::Text(text) => out.push(text),
                Outbound::Pair(meta, bytes) => {
                    out.push(meta);
                    out.push(format!("<binary {:?}>", protocol::decode_audio(&bytes).unwrap()));
                }
            }
        }
        out
    }

    fn utterance_meta(samples: usize) -> Incoming {
        Incoming::Text(protocol::encode_json(&ClientMessage::UtteranceAudio {
            sample_rate: 16_000,
            samples,
        }))
    }

    fn chunk(samples: Vec<i16>, is_last: bool) -> TtsChunk {
        TtsChunk {
            samples,
            sample_rate: 22_050,
            is_last,
        }
    }

    #[tokio::test]
    async fn happy_path_emits_the_full_ordered_sequence() {
        let services = FakeServices::new()
            .with_transcript("hello")
            .with_chat("ok")
            .with_chunks(vec![
                chunk(vec![100, 200, 300], false),
                chunk(vec![400, 500, 600], true),
            ]);
        let (mut handler, mut out_rx) = handler_with(services);

        handler
            .on_incoming(Incoming::Text(protocol::encode_json(&ClientMessage::Wake {
                score: 0.9,
            })))
            .await;
        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;

        let frames = drain_outbound(&mut out_rx);
        let expected = vec![
            r#"{"type":"warmup_ack"}"#.to_string(),
            r#"{"type":"status","stage":"stt_start"}"#.to_string(),
            r#"{"type":"status","stage":"stt_complete"}"#.to_string(),
            r#"{"type":"status","stage":"llm_start"}"#.to_string(),
            r#"{"type":"status","stage":"llm_complete"}"#.to_string(),
            r#"{"type":"status","stage":"tts_start"}"#.to_string(),
            r#"{"type":"tts_audio","sample_rate":22050,"samples":3,"chunk_index":0,"is_last":false}"#.to_string(),
            "<binary [100, 200, 300]>".to_string(),
            r#"{"type":"tts_audio","sample_rate":22050,"samples":3,"chunk_index":1,"is_last":true}"#.to_string(),
            "<binary [400, 500, 600]>".to_string(),
            r#"{"type":"tts_done","cancelled":false}"#.to_string(),
        ];
        assert_eq!(frames, expected);
    }

    #[tokio::test]
    async fn hallucination_is_rejected_after_stt_complete() {
        let services = FakeServices::new().with_full_transcript(
            "Thank you for watching.",
            "en",
            -0.1,
            0.01,
        );
        let (mut handler, mut out_rx) = handler_with(services);

        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;

        let frames = drain_outbound(&mut out_rx);
        assert_eq!(
            frames,
            vec![
                r#"{"type":"status","stage":"stt_start"}"#,
                r#"{"type":"status","stage":"stt_complete"}"#,
                r#"{"type":"stt_rejected","reason":"hallucination_blocklist"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn empty_transcript_is_rejected() {
        let services = FakeServices::new().with_transcript("   ");
        let (mut handler, mut out_rx) = handler_with(services);
        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;
        let frames = drain_outbound(&mut out_rx);
        assert!(frames
            .iter()
            .any(|f| f.contains(r#""reason":"empty_transcript""#)));
    }

    #[tokio::test]
    async fn size_mismatch_beyond_tolerance_rejects_without_pipeline() {
        let services = FakeServices::new().with_transcript("never reached");
        let (mut handler, mut out_rx) = handler_with(services);

        // Declared 1000 samples, delivered 2: ratio 0.998 > 0.2.
        handler.on_incoming(utterance_meta(1_000)).await;
        handler.on_incoming(Incoming::Binary(vec![1, 0, 2, 0])).await;
        assert!(handler.pipeline.is_none());

        let frames = drain_outbound(&mut out_rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""code":"protocol_audio_size_mismatch""#));
        assert!(frames[0].contains(r#""stage":"protocol""#));
    }

    #[tokio::test]
    async fn small_size_mismatch_is_accepted() {
        let services = FakeServices::new().with_transcript("hello").with_chat("");
        let (mut handler, _out_rx) = handler_with(services);
        // Declared 5, delivered 4: ratio 0.2, not above the threshold.
        handler.on_incoming(utterance_meta(5)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0, 4, 0]))
            .await;
        assert!(handler.pipeline.is_some());
        handler.join_pipeline().await;
    }

    #[tokio::test]
    async fn missing_binary_after_meta_is_a_protocol_error() {
        let services = FakeServices::new();
        let (mut handler, mut out_rx) = handler_with(services);
        handler.on_incoming(utterance_meta(100)).await;
        // A text frame arrives where the binary payload should be.
        handler
            .on_incoming(Incoming::Text(protocol::encode_json(
                &ClientMessage::BargeIn,
            )))
            .await;
        let frames = drain_outbound(&mut out_rx);
        assert!(frames[0].contains(r#""code":"protocol_missing_binary""#));
    }

    #[tokio::test]
    async fn orphan_binary_is_dropped_silently() {
        let services = FakeServices::new();
        let (mut handler, mut out_rx) = handler_with(services);
        handler.on_incoming(Incoming::Binary(vec![1, 0])).await;
        assert!(handler.pipeline.is_none());
        assert!(drain_outbound(&mut out_rx).is_empty());
    }

    #[tokio::test]
    async fn barge_in_cancels_promptly_with_tts_done() {
        let mut services = FakeServices::new()
            .with_transcript("hello")
            .with_chat("a long answer")
            .with_chunks(vec![
                chunk(vec![1; 100], false),
                chunk(vec![2; 100], false),
                chunk(vec![3; 100], true),
            ]);
        services.chunk_delay = Duration::from_millis(150);
        let (mut handler, mut out_rx) = handler_with(services);

        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;

        // Wait for the first chunk to hit the wire, then barge in.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            assert!(Instant::now() < deadline, "first chunk never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
            let frames_so_far = {
                let mut probe = Vec::new();
                while let Ok(frame) = out_rx.try_recv() {
                    probe.push(frame);
                }
                probe
            };
            let has_chunk = frames_so_far
                .iter()
                .any(|f| matches!(f, Outbound::Pair(_, _)));
            if has_chunk {
                break;
            }
        }

        let barge_at = Instant::now();
        handler
            .on_incoming(Incoming::Text(protocol::encode_json(
                &ClientMessage::BargeIn,
            )))
            .await;
        handler.join_pipeline().await;
        let elapsed = barge_at.elapsed();
        assert!(elapsed < Duration::from_millis(800), "cancel took {elapsed:?}");

        let frames = drain_outbound(&mut out_rx);
        assert!(frames
            .iter()
            .any(|f| f.contains(r#""type":"tts_done","cancelled":true"#)));
    }

    #[tokio::test]
    async fn pipeline_failure_sends_typed_error_and_apology() {
        // No scripted chat response: the LLM stage fails.
        let services = FakeServices::new()
            .with_transcript("hello")
            .with_chunks(vec![chunk(vec![9, 9], true)]);
        let (mut handler, mut out_rx) = handler_with(services);

        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;

        let frames = drain_outbound(&mut out_rx);
        let error = frames
            .iter()
            .find(|f| f.contains(r#""type":"error""#))
            .expect("no error frame");
        assert!(error.contains(r#""stage":"llm""#));
        assert!(error.contains(r#""code":"pipeline_llm_failed""#));
        // The raw failure text never crosses the wire.
        assert!(!error.contains("scripted"));
        // Apology audio followed by a non-cancelled tts_done.
        assert!(frames.iter().any(|f| f.contains(r#""type":"tts_audio""#)));
        assert_eq!(
            frames.last().unwrap(),
            r#"{"type":"tts_done","cancelled":false}"#
        );
    }

    #[tokio::test]
    async fn empty_llm_response_ends_with_plain_tts_done() {
        let services = FakeServices::new().with_transcript("hello").with_chat("");
        let (mut handler, mut out_rx) = handler_with(services);
        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;
        let frames = drain_outbound(&mut out_rx);
        assert!(!frames.iter().any(|f| f.contains("tts_audio")));
        assert_eq!(
            frames.last().unwrap(),
            r#"{"type":"tts_done","cancelled":false}"#
        );
    }

    #[tokio::test]
    async fn follow_up_timeout_clears_session() {
        let services = FakeServices::new();
        let (mut handler, mut out_rx) = handler_with(services);
        handler.session.lock().await.push_user("hello");
        handler
            .on_incoming(Incoming::Text(protocol::encode_json(
                &ClientMessage::FollowUpTimeout,
            )))
            .await;
        assert!(handler.session.lock().await.is_empty());
        let frames = drain_outbound(&mut out_rx);
        assert_eq!(frames, vec![r#"{"type":"session_cleared"}"#]);
    }

    #[tokio::test]
    async fn history_excludes_current_user_turn_from_prior_context() {
        let services = FakeServices::new()
            .with_transcript("second question")
            .with_chat("second answer");
        let (mut handler, _out_rx) = handler_with(services);
        {
            let mut session = handler.session.lock().await;
            session.push_user("first question");
            session.push_assistant("first answer");
        }
        handler.on_incoming(utterance_meta(3)).await;
        handler
            .on_incoming(Incoming::Binary(vec![1, 0, 2, 0, 3, 0]))
            .await;
        handler.join_pipeline().await;

        let requests = handler.services.chat_requests.lock().unwrap();
        let messages = &requests[0];
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "first question");
        assert_eq!(messages[2].content, "first answer");
        assert_eq!(messages[3].content, "second question");
        assert_eq!(messages.len(), 4);
        // Assistant turn recorded after the chat call.
        let session = handler.session.lock().await;
        assert_eq!(session.messages().last().unwrap().content, "second answer");
    }

    #[tokio::test]
    async fn wake_triggers_warmup_and_ack_only() {
        let services = FakeServices::new();
        let (mut handler, mut out_rx) = handler_with(services);
        handler
            .on_incoming(Incoming::Text(protocol::encode_json(&ClientMessage::Wake {
                score: 0.7,
            })))
            .await;
        assert_eq!(*handler.services.warmups.lock().unwrap(), 1);
        assert_eq!(drain_outbound(&mut out_rx), vec![r#"{"type":"warmup_ack"}"#]);
    }

    #[tokio::test]
    async fn invalid_json_gets_a_typed_protocol_error() {
        let services = FakeServices::new();
        let (mut handler, mut out_rx) = handler_with(services);
        handler
            .on_incoming(Incoming::Text("not json at all".to_string()))
            .await;
        let frames = drain_outbound(&mut out_rx);
        assert!(frames[0].contains(r#""code":"protocol_invalid_meta""#));
    }

    #[test]
    fn mismatch_ratio_matches_definition() {
        assert_eq!(mismatch_ratio(0, 0), 0.0);
        assert_eq!(mismatch_ratio(100, 100), 0.0);
        assert!((mismatch_ratio(1_000, 2) - 0.998).abs() < 1e-9);
        assert!((mismatch_ratio(5, 4) - 0.2).abs() < 1e-9);
    }
}
