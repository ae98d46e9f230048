//! WebSocket client connection.
//!
//! A background task owns the socket and runs the connect/recv/send loop
//! with exponential backoff. The synchronous side of the client talks to it
//! through channels: outbound sends are enqueued, inbound messages are
//! drained by the state machine each tick.
//!
//! While disconnected, outbound payloads land in a bounded offline outbox
//! with a TTL; on reconnect the outbox drains FIFO into the socket before
//! normal sending resumes, so short server restarts do not lose control
//! messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::protocol::{self, ClientMessage, ServerMessage};

/// Parsed inbound traffic handed to the state machine.
#[derive(Debug)]
pub enum InboundEvent {
    Message(ServerMessage),
    /// A `tts_audio` meta paired with its binary frame.
    TtsChunk {
        sample_rate: u32,
        chunk_index: u64,
        is_last: bool,
        samples: Vec<i16>,
    },
}

/// Outbound wire payload.
#[derive(Debug, Clone)]
enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    fn into_ws(self) -> WsMessage {
        match self {
            Self::Text(t) => WsMessage::Text(t),
            Self::Binary(b) => WsMessage::Binary(b),
        }
    }
}

/// Bounded FIFO of timestamped payloads awaiting reconnection.
struct Outbox {
    entries: VecDeque<(Instant, Payload)>,
    capacity: usize,
    ttl: Duration,
}

impl Outbox {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    fn expire_head(&mut self, now: Instant) {
        while let Some((enqueued, _)) = self.entries.front() {
            if now.duration_since(*enqueued) >= self.ttl {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, payload: Payload, now: Instant) {
        self.expire_head(now);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((now, payload));
    }

    fn drain(&mut self, now: Instant) -> Vec<Payload> {
        self.expire_head(now);
        self.entries.drain(..).map(|(_, p)| p).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Shared {
    url: String,
    running: AtomicBool,
    connected: AtomicBool,
    outbox: Mutex<Outbox>,
    send_tx: mpsc::UnboundedSender<Payload>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    reconnect_min_s: f64,
    reconnect_max_s: f64,
}

/// Client-side connection handle.
pub struct ServerConnection {
    shared: Arc<Shared>,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ServerConnection {
    /// Create the connection and spawn its background task.
    pub fn start(url: String, config: &ServerConfig) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            url,
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            outbox: Mutex::new(Outbox::new(
                config.offline_send_buffer_size,
                Duration::from_secs_f64(config.offline_send_ttl_s),
            )),
            send_tx,
            inbound_tx,
            reconnect_min_s: config.reconnect_min_s,
            reconnect_max_s: config.reconnect_max_s,
        });

        let task = tokio::spawn(connection_loop(Arc::clone(&shared), send_rx));

        Self {
            shared,
            inbound_rx,
            task: Some(task),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Block up to `timeout` for the first successful connect.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.is_connected()
    }

    /// Stop the background task and close the connection.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    pub fn send_wake(&self, score: f64) {
        self.send_payload(Payload::Text(protocol::encode_json(&ClientMessage::Wake {
            score,
        })));
    }

    /// Send utterance meta followed by its binary PCM frame.
    pub fn send_utterance(&self, audio: &[i16], sample_rate: u32) {
        let meta = protocol::encode_json(&ClientMessage::UtteranceAudio {
            sample_rate,
            samples: audio.len(),
        });
        self.send_payload(Payload::Text(meta));
        self.send_payload(Payload::Binary(protocol::encode_audio(audio)));
    }

    pub fn send_barge_in(&self) {
        self.send_payload(Payload::Text(protocol::encode_json(&ClientMessage::BargeIn)));
    }

    pub fn send_follow_up_timeout(&self) {
        self.send_payload(Payload::Text(protocol::encode_json(
            &ClientMessage::FollowUpTimeout,
        )));
    }

    fn send_payload(&self, payload: Payload) {
        if self.shared.connected.load(Ordering::SeqCst) {
            let _ = self.shared.send_tx.send(payload);
        } else {
            let mut outbox = self.shared.outbox.lock().unwrap();
            outbox.push(payload, Instant::now());
            debug!(buffered = outbox.len(), "disconnected — payload buffered in outbox");
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Non-blocking fetch of the next inbound event.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.inbound_rx.try_recv().ok()
    }

    /// Connection with no background task, permanently disconnected; sends
    /// land in the outbox and inbound events come from `inject_inbound`.
    #[cfg(test)]
    pub(crate) fn detached(config: &ServerConfig) -> Self {
        let (send_tx, _send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                url: String::new(),
                running: AtomicBool::new(true),
                connected: AtomicBool::new(false),
                outbox: Mutex::new(Outbox::new(
                    config.offline_send_buffer_size,
                    Duration::from_secs_f64(config.offline_send_ttl_s),
                )),
                send_tx,
                inbound_tx,
                reconnect_min_s: config.reconnect_min_s,
                reconnect_max_s: config.reconnect_max_s,
            }),
            inbound_rx,
            task: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn inject_inbound(&self, event: InboundEvent) {
        let _ = self.shared.inbound_tx.send(event);
    }

    /// Text payloads currently buffered in the outbox (test observability).
    #[cfg(test)]
    pub(crate) fn outbox_texts(&self) -> Vec<String> {
        self.shared
            .outbox
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(_, p)| match p {
                Payload::Text(t) => t.clone(),
                Payload::Binary(b) => format!("<binary {} bytes>", b.len()),
            })
            .collect()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn connection_loop(shared: Arc<Shared>, mut send_rx: mpsc::UnboundedReceiver<Payload>) {
    let mut backoff = shared.reconnect_min_s;

    while shared.running.load(Ordering::SeqCst) {
        info!(url = %shared.url, "connecting to server");
        match connect_async(shared.url.as_str()).await {
            Ok((ws, _resp)) => {
                info!("connected to server");
                backoff = shared.reconnect_min_s;

                let (mut sink, mut stream) = ws.split();

                // Replay buffered payloads before normal sending resumes.
                let pending = shared.outbox.lock().unwrap().drain(Instant::now());
                if !pending.is_empty() {
                    info!(count = pending.len(), "draining offline outbox");
                }
                let mut replay_failed = false;
                for payload in pending {
                    if let Err(e) = sink.send(payload.clone().into_ws()).await {
                        warn!("outbox replay failed: {e}");
                        shared.outbox.lock().unwrap().push(payload, Instant::now());
                        replay_failed = true;
                        break;
                    }
                }
                if replay_failed {
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    backoff = (backoff * 2.0).min(shared.reconnect_max_s);
                    continue;
                }

                shared.connected.store(true, Ordering::SeqCst);

                // Anything buffered between the drain above and the flag
                // flip goes out now, still ahead of new sends.
                let stragglers = shared.outbox.lock().unwrap().drain(Instant::now());
                for payload in stragglers {
                    if sink.send(payload.into_ws()).await.is_err() {
                        break;
                    }
                }

                let mut pending_meta: Option<ServerMessage> = None;
                loop {
                    tokio::select! {
                        outbound = send_rx.recv() => {
                            let Some(payload) = outbound else { return };
                            if let Err(e) = sink.send(payload.clone().into_ws()).await {
                                warn!("send failed: {e}");
                                shared.outbox.lock().unwrap().push(payload, Instant::now());
                                break;
                            }
                        }
                        inbound = stream.next() => {
                            match inbound {
                                Some(Ok(msg)) => {
                                    if !handle_inbound(&shared, msg, &mut pending_meta) {
                                        break;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!("receive failed: {e}");
                                    break;
                                }
                                None => {
                                    info!("server closed the connection");
                                    break;
                                }
                            }
                        }
                    }
                }

                shared.connected.store(false, Ordering::SeqCst);
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                warn!(backoff_s = backoff, "connection lost — reconnecting");
            }
            Err(e) => {
                warn!(backoff_s = backoff, "connect failed: {e}");
            }
        }

        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
        backoff = (backoff * 2.0).min(shared.reconnect_max_s);
    }
}

/// Dispatch one frame from the server. Returns false on a fatal frame.
fn handle_inbound(
    shared: &Shared,
    msg: WsMessage,
    pending_meta: &mut Option<ServerMessage>,
) -> bool {
    match msg {
        WsMessage::Text(text) => match protocol::decode_server(&text) {
            Ok(parsed) => {
                if matches!(parsed, ServerMessage::TtsAudio { .. }) {
                    // The matching binary frame follows immediately.
                    *pending_meta = Some(parsed);
                } else {
                    let _ = shared.inbound_tx.send(InboundEvent::Message(parsed));
                }
                true
            }
            Err(e) => {
                warn!("undecodable server message: {e}");
                true
            }
        },
        WsMessage::Binary(bytes) => {
            match pending_meta.take() {
                Some(ServerMessage::TtsAudio {
                    sample_rate,
                    samples,
                    chunk_index,
                    is_last,
                }) => match protocol::decode_audio(&bytes) {
                    Ok(audio) => {
                        if audio.len() != samples {
                            debug!(
                                declared = samples,
                                actual = audio.len(),
                                "tts_audio sample count mismatch"
                            );
                        }
                        let _ = shared.inbound_tx.send(InboundEvent::TtsChunk {
                            sample_rate,
                            chunk_index,
                            is_last,
                            samples: audio,
                        });
                    }
                    Err(e) => warn!("undecodable tts audio frame: {e}"),
                },
                _ => {
                    warn!(bytes = bytes.len(), "orphan binary frame dropped");
                }
            }
            true
        }
        WsMessage::Close(_) => false,
        // Ping/pong handled by tungstenite.
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    fn payload_str(p: &Payload) -> &str {
        match p {
            Payload::Text(t) => t,
            Payload::Binary(_) => "<binary>",
        }
    }

    #[test]
    fn outbox_preserves_fifo_order() {
        let mut outbox = Outbox::new(10, Duration::from_secs(5));
        let now = Instant::now();
        outbox.push(text("a"), now);
        outbox.push(text("b"), now);
        outbox.push(text("c"), now);
        let drained = outbox.drain(now);
        let order: Vec<&str> = drained.iter().map(payload_str).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn outbox_overflow_drops_oldest() {
        // Capacity 2: wake, barge_in, follow_up_timeout keeps the last two.
        let mut outbox = Outbox::new(2, Duration::from_secs(5));
        let now = Instant::now();
        outbox.push(text("wake"), now);
        outbox.push(text("barge_in"), now);
        outbox.push(text("follow_up_timeout"), now);
        let drained = outbox.drain(now);
        let order: Vec<&str> = drained.iter().map(payload_str).collect();
        assert_eq!(order, vec!["barge_in", "follow_up_timeout"]);
    }

    #[test]
    fn outbox_expires_entries_past_ttl() {
        let mut outbox = Outbox::new(10, Duration::from_secs(5));
        let t0 = Instant::now();
        outbox.push(text("old"), t0);
        let t1 = t0 + Duration::from_secs(6);
        outbox.push(text("fresh"), t1);
        let drained = outbox.drain(t1);
        let order: Vec<&str> = drained.iter().map(payload_str).collect();
        assert_eq!(order, vec!["fresh"]);
    }

    #[test]
    fn outbox_drain_is_contiguous_suffix_of_enqueue_order() {
        let mut outbox = Outbox::new(3, Duration::from_secs(5));
        let now = Instant::now();
        for name in ["m1", "m2", "m3", "m4", "m5"] {
            outbox.push(text(name), now);
        }
        let drained = outbox.drain(now);
        let order: Vec<&str> = drained.iter().map(payload_str).collect();
        assert_eq!(order, vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn outbox_empty_after_drain() {
        let mut outbox = Outbox::new(4, Duration::from_secs(5));
        let now = Instant::now();
        outbox.push(text("x"), now);
        assert_eq!(outbox.drain(now).len(), 1);
        assert_eq!(outbox.len(), 0);
        assert!(outbox.drain(now).is_empty());
    }

    #[test]
    fn binary_without_meta_is_dropped() {
        let (send_tx, _send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            url: String::new(),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            outbox: Mutex::new(Outbox::new(4, Duration::from_secs(5))),
            send_tx,
            inbound_tx,
            reconnect_min_s: 1.0,
            reconnect_max_s: 30.0,
        };
        let mut pending = None;
        assert!(handle_inbound(
            &shared,
            WsMessage::Binary(vec![1, 0, 2, 0]),
            &mut pending
        ));
        assert!(inbound_rx.try_recv().is_err());
    }

    #[test]
    fn tts_meta_pairs_with_following_binary() {
        let (send_tx, _send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            url: String::new(),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            outbox: Mutex::new(Outbox::new(4, Duration::from_secs(5))),
            send_tx,
            inbound_tx,
            reconnect_min_s: 1.0,
            reconnect_max_s: 30.0,
        };
        let meta = protocol::encode_json(&ServerMessage::TtsAudio {
            sample_rate: 24_000,
            samples: 2,
            chunk_index: 0,
            is_last: false,
        });
        let mut pending = None;
        handle_inbound(&shared, WsMessage::Text(meta), &mut pending);
        // Meta alone emits nothing.
        assert!(inbound_rx.try_recv().is_err());
        handle_inbound(&shared, WsMessage::Binary(vec![1, 0, 2, 0]), &mut pending);
        match inbound_rx.try_recv().unwrap() {
            InboundEvent::TtsChunk {
                sample_rate,
                chunk_index,
                is_last,
                samples,
            } => {
                assert_eq!(sample_rate, 24_000);
                assert_eq!(chunk_index, 0);
                assert!(!is_last);
                assert_eq!(samples, vec![1, 2]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
