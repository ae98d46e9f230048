//! Processing server: WebSocket listener and per-connection pipeline.

pub mod handler;
pub mod language;
pub mod sanitize;
pub mod session;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::llm::LlmClient;
use crate::metrics::MetricsLogger;
use crate::stt::{create_stt_engine, SttAdapter};
use crate::tts::TtsEngine;

use handler::LiveServices;

/// Components shared by every connection.
pub struct ServerContext {
    pub config: Arc<Config>,
    pub services: Arc<LiveServices>,
    pub metrics: Arc<MetricsLogger>,
}

impl ServerContext {
    /// Initialize STT, LLM, TTS, and metrics from configuration.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        info!(engine = %config.stt.engine, model = %config.stt.model_size, "initializing STT");
        let stt: SttAdapter = create_stt_engine(&config.stt)?;

        info!(model = %config.llm.model, "initializing LLM client");
        let llm = LlmClient::new(config.llm.clone());

        info!(engine = %config.tts.engine, "initializing TTS");
        let tts = TtsEngine::new(&config.tts)?;

        let metrics = Arc::new(MetricsLogger::new(&config.metrics));

        Ok(Self {
            config: Arc::new(config),
            services: Arc::new(LiveServices { stt, llm, tts }),
            metrics,
        })
    }
}

/// Accept loop: one session handler per connection.
pub async fn run_server(ctx: ServerContext, host: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {host}:{port}: {e}"))?;
    info!("listening on ws://{host}:{port}/ws");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!(%peer, "client connected");
        let services = Arc::clone(&ctx.services);
        let config = Arc::clone(&ctx.config);
        let metrics = Arc::clone(&ctx.metrics);
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    handler::serve_connection(ws, services, config, metrics).await;
                    info!(%peer, "connection closed");
                }
                Err(e) => warn!(%peer, "websocket handshake failed: {e}"),
            }
        });
    }
}
