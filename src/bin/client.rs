//! Edge client entry point.
//!
//! Wires capture, wake detection, earcons, the server connection, and the
//! five-state control loop together, then runs until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voicelink::audio::{AudioCapture, AudioPlayer};
use voicelink::client::{ClientStateMachine, ServerConnection};
use voicelink::config::Config;
use voicelink::metrics::MetricsLogger;
use voicelink::wake::WakeDetector;

#[derive(Parser, Debug)]
#[command(name = "voicelink-client", about = "Voice assistant edge client")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server WebSocket URL (overrides config host/port).
    #[arg(long)]
    server: Option<String>,
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Log to a file under the platform data dir when possible; fall back to
    // stderr otherwise.
    let log_dir = dirs::data_dir().map(|d| d.join("voicelink"));
    if let Some(dir) = log_dir {
        if std::fs::create_dir_all(&dir).is_ok() {
            let appender = tracing_appender::rolling::never(&dir, "client.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            return Some(guard);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _guard = init_tracing();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let server_url = args.server.unwrap_or_else(|| config.server_url());

    let player = match AudioPlayer::new() {
        Ok(player) => Arc::new(player),
        Err(e) => {
            eprintln!("audio output unavailable: {e}");
            std::process::exit(1);
        }
    };

    let capture = AudioCapture::new(config.audio.clone());
    let wake = WakeDetector::new(&config.wake);
    let metrics = Arc::new(MetricsLogger::new(&config.metrics));

    info!(url = %server_url, "connecting to server");
    let connection = ServerConnection::start(server_url, &config.server);
    if !connection
        .wait_connected(std::time::Duration::from_secs(30))
        .await
    {
        error!("server not reachable yet — starting anyway, will keep reconnecting");
    }

    let mut machine = ClientStateMachine::new(
        config,
        capture,
        player,
        wake,
        connection,
        Arc::clone(&metrics),
    );

    // Ctrl-C clears the running flag; the loop notices within one tick.
    let running = machine.running_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        }
    });

    info!("voicelink client starting");
    let exit_code = match machine.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("client failed: {e}");
            1
        }
    };

    metrics.flush();
    info!("goodbye");
    std::process::exit(exit_code);
}
