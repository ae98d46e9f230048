//! Processing server entry point.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicelink::config::Config;
use voicelink::server::{run_server, ServerContext};

#[derive(Parser, Debug)]
#[command(name = "voicelink-server", about = "Voice assistant processing server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config).
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = dirs::data_dir().map(|d| d.join("voicelink"));
    if let Some(dir) = log_dir {
        if std::fs::create_dir_all(&dir).is_ok() {
            let appender = tracing_appender::rolling::never(&dir, "server.log");
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

    // The bind address comes from the shared `server` group unless
    // overridden; the default host only makes sense for the client side,
    // so a server binds all interfaces when unconfigured.
    let host = args.host.unwrap_or_else(|| {
        if config.server.host == "localhost" {
            "0.0.0.0".to_string()
        } else {
            config.server.host.clone()
        }
    });
    let port = args.port.unwrap_or(config.server.port);

    let ctx = match ServerContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("server startup failed: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = run_server(ctx, &host, port) => {
            if let Err(e) = result {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
    std::process::exit(0);
}
