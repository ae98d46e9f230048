//! Soak monitor entry point.
//!
//! Tails the metrics JSONL file for a fixed duration (optionally launching
//! the monitored process itself), prints periodic status and a final
//! summary, and exits non-zero when any robustness threshold is violated.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use clap::Parser;

use voicelink::soak::{evaluate_thresholds, percentile, read_new_events, SoakStats, Thresholds};

#[derive(Parser, Debug)]
#[command(name = "voicelink-soak", about = "Robustness soak checks over metrics JSONL")]
struct Args {
    /// Path to the metrics JSONL file.
    #[arg(long, default_value = "metrics.jsonl")]
    metrics_file: PathBuf,

    /// Monitoring duration in seconds.
    #[arg(long, default_value_t = 900)]
    duration_s: u64,

    /// Polling interval in seconds.
    #[arg(long, default_value_t = 1.0)]
    poll_s: f64,

    /// Status print cadence in seconds.
    #[arg(long, default_value_t = 30)]
    status_every_s: u64,

    /// Optional command to launch while monitoring.
    #[arg(long, default_value = "")]
    command: String,

    /// Include existing metrics lines instead of only new ones.
    #[arg(long)]
    include_existing: bool,

    #[arg(long, default_value_t = 3)]
    min_interactions: u64,

    #[arg(long, default_value_t = 0)]
    max_pipeline_errors: u64,

    #[arg(long, default_value_t = 50)]
    max_listening_timeouts: u64,

    #[arg(long, default_value_t = 2000)]
    max_audio_frame_drops: u64,

    #[arg(long, default_value_t = 10.0)]
    max_p95_latency_s: f64,
}

fn start_process(command: &str) -> Option<Child> {
    if command.is_empty() {
        return None;
    }
    let argv: Vec<&str> = command.split_whitespace().collect();
    let (program, args) = argv.split_first()?;
    println!("[soak] launching: {command}");
    match Command::new(program).args(args).spawn() {
        Ok(child) => Some(child),
        Err(e) => {
            eprintln!("[soak] failed to launch '{command}': {e}");
            None
        }
    }
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(child.id() as i32), signal);
}

/// Wait up to `timeout` for the child to exit.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Stop the monitored process: graceful interrupt, then terminate, then
/// kill.
fn stop_process(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    #[cfg(unix)]
    {
        send_signal(child, nix::sys::signal::Signal::SIGINT);
        if wait_with_timeout(child, Duration::from_secs(10)) {
            return;
        }
        send_signal(child, nix::sys::signal::Signal::SIGTERM);
        if wait_with_timeout(child, Duration::from_secs(5)) {
            return;
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn print_status(stats: &SoakStats, elapsed: Duration) {
    let p95 = percentile(&stats.interaction_latencies, 0.95);
    println!(
        "[soak] t={:6.1}s events={} interactions={} pipeline_errors={} listening_timeouts={} drops={} p95={:.2}s",
        elapsed.as_secs_f64(),
        stats.events_total,
        stats.interactions,
        stats.pipeline_errors,
        stats.listening_timeouts,
        stats.audio_frame_drops,
        p95,
    );
}

fn main() {
    let args = Args::parse();

    let thresholds = Thresholds {
        min_interactions: args.min_interactions,
        max_pipeline_errors: args.max_pipeline_errors,
        max_listening_timeouts: args.max_listening_timeouts,
        max_audio_frame_drops: args.max_audio_frame_drops,
        max_p95_latency_s: args.max_p95_latency_s,
    };

    let mut offset = 0u64;
    if !args.include_existing {
        if let Ok(meta) = std::fs::metadata(&args.metrics_file) {
            offset = meta.len();
        }
    }

    let mut child = start_process(&args.command);
    let mut stats = SoakStats::default();

    let start = Instant::now();
    let mut last_status = start;
    let duration = Duration::from_secs(args.duration_s);
    let poll = Duration::from_secs_f64(args.poll_s.max(0.05));

    println!(
        "[soak] monitoring '{}' for {}s (poll={}s, include_existing={})",
        args.metrics_file.display(),
        args.duration_s,
        args.poll_s,
        args.include_existing,
    );

    while start.elapsed() < duration {
        match read_new_events(&args.metrics_file, offset) {
            Ok((events, new_offset)) => {
                offset = new_offset;
                for event in &events {
                    stats.add_event(event);
                }
            }
            Err(e) => eprintln!("[soak] metrics read error: {e}"),
        }

        if last_status.elapsed() >= Duration::from_secs(args.status_every_s) {
            print_status(&stats, start.elapsed());
            last_status = Instant::now();
        }

        if let Some(proc) = child.as_mut() {
            if let Ok(Some(status)) = proc.try_wait() {
                println!("[soak] monitored command exited early with {status}");
                child = None;
                break;
            }
        }

        std::thread::sleep(poll);
    }

    if let Some(mut proc) = child {
        stop_process(&mut proc);
    }

    // Final read in case the last cycle wrote metrics.
    if let Ok((events, _)) = read_new_events(&args.metrics_file, offset) {
        for event in &events {
            stats.add_event(event);
        }
    }

    println!("{}", stats.summary());
    let failures = evaluate_thresholds(&stats, &thresholds);
    if failures.is_empty() {
        println!("Soak Result: PASS");
        std::process::exit(0);
    }
    println!("Soak Result: FAIL");
    for failure in &failures {
        println!("- {failure}");
    }
    std::process::exit(1);
}
