//! Binary entrypoint for the Moteline CLI.
//!
//! Commands:
//! - `start [--port <path>]...` - run the bridge on the configured (or given) serial ports
//! - `init` - write a starter `config.toml`
//! - `smoke-test --port <path> [-b <baud>] [--timeout <s>]` - listen on a port and report frame health
//!
//! See the library crate docs for module-level details: `moteline::`.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moteline::config::Config;
use moteline::delivery::{BatchBuffer, HttpCollector};
use moteline::mote::hdlc::FrameReassembler;
use moteline::mote::packet::{self, Measurement};
use moteline::mote::transport::ByteSource;
use moteline::mote::{spawn_port, transport, PortPipeline};
use moteline::sink::{BatchSink, LogPublisher, PublishSink, Publisher, ReadingSink};

#[derive(Parser)]
#[command(name = "moteline")]
#[command(about = "Serial mote telemetry bridge")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start reading motes and forwarding readings
    Start {
        /// Serial port(s) to read; replaces the configured list when given
        #[arg(short, long)]
        port: Vec<String>,
    },
    /// Write a default configuration file
    Init,
    /// Listen on a serial port and report how many frames and readings arrive
    SmokeTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds to listen
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting Moteline v{}", env!("CARGO_PKG_VERSION"));
            run_bridge(config, port).await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::SmokeTest {
            port,
            baud,
            timeout,
        } => {
            let pre_config = Config::load(&cli.config).await.ok();
            init_logging(&pre_config, cli.verbose);
            let read_timeout = pre_config
                .as_ref()
                .map(|c| c.serial.read_timeout_ms)
                .unwrap_or(500);
            let payload = smoke_test(&port, baud, read_timeout, timeout).await?;
            println!("{}", payload);
        }
    }

    Ok(())
}

async fn run_bridge(config: Config, cli_ports: Vec<String>) -> Result<()> {
    let ports = if cli_ports.is_empty() {
        config.serial.ports.clone()
    } else {
        cli_ports
    };
    if ports.is_empty() {
        bail!("No serial ports configured (set serial.ports or pass --port)");
    }

    let collector = Arc::new(HttpCollector::new(config.collector.uri.clone()));
    let buffer = Arc::new(BatchBuffer::new(collector, config.collector.policy()));
    info!(
        "Delivering to {} in batches of {}",
        config.collector.uri, config.collector.capacity
    );

    // Open every port before starting any worker: a missing device is fatal.
    let mut sources = Vec::with_capacity(ports.len());
    for port in &ports {
        let source =
            transport::open_serial(port, config.serial.baud_rate, config.serial.read_timeout_ms)?;
        info!("Opened {} at {} baud", port, config.serial.baud_rate);
        sources.push((port.clone(), source));
    }

    let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher::new(config.mote.base_uri.clone()));
    let pipelines: Vec<PortPipeline> = sources
        .into_iter()
        .map(|(port, source)| {
            let sinks: Vec<Arc<dyn ReadingSink>> = vec![
                Arc::new(PublishSink::new(port.clone(), publisher.clone())),
                Arc::new(BatchSink::new(port.clone(), buffer.clone())),
            ];
            spawn_port(config.port_settings(&port), source, sinks)
        })
        .collect();

    let stats_every = config.logging.stats_interval_secs;
    let mut stats_tick = tokio::time::interval(Duration::from_secs(stats_every.max(1)));
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut finished_poll = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = stats_tick.tick(), if stats_every > 0 => {
                for p in &pipelines {
                    info!("{}: {:?}", p.port(), p.metrics().snapshot());
                }
                match buffer.try_snapshot() {
                    Some((stats, pending)) => {
                        info!("delivery: {:?}, pending {}", stats, pending)
                    }
                    None => info!("delivery: flush in progress"),
                }
            }
            _ = finished_poll.tick() => {
                if pipelines.iter().all(|p| p.is_finished()) {
                    warn!("All serial readers have stopped");
                    break;
                }
            }
        }
    }

    for p in &pipelines {
        p.shutdown();
    }
    for p in pipelines {
        let port = p.port().to_string();
        match p.join().await {
            Ok(registry) => info!("{}: stopped, {} nodes seen", port, registry.len()),
            Err(e) => warn!("{}", e),
        }
    }

    // Best effort: whatever is still pending is lost if this fails.
    match buffer.flush().await {
        Ok(0) => {}
        Ok(n) => info!("Flushed {} pending readings on shutdown", n),
        Err(e) => warn!(
            "Final flush failed, {} readings lost: {}",
            buffer.pending().await,
            e
        ),
    }
    Ok(())
}

async fn smoke_test(
    port: &str,
    baud: u32,
    read_timeout_ms: u64,
    listen_secs: u64,
) -> Result<serde_json::Value> {
    let mut source = transport::open_serial(port, baud, read_timeout_ms)?;
    info!("Starting smoke test on {} @ {} baud", port, baud);

    let summary = tokio::task::spawn_blocking(move || {
        let deadline = Instant::now() + Duration::from_secs(listen_secs);
        let mut reassembler = FrameReassembler::new();
        let mut buf = [0u8; 256];
        let mut bytes = 0usize;
        let (mut th, mut pir, mut co2, mut rejected) = (0u64, 0u64, 0u64, 0u64);
        while Instant::now() < deadline {
            let n = match source.read_chunk(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if transport::is_idle(e) => continue,
                Err(e) => return Err(e),
            };
            bytes += n;
            for packet in reassembler.feed(&buf[..n]) {
                match packet::decode(&packet).map(|r| r.measurement) {
                    Ok(Measurement::TempHumidityLight { .. }) => th += 1,
                    Ok(Measurement::Motion { .. }) => pir += 1,
                    Ok(Measurement::Co2 { .. }) => co2 += 1,
                    Err(_) => rejected += 1,
                }
            }
        }
        let stats = reassembler.stats();
        Ok(serde_json::json!({
            "status": if stats.packets > 0 { "ok" } else { "no_frames" },
            "bytes": bytes,
            "packets": stats.packets,
            "crc_failures": stats.crc_failures,
            "short_frames": stats.short_frames,
            "escape_errors": stats.escape_errors,
            "oversize_frames": stats.oversize_frames,
            "readings": { "temperature": th, "pir": pir, "co2": co2 },
            "rejected_packets": rejected,
            "listen_seconds": listen_secs,
        }))
    })
    .await
    .context("smoke test worker panicked")??;
    Ok(summary)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));

            // Echo to the console only when attached to a terminal
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
            let _ = builder.try_init();
            return;
        }
        eprintln!("Could not open log file {}; logging to console", file);
    }
    builder.format(|fmt, record| {
        writeln!(
            fmt,
            "{} [{}] {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            record.level(),
            record.args()
        )
    });
    let _ = builder.try_init();
}
