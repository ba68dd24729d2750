//! # Serial mote pipeline
//!
//! One pipeline runs per serial port and shares nothing with other ports
//! except the sinks it is given:
//!
//! ```text
//! ByteSource ──► reader worker ──(bounded queue)──► decoder task ──► sinks
//!               (FrameReassembler)                  (decode, registry)
//! ```
//!
//! The reader is a blocking worker that owns the byte source and the
//! [`FrameReassembler`]. Validated packets go through a bounded channel; when
//! it is full the reader waits, which is fine at serial line rates. The
//! decoder task decodes, filters duplicates via the port's [`NodeRegistry`],
//! expands readings into samples and hands each one to every sink.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use moteline::mote::{spawn_port, transport, PortSettings};
//! use moteline::sink::{LogPublisher, PublishSink, ReadingSink};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let source = transport::open_serial("/dev/ttyUSB0", 115200, 500)?;
//! let publisher = Arc::new(LogPublisher::new("building/motes"));
//! let sinks: Vec<Arc<dyn ReadingSink>> = vec![Arc::new(PublishSink::new("/dev/ttyUSB0", publisher))];
//! let pipeline = spawn_port(PortSettings::new("/dev/ttyUSB0"), source, sinks);
//! let registry = pipeline.join().await?;
//! println!("heard {} nodes", registry.len());
//! # Ok(())
//! # }
//! ```
use crate::metrics::PipelineMetrics;
use crate::sink::{self, ReadingSink};
use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod hdlc;
pub mod packet;
pub mod registry;
pub mod transport;

use hdlc::{FrameReassembler, ValidatedPacket};
use packet::PacketError;
use registry::{NodeRegistry, Observation};
use transport::{is_idle, ByteSource};

/// Packets buffered between reader and decoder before the reader blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_READ_CHUNK: usize = 128;

#[derive(Debug, Clone)]
pub struct PortSettings {
    pub port: String,
    pub read_chunk: usize,
    pub queue_capacity: usize,
    pub max_frame: usize,
    /// Namespace for per-stream UUIDv5 identifiers.
    pub namespace: Uuid,
    /// Suppress repeated (node, type, seq) packets inside this window.
    pub duplicate_window: Option<Duration>,
}

impl PortSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            read_chunk: DEFAULT_READ_CHUNK,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame: hdlc::DEFAULT_MAX_FRAME,
            namespace: Uuid::nil(),
            duplicate_window: None,
        }
    }
}

/// Handle to the running workers of one serial port.
pub struct PortPipeline {
    port: String,
    metrics: Arc<PipelineMetrics>,
    shutdown: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    decoder: JoinHandle<NodeRegistry>,
}

impl PortPipeline {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.decoder.is_finished()
    }

    /// Ask the reader to stop after its current read.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Wait for both workers to finish and return what the port learned about its nodes.
    pub async fn join(self) -> Result<NodeRegistry> {
        self.reader
            .await
            .map_err(|e| anyhow!("{}: reader worker failed: {}", self.port, e))?;
        self.decoder
            .await
            .map_err(|e| anyhow!("{}: decoder task failed: {}", self.port, e))
    }
}

/// Start the reader worker and decoder task for one port. Must be called inside a Tokio runtime.
pub fn spawn_port(
    settings: PortSettings,
    source: Box<dyn ByteSource>,
    sinks: Vec<Arc<dyn ReadingSink>>,
) -> PortPipeline {
    let metrics = Arc::new(PipelineMetrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

    let reader = {
        let port = settings.port.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        let reassembler = FrameReassembler::with_max_frame(settings.max_frame);
        let chunk = settings.read_chunk.max(1);
        tokio::task::spawn_blocking(move || {
            run_reader(&port, source, reassembler, tx, &metrics, &shutdown, chunk)
        })
    };

    let decoder = {
        let port = settings.port.clone();
        let metrics = metrics.clone();
        let registry = NodeRegistry::new(settings.duplicate_window);
        let namespace = settings.namespace;
        tokio::spawn(
            async move { run_decoder(&port, rx, sinks, registry, namespace, &metrics).await },
        )
    };

    PortPipeline {
        port: settings.port,
        metrics,
        shutdown,
        reader,
        decoder,
    }
}

fn run_reader(
    port: &str,
    mut source: Box<dyn ByteSource>,
    mut reassembler: FrameReassembler,
    tx: mpsc::Sender<ValidatedPacket>,
    metrics: &PipelineMetrics,
    shutdown: &AtomicBool,
    chunk: usize,
) {
    info!("{}: reader started", port);
    let mut buf = vec![0u8; chunk];
    while !shutdown.load(Ordering::Relaxed) {
        match source.read_chunk(&mut buf) {
            Ok(0) => {
                info!("{}: byte source closed", port);
                break;
            }
            Ok(n) => {
                metrics.add_bytes(n);
                trace!("{}: RAW {}", port, crate::logutil::hex_snippet(&buf[..n], 32));
                let packets = reassembler.feed(&buf[..n]);
                metrics.record_frames(&reassembler.stats());
                for packet in packets {
                    if tx.blocking_send(packet).is_err() {
                        warn!("{}: decoder gone, stopping reader", port);
                        return;
                    }
                }
            }
            Err(ref e) if is_idle(e) => {}
            Err(e) => {
                warn!("{}: serial read error (continuing): {}", port, e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
    let stats = reassembler.stats();
    info!(
        "{}: reader stopped ({} packets, {} bad checksums)",
        port, stats.packets, stats.crc_failures
    );
}

async fn run_decoder(
    port: &str,
    mut rx: mpsc::Receiver<ValidatedPacket>,
    sinks: Vec<Arc<dyn ReadingSink>>,
    mut registry: NodeRegistry,
    namespace: Uuid,
    metrics: &PipelineMetrics,
) -> NodeRegistry {
    while let Some(packet) = rx.recv().await {
        let reading = match packet::decode(&packet) {
            Ok(reading) => reading,
            Err(e @ PacketError::UnknownType { .. }) => {
                metrics.inc_unknown_type();
                warn!("{}: dropping packet: {}", port, e);
                continue;
            }
            Err(e) => {
                metrics.inc_rejected();
                warn!("{}: dropping packet: {}", port, e);
                continue;
            }
        };

        match registry.observe(&reading.header, Instant::now()) {
            Observation::Duplicate => {
                metrics.inc_duplicate();
                debug!(
                    "{}: duplicate seq {} from node {}",
                    port, reading.header.seq, reading.header.node_id
                );
                continue;
            }
            Observation::New => info!(
                "{}: new node {} (serial {})",
                port,
                reading.node_id(),
                reading.serial()
            ),
            Observation::Seen => {}
        }

        metrics.inc_reading();
        debug!("{}: reading {:?}", port, reading.measurement);
        let timestamp = chrono::Utc::now().timestamp_millis();
        for sample in sink::expand(&reading, &namespace, timestamp) {
            for target in &sinks {
                if let Err(e) = target.accept(&sample).await {
                    metrics.inc_sink_error();
                    warn!(
                        "{}: sink '{}' failed for node {} {}: {}",
                        port,
                        target.name(),
                        sample.node_id,
                        sample.channel,
                        e
                    );
                }
            }
        }
    }
    debug!("{}: packet queue closed, decoder stopping", port);
    registry
}
