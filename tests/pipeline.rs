//! End-to-end runs of a port pipeline over a recorded byte stream.

use async_trait::async_trait;
use moteline::delivery::{BatchBuffer, BatchPolicy, Collector, DeliveryError};
use moteline::mote::hdlc::encode_frame;
use moteline::mote::packet::{TYPE_CO2, TYPE_PIR, TYPE_TH};
use moteline::mote::transport::ChunkedSource;
use moteline::mote::{spawn_port, PortSettings};
use moteline::sink::{BatchSink, Channel, PublishSink, Publisher, ReadingSink, Sample};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

fn packet(kind: u16, node: u16, seq: u16, words: [u16; 3]) -> Vec<u8> {
    let mut p = vec![0u8; 9];
    p.extend_from_slice(&kind.to_be_bytes());
    p.extend_from_slice(&[0xa0, 0xb1, 0xc2, 0xd3, 0xe4, node as u8]);
    p.extend_from_slice(&node.to_be_bytes());
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&3000u16.to_be_bytes());
    for w in words {
        p.extend_from_slice(&w.to_be_bytes());
    }
    p
}

/// Split a stream into uneven chunks, with idle reads in between.
fn chunked(stream: &[u8]) -> ChunkedSource {
    let mut chunks = Vec::new();
    for (i, piece) in stream.chunks(11).enumerate() {
        chunks.push(piece.to_vec());
        if i % 3 == 0 {
            chunks.push(Vec::new());
        }
    }
    ChunkedSource::new(chunks)
}

#[derive(Default)]
struct RecordingSink {
    samples: Mutex<Vec<Sample>>,
}

#[async_trait]
impl ReadingSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn accept(&self, sample: &Sample) -> anyhow::Result<()> {
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl ReadingSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn accept(&self, _sample: &Sample) -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    }
}

#[derive(Default)]
struct RecordingPublisher {
    registered: Mutex<Vec<(u16, String)>>,
    signals: Mutex<Vec<(u16, Channel)>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn register(&self, node_id: u16, interface: &str) -> anyhow::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((node_id, interface.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        node_id: u16,
        _interface: &str,
        channel: Channel,
        _sample: &Sample,
    ) -> anyhow::Result<()> {
        self.signals.lock().unwrap().push((node_id, channel));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingCollector {
    bodies: Mutex<Vec<Value>>,
}

#[async_trait]
impl Collector for RecordingCollector {
    async fn post(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        self.bodies.lock().unwrap().push(serde_json::from_slice(&body)?);
        Ok(())
    }
}

fn mixed_stream() -> Vec<u8> {
    // tail of a frame already in flight when we started listening
    let mut stream = encode_frame(&packet(TYPE_CO2, 99, 0, [1, 0, 0]))[12..].to_vec();
    stream.extend(encode_frame(&packet(TYPE_TH, 1, 10, [6500, 1200, 350])));
    stream.extend(encode_frame(&packet(TYPE_PIR, 2, 4, [1, 0, 0])));

    let mut corrupt = encode_frame(&packet(TYPE_CO2, 3, 7, [700, 0, 0]));
    corrupt[20] = if corrupt[20] == 0x00 { 0x01 } else { 0x00 };
    stream.extend(corrupt);

    stream.extend(encode_frame(&packet(0x99, 4, 1, [5, 5, 5])));
    stream.extend(encode_frame(&packet(TYPE_CO2, 3, 8, [612, 0, 0])));
    stream
}

#[tokio::test]
async fn recorded_stream_reaches_every_sink() {
    let recorder = Arc::new(RecordingSink::default());
    let sinks: Vec<Arc<dyn ReadingSink>> = vec![Arc::new(FailingSink), recorder.clone()];

    let mut settings = PortSettings::new("/dev/ttyTEST");
    settings.namespace = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"pipeline-test");
    let pipeline = spawn_port(settings, Box::new(chunked(&mixed_stream())), sinks);
    let metrics = pipeline.metrics();
    let registry = tokio::time::timeout(Duration::from_secs(5), pipeline.join())
        .await
        .expect("pipeline did not finish")
        .unwrap();

    let samples = recorder.samples.lock().unwrap().clone();
    let seen: Vec<(u16, Channel)> = samples.iter().map(|s| (s.node_id, s.channel)).collect();
    assert_eq!(
        seen,
        vec![
            (1, Channel::Temperature),
            (1, Channel::Humidity),
            (1, Channel::Light),
            (2, Channel::Pir),
            (3, Channel::Co2),
        ]
    );
    assert_eq!(samples[3].value, 1.0);
    assert_eq!(samples[4].value, 612.0);
    assert!(samples[..3]
        .iter()
        .all(|s| s.timestamp == samples[0].timestamp));

    let snap = metrics.snapshot();
    assert_eq!(snap.packets, 4);
    assert_eq!(snap.crc_failures, 1);
    assert_eq!(snap.frames_dropped, 1);
    assert_eq!(snap.unknown_types, 1);
    assert_eq!(snap.readings, 3);
    assert_eq!(snap.sink_errors, 5);
    assert_eq!(snap.bytes_read, mixed_stream().len() as u64);

    assert_eq!(registry.len(), 3);
    assert!(registry.get(4).is_none());
}

#[tokio::test]
async fn repeated_sequence_is_suppressed_inside_window() {
    let mut stream = Vec::new();
    for _ in 0..3 {
        stream.extend(encode_frame(&packet(TYPE_PIR, 5, 77, [1, 0, 0])));
    }
    stream.extend(encode_frame(&packet(TYPE_PIR, 5, 78, [0, 0, 0])));

    let recorder = Arc::new(RecordingSink::default());
    let mut settings = PortSettings::new("/dev/ttyTEST");
    settings.duplicate_window = Some(Duration::from_secs(60));
    let pipeline = spawn_port(
        settings,
        Box::new(ChunkedSource::new(vec![stream])),
        vec![recorder.clone() as Arc<dyn ReadingSink>],
    );
    let metrics = pipeline.metrics();
    pipeline.join().await.unwrap();

    assert_eq!(recorder.samples.lock().unwrap().len(), 2);
    assert_eq!(metrics.snapshot().duplicates, 2);
}

#[tokio::test]
async fn batch_sink_groups_samples_by_path() {
    let collector = Arc::new(RecordingCollector::default());
    let buffer = Arc::new(BatchBuffer::new(
        collector.clone(),
        BatchPolicy::with_capacity(5),
    ));
    let sinks: Vec<Arc<dyn ReadingSink>> =
        vec![Arc::new(BatchSink::new("/dev/ttyTEST", buffer.clone()))];

    let pipeline = spawn_port(
        PortSettings::new("/dev/ttyTEST"),
        Box::new(chunked(&mixed_stream())),
        sinks,
    );
    pipeline.join().await.unwrap();

    let bodies = collector.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    let batch = bodies[0].as_object().unwrap();
    let mut paths: Vec<_> = batch.keys().cloned().collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/ttyTEST/1/humidity",
            "/ttyTEST/1/light",
            "/ttyTEST/1/temperature",
            "/ttyTEST/2/pir",
            "/ttyTEST/3/co2",
        ]
    );
    assert_eq!(batch["/ttyTEST/3/co2"]["Readings"][0][1], 612.0);
    assert!(batch["/ttyTEST/2/pir"]["uuid"].is_string());
    assert_eq!(buffer.pending().await, 0);
}

#[tokio::test]
async fn publish_sink_registers_each_node_interface_once() {
    let mut stream = mixed_stream();
    stream.extend(encode_frame(&packet(TYPE_TH, 1, 11, [6400, 1100, 300])));

    let publisher = Arc::new(RecordingPublisher::default());
    let sink = Arc::new(PublishSink::new("/dev/ttyTEST", publisher.clone()));
    let pipeline = spawn_port(
        PortSettings::new("/dev/ttyTEST"),
        Box::new(chunked(&stream)),
        vec![sink.clone() as Arc<dyn ReadingSink>],
    );
    pipeline.join().await.unwrap();

    assert_eq!(
        *publisher.registered.lock().unwrap(),
        vec![
            (1, "i.mote-temperature".to_string()),
            (2, "i.mote-pir".to_string()),
            (3, "i.mote-co2".to_string()),
        ]
    );
    assert_eq!(publisher.signals.lock().unwrap().len(), 8);
    assert_eq!(sink.interfaces(1).await, vec!["i.mote-temperature"]);
    assert_eq!(sink.node_count().await, 3);
}
