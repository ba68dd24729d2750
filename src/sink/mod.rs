//! Fan-out targets for decoded readings.
//!
//! Every [`SensorReading`] is expanded into one [`Sample`] per measured
//! channel, and each sample is handed to every sink of the port in order.
//! A failing sink is logged and does not stop the others.
use crate::mote::packet::{Measurement, SensorReading, SerialId};
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

pub mod batch;
pub mod publish;

pub use batch::BatchSink;
pub use publish::{LogPublisher, PublishSink, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Temperature,
    Humidity,
    Light,
    Pir,
    Co2,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Temperature => "temperature",
            Channel::Humidity => "humidity",
            Channel::Light => "light",
            Channel::Pir => "pir",
            Channel::Co2 => "co2",
        }
    }

    /// Bus interface a channel is published under. Temperature, humidity and light share one.
    pub fn interface(&self) -> &'static str {
        match self {
            Channel::Temperature | Channel::Humidity | Channel::Light => "i.mote-temperature",
            Channel::Pir => "i.mote-pir",
            Channel::Co2 => "i.mote-co2",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One channel of a reading, ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub node_id: u16,
    pub serial: SerialId,
    pub channel: Channel,
    pub uuid: Uuid,
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub value: f64,
}

/// Stable stream identifier for a device serial and channel.
pub fn stream_uuid(namespace: &Uuid, serial: &SerialId, channel: Channel) -> Uuid {
    Uuid::new_v5(namespace, format!("{}-{}", serial, channel).as_bytes())
}

/// Collector path for a channel: serial port without `/dev`, node id, channel.
pub fn destination_path(port: &str, node_id: u16, channel: Channel) -> String {
    let port = port.strip_prefix("/dev").unwrap_or(port);
    format!("{}/{}/{}", port, node_id, channel)
}

pub fn expand(reading: &SensorReading, namespace: &Uuid, timestamp: i64) -> Vec<Sample> {
    let values: Vec<(Channel, f64)> = match reading.measurement {
        Measurement::TempHumidityLight {
            temperature,
            humidity,
            lux,
        } => vec![
            (Channel::Temperature, temperature),
            (Channel::Humidity, humidity),
            (Channel::Light, lux),
        ],
        Measurement::Motion { pir } => vec![(Channel::Pir, pir)],
        Measurement::Co2 { co2 } => vec![(Channel::Co2, co2)],
    };
    values
        .into_iter()
        .map(|(channel, value)| Sample {
            node_id: reading.node_id(),
            serial: reading.serial(),
            channel,
            uuid: stream_uuid(namespace, &reading.serial(), channel),
            timestamp,
            value,
        })
        .collect()
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    fn name(&self) -> &str;

    async fn accept(&self, sample: &Sample) -> anyhow::Result<()>;
}
