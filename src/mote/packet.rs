//! Decoding of validated mote packets into calibrated sensor readings.
//!
//! Layout of a 29 byte packet (all multi-byte fields big-endian):
//!
//! ```text
//!  0..9   routing / sequence header (ignored)
//!  9..11  sensor type
//! 11..17  device serial id
//! 17..19  node id
//! 19..21  sequence number
//! 21..23  battery / status
//! 23..29  sensor payload (three u16 words)
//! ```
use super::hdlc::ValidatedPacket;
use crate::logutil::hex_snippet;
use std::fmt;

pub const PACKET_LEN: usize = 29;
const HEADER_LEN: usize = 9;

pub const TYPE_TH: u16 = 0x64;
pub const TYPE_PIR: u16 = 0x65;
pub const TYPE_CO2: u16 = 0x66;

// SHT11 temperature and relative humidity conversion coefficients.
pub const SHT11_D1: f64 = -40.1;
pub const SHT11_D2: f64 = 0.01;
pub const SHT11_C1: f64 = -4.0;
pub const SHT11_C2: f64 = 0.0405;
pub const SHT11_C3: f64 = -2.8e-6;

/// Six byte device serial identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialId(pub [u8; 6]);

impl fmt::Display for SerialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Fixed fields shared by every packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: u16,
    pub serial: SerialId,
    pub node_id: u16,
    pub seq: u16,
    pub battery: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    TempHumidityLight {
        temperature: f64,
        humidity: f64,
        lux: f64,
    },
    Motion {
        pir: f64,
    },
    Co2 {
        co2: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub header: PacketHeader,
    pub measurement: Measurement,
}

impl SensorReading {
    pub fn node_id(&self) -> u16 {
        self.header.node_id
    }

    pub fn serial(&self) -> SerialId {
        self.header.serial
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet length was {len}, expected 29: {dump}")]
    Length { len: usize, dump: String },

    #[error("unknown sensor type {kind:#06x} from node {node_id}")]
    UnknownType { kind: u16, node_id: u16 },
}

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

pub fn temperature_celsius(raw: u16) -> f64 {
    SHT11_D1 + SHT11_D2 * f64::from(raw)
}

pub fn relative_humidity(raw: u16) -> f64 {
    let h = f64::from(raw);
    SHT11_C1 + SHT11_C2 * h + SHT11_C3 * h * h
}

/// Parse the fixed header. Length must already be checked.
fn parse_header(p: &[u8]) -> PacketHeader {
    let mut serial = [0u8; 6];
    serial.copy_from_slice(&p[HEADER_LEN + 2..HEADER_LEN + 8]);
    PacketHeader {
        kind: be16(p, HEADER_LEN),
        serial: SerialId(serial),
        node_id: be16(p, HEADER_LEN + 8),
        seq: be16(p, HEADER_LEN + 10),
        battery: be16(p, HEADER_LEN + 12),
    }
}

/// Decode a validated packet into a calibrated reading.
pub fn decode(packet: &ValidatedPacket) -> Result<SensorReading, PacketError> {
    let p = packet.as_bytes();
    if p.len() != PACKET_LEN {
        return Err(PacketError::Length {
            len: p.len(),
            dump: hex_snippet(p, 64),
        });
    }
    let header = parse_header(p);
    let sensor = &p[HEADER_LEN + 14..PACKET_LEN];

    let measurement = match header.kind {
        TYPE_TH => Measurement::TempHumidityLight {
            temperature: temperature_celsius(be16(sensor, 0)),
            humidity: relative_humidity(be16(sensor, 2)),
            lux: f64::from(be16(sensor, 4)),
        },
        TYPE_PIR => Measurement::Motion {
            pir: f64::from(be16(sensor, 0)),
        },
        TYPE_CO2 => Measurement::Co2 {
            co2: f64::from(be16(sensor, 0)),
        },
        kind => {
            return Err(PacketError::UnknownType {
                kind,
                node_id: header.node_id,
            })
        }
    };

    Ok(SensorReading {
        header,
        measurement,
    })
}
