//! # Moteline - serial mote telemetry bridge
//!
//! Moteline reads building sensor motes through a base station attached to a
//! serial port, recovers their packets and forwards calibrated readings to a
//! message bus and to a remote time-series collector.
//!
//! ## Pipeline
//!
//! ```text
//! serial bytes ─► FrameReassembler ─► decode ─► sinks ─┬─► PublishSink ─► Publisher (bus)
//!                 (HDLC + CRC-16)    (TH/PIR/CO2)       └─► BatchSink ─► BatchBuffer ─► collector
//! ```
//!
//! ## Module Organization
//!
//! - [`mote`] - per-port pipeline: framing ([`mote::hdlc`]), packet decoding
//!   ([`mote::packet`]), node registry and byte sources
//! - [`sink`] - sample expansion and fan-out targets
//! - [`delivery`] - capacity-triggered batch buffer and HTTP collector
//! - [`config`] - TOML configuration
//! - [`metrics`] - per-port counters
//! - [`logutil`] - log formatting helpers

pub mod config;
pub mod delivery;
pub mod logutil;
pub mod metrics;
pub mod mote;
pub mod sink;
