//! HDLC-style framing for the mote serial line
//!
//! Base stations write each radio packet to the serial port as:
//!
//!   `0x7E <escaped data> 0x7E`
//!
//! where the escaped data, once unescaped, ends with a little-endian CRC-16
//! (XMODEM variant) of the preceding bytes. `0x7E` and `0x7D` inside the data
//! are sent as `0x7D, byte ^ 0x20`.
//!
//! [`FrameReassembler`] is an incremental decoder that can be fed arbitrary
//! chunks and yields whole, checksum-verified packets.
use crate::logutil::hex_snippet;
use crc::{Crc, CRC_16_XMODEM};
use log::{debug, trace, warn};
use std::ops::Deref;

pub const FLAG: u8 = 0x7E; // frame delimiter
pub const ESC: u8 = 0x7D;
pub const ESC_MASK: u8 = 0x20;

/// Length of the little-endian checksum trailer.
const CRC_LEN: usize = 2;

/// Default upper bound on an unescaped frame before it is abandoned.
pub const DEFAULT_MAX_FRAME: usize = 1024;

/// CRC-16, init 0, poly 0x1021, MSB-first, no final xor.
pub const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

pub fn crc16(data: &[u8]) -> u16 {
    FRAME_CRC.checksum(data)
}

/// A packet whose checksum has been verified. The trailer is already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPacket(Vec<u8>);

impl ValidatedPacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for ValidatedPacket {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Counters for frames the reassembler has emitted or thrown away.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub packets: u64,
    pub crc_failures: u64,
    pub short_frames: u64,
    pub escape_errors: u64,
    pub oversize_frames: u64,
    pub leading_fragments: u64,
}

#[derive(Debug)]
pub struct FrameReassembler {
    buf: Vec<u8>,
    esc: bool,
    /// A delimiter has been seen since start; bytes before it are untrusted.
    synced: bool,
    /// Current frame exceeded `max_frame`; ignore bytes until the next delimiter.
    overflow: bool,
    max_frame: usize,
    stats: FrameStats,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: Vec::with_capacity(64),
            esc: false,
            synced: false,
            overflow: false,
            max_frame: max_frame.max(CRC_LEN + 1),
            stats: FrameStats::default(),
        }
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Push bytes, returning any completed, checksum-valid packets.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ValidatedPacket> {
        let mut packets = Vec::new();
        for &b in data {
            if b == FLAG {
                if let Some(packet) = self.deliver() {
                    packets.push(packet);
                }
                continue;
            }
            if self.overflow {
                continue;
            }
            if self.esc {
                self.buf.push(b ^ ESC_MASK);
                self.esc = false;
            } else if b == ESC {
                self.esc = true;
                continue;
            } else {
                self.buf.push(b);
            }
            if self.buf.len() > self.max_frame {
                warn!(
                    "Frame exceeded {} bytes without a delimiter; discarding until next flag",
                    self.max_frame
                );
                self.stats.oversize_frames += 1;
                self.overflow = true;
                self.esc = false;
                self.buf.clear();
            }
        }
        packets
    }

    /// Close the frame in progress at a delimiter and reset for the next one.
    fn deliver(&mut self) -> Option<ValidatedPacket> {
        let frame = std::mem::take(&mut self.buf);
        let esc_pending = std::mem::replace(&mut self.esc, false);
        let overflowed = std::mem::replace(&mut self.overflow, false);

        if !self.synced {
            self.synced = true;
            if !frame.is_empty() || esc_pending {
                debug!(
                    "Discarding {} byte leading fragment received before first flag",
                    frame.len()
                );
                self.stats.leading_fragments += 1;
            }
            return None;
        }
        if overflowed {
            return None;
        }
        if esc_pending {
            warn!(
                "Escape byte immediately before flag; dropping frame: {}",
                hex_snippet(&frame, 64)
            );
            self.stats.escape_errors += 1;
            return None;
        }
        if frame.is_empty() {
            // back-to-back flags
            return None;
        }
        if frame.len() <= CRC_LEN {
            debug!("Dropping {} byte frame (too short for a checksum)", frame.len());
            self.stats.short_frames += 1;
            return None;
        }

        let split = frame.len() - CRC_LEN;
        let expected = u16::from_le_bytes([frame[split], frame[split + 1]]);
        let computed = crc16(&frame[..split]);
        if computed != expected {
            warn!(
                "Wrong CRC: computed {:#06x} != expected {:#06x} [{}]",
                computed,
                expected,
                hex_snippet(&frame, 64)
            );
            self.stats.crc_failures += 1;
            return None;
        }

        let mut frame = frame;
        frame.truncate(split);
        trace!("Frame ok, {} bytes", frame.len());
        self.stats.packets += 1;
        Some(ValidatedPacket(frame))
    }
}

/// Build a complete on-wire frame for `payload`: checksum, escaping and both flags.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + CRC_LEN);
    body.extend_from_slice(payload);
    body.extend_from_slice(&crc16(payload).to_le_bytes());

    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(FLAG);
    for b in body {
        match b {
            FLAG | ESC => {
                out.push(ESC);
                out.push(b ^ ESC_MASK);
            }
            _ => out.push(b),
        }
    }
    out.push(FLAG);
    out
}
