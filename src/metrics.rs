//! Pipeline counters shared between the reader worker and the decoder task of a port.
use crate::mote::hdlc::FrameStats;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    bytes_read: AtomicU64,
    packets: AtomicU64,
    crc_failures: AtomicU64,
    frames_dropped: AtomicU64,
    packets_rejected: AtomicU64,
    unknown_types: AtomicU64,
    duplicates: AtomicU64,
    readings: AtomicU64,
    sink_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Publish the reassembler's totals. Called by the reader worker after each chunk.
    pub fn record_frames(&self, stats: &FrameStats) {
        let dropped = stats.short_frames
            + stats.escape_errors
            + stats.oversize_frames
            + stats.leading_fragments;
        self.packets.store(stats.packets, Ordering::Relaxed);
        self.crc_failures.store(stats.crc_failures, Ordering::Relaxed);
        self.frames_dropped.store(dropped, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_type(&self) {
        self.unknown_types.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reading(&self) {
        self.readings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            crc_failures: self.crc_failures.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            unknown_types: self.unknown_types.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes_read: u64,
    pub packets: u64,
    pub crc_failures: u64,
    pub frames_dropped: u64,
    pub packets_rejected: u64,
    pub unknown_types: u64,
    pub duplicates: u64,
    pub readings: u64,
    pub sink_errors: u64,
}
