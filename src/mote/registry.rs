//! Per-port record of the motes heard on a serial line.
use super::packet::{PacketHeader, SerialId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub serial: SerialId,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_seq: u16,
    pub last_kind: u16,
    pub battery: u16,
    pub packets: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First packet from this node.
    New,
    Seen,
    /// Same (node, type, seq) as the previous packet, inside the suppression window.
    Duplicate,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<u16, NodeEntry>,
    duplicate_window: Option<Duration>,
}

impl NodeRegistry {
    pub fn new(duplicate_window: Option<Duration>) -> Self {
        Self {
            nodes: HashMap::new(),
            duplicate_window,
        }
    }

    pub fn observe(&mut self, header: &PacketHeader, now: Instant) -> Observation {
        let Some(entry) = self.nodes.get_mut(&header.node_id) else {
            self.nodes.insert(
                header.node_id,
                NodeEntry {
                    serial: header.serial,
                    first_seen: now,
                    last_seen: now,
                    last_seq: header.seq,
                    last_kind: header.kind,
                    battery: header.battery,
                    packets: 1,
                },
            );
            return Observation::New;
        };

        let duplicate = match self.duplicate_window {
            Some(window) => {
                entry.last_seq == header.seq
                    && entry.last_kind == header.kind
                    && now.saturating_duration_since(entry.last_seen) <= window
            }
            None => false,
        };
        if duplicate {
            return Observation::Duplicate;
        }

        entry.serial = header.serial;
        entry.last_seen = now;
        entry.last_seq = header.seq;
        entry.last_kind = header.kind;
        entry.battery = header.battery;
        entry.packets += 1;
        Observation::Seen
    }

    pub fn get(&self, node_id: u16) -> Option<&NodeEntry> {
        self.nodes.get(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
