//! # Batched delivery to a remote time-series collector
//!
//! [`BatchBuffer`] accumulates readings keyed by destination path and posts
//! them as a single JSON document once `capacity` readings have been
//! submitted since the previous flush attempt:
//!
//! ```json
//! {
//!   "/ttyUSB0/12/temperature": {
//!     "uuid": "6f1c…",
//!     "Readings": [[1700000000000, 21.5], [1700000060000, 21.6]]
//!   }
//! }
//! ```
//!
//! Every submit and flush runs under one async mutex, network call included,
//! so flushes never overlap and no reading is lost or sent twice. The cost is
//! that all producers wait while a flush is in flight; the optional transmit
//! timeout bounds that wait.
//!
//! A failed flush leaves the batch in place. The counter still restarts, so
//! the next flush happens after another `capacity` submits and carries the
//! old readings together with the new ones.
//!
//! Values are written in their shortest form: integral values go out as
//! JSON integers (`612`, not `612.0`), matching what existing collectors
//! receive from other drivers.
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

pub mod http;

pub use http::HttpCollector;

/// One value bound for the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesReading {
    pub uuid: String,
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collector did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Remote end of the batch buffer.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Deliver one JSON document. Success means the collector accepted the whole batch.
    async fn post(&self, body: Vec<u8>) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Number of submitted readings that triggers a flush.
    pub capacity: usize,
    /// Upper bound on a single transmit. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Cap on readings held while the collector keeps failing. Oldest are dropped first.
    pub max_pending: Option<usize>,
}

impl BatchPolicy {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            timeout: None,
            max_pending: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub flushes: u64,
    pub failed_flushes: u64,
    pub delivered: u64,
    pub overflow_dropped: u64,
}

/// Outcome of a successful [`BatchBuffer::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Buffered,
    /// The submit triggered a flush that delivered this many readings.
    Flushed(usize),
}

#[derive(Debug, Default)]
struct BatchEntry {
    uuid: String,
    readings: VecDeque<Point>,
}

#[derive(Debug, Clone, Copy)]
struct Point(i64, f64);

/// Largest magnitude at which every integer is exactly representable in an f64.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut pair = serializer.serialize_tuple(2)?;
        pair.serialize_element(&self.0)?;
        if self.1.fract() == 0.0 && self.1.abs() <= MAX_EXACT_INT {
            pair.serialize_element(&(self.1 as i64))?;
        } else {
            pair.serialize_element(&self.1)?;
        }
        pair.end()
    }
}

#[derive(Serialize)]
struct WireEntry<'a> {
    uuid: &'a str,
    #[serde(rename = "Readings")]
    readings: &'a VecDeque<Point>,
}

#[derive(Debug, Default)]
struct BufferState {
    entries: BTreeMap<Arc<str>, BatchEntry>,
    /// Path of every pending reading in submission order, for drop-oldest.
    order: VecDeque<Arc<str>>,
    since_flush: usize,
    stats: DeliveryStats,
}

fn encode_batch(entries: &BTreeMap<Arc<str>, BatchEntry>) -> Result<Vec<u8>, DeliveryError> {
    let wire: BTreeMap<&str, WireEntry<'_>> = entries
        .iter()
        .map(|(path, e)| {
            (
                &**path,
                WireEntry {
                    uuid: &e.uuid,
                    readings: &e.readings,
                },
            )
        })
        .collect();
    Ok(serde_json::to_vec(&wire)?)
}

pub struct BatchBuffer {
    collector: Arc<dyn Collector>,
    policy: BatchPolicy,
    state: Mutex<BufferState>,
}

impl BatchBuffer {
    pub fn new(collector: Arc<dyn Collector>, policy: BatchPolicy) -> Self {
        Self {
            collector,
            policy,
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Queue a reading for `path`, flushing the whole batch when capacity is reached.
    ///
    /// On a failed flush the error is returned and every pending reading,
    /// including this one, stays queued for the next attempt.
    pub async fn submit(
        &self,
        path: &str,
        reading: TimeseriesReading,
    ) -> Result<Submitted, DeliveryError> {
        let mut state = self.state.lock().await;

        let key = match state.entries.get_key_value(path) {
            Some((key, _)) => key.clone(),
            None => Arc::from(path),
        };
        let entry = state.entries.entry(key.clone()).or_default();
        entry.uuid = reading.uuid;
        entry
            .readings
            .push_back(Point(reading.timestamp, reading.value));
        state.order.push_back(key);
        state.since_flush += 1;

        if let Some(max) = self.policy.max_pending {
            while state.order.len() > max {
                drop_oldest(&mut state);
            }
        }

        if state.since_flush < self.policy.capacity {
            return Ok(Submitted::Buffered);
        }
        self.flush_locked(&mut state).await.map(Submitted::Flushed)
    }

    /// Send whatever is pending now. Returns the number of readings delivered.
    pub async fn flush(&self) -> Result<usize, DeliveryError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn stats(&self) -> DeliveryStats {
        self.state.lock().await.stats
    }

    /// Stats and pending count without waiting. `None` while a flush is in flight.
    pub fn try_snapshot(&self) -> Option<(DeliveryStats, usize)> {
        let state = self.state.try_lock().ok()?;
        Some((state.stats, state.order.len()))
    }

    async fn flush_locked(&self, state: &mut BufferState) -> Result<usize, DeliveryError> {
        state.since_flush = 0;
        let count = state.order.len();
        if count == 0 {
            return Ok(0);
        }
        let body = encode_batch(&state.entries)?;
        debug!(
            "Flushing {} readings across {} paths ({} bytes)",
            count,
            state.entries.len(),
            body.len()
        );

        let post = self.collector.post(body);
        let result = match self.policy.timeout {
            Some(limit) => match timeout(limit, post).await {
                Ok(r) => r,
                Err(_) => Err(DeliveryError::Timeout(limit)),
            },
            None => post.await,
        };

        match result {
            Ok(()) => {
                state.entries.clear();
                state.order.clear();
                state.stats.flushes += 1;
                state.stats.delivered += count as u64;
                info!("Delivered batch of {} readings", count);
                Ok(count)
            }
            Err(e) => {
                state.stats.failed_flushes += 1;
                warn!(
                    "Batch delivery failed, keeping {} readings for next flush: {}",
                    count, e
                );
                Err(e)
            }
        }
    }
}

fn drop_oldest(state: &mut BufferState) {
    let Some(path) = state.order.pop_front() else {
        return;
    };
    if let Some(entry) = state.entries.get_mut(&path) {
        entry.readings.pop_front();
        if entry.readings.is_empty() {
            state.entries.remove(&path);
        }
    }
    state.stats.overflow_dropped += 1;
    warn!("Pending batch full; dropped oldest reading for {}", path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        bodies: StdMutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Collector for Recorder {
        async fn post(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
            let v = serde_json::from_slice(&body)?;
            self.bodies.lock().unwrap().push(v);
            Ok(())
        }
    }

    fn reading(ts: i64, value: f64) -> TimeseriesReading {
        TimeseriesReading {
            uuid: "u-1".to_string(),
            timestamp: ts,
            value,
        }
    }

    #[tokio::test]
    async fn wire_shape_matches_collector_format() {
        let rec = Arc::new(Recorder::default());
        let buf = BatchBuffer::new(rec.clone(), BatchPolicy::with_capacity(2));
        buf.submit("/ttyUSB0/3/co2", reading(1000, 410.0))
            .await
            .unwrap();
        buf.submit("/ttyUSB0/3/co2", reading(2000, 21.5))
            .await
            .unwrap();

        let bodies = rec.bodies.lock().unwrap();
        assert_eq!(
            bodies[0],
            serde_json::json!({
                "/ttyUSB0/3/co2": {
                    "uuid": "u-1",
                    "Readings": [[1000, 410], [2000, 21.5]]
                }
            })
        );
    }

    #[test]
    fn integral_values_are_written_without_fraction() {
        let mut entries = BTreeMap::new();
        entries.insert(
            Arc::<str>::from("/ttyUSB0/3/co2"),
            BatchEntry {
                uuid: "u-1".to_string(),
                readings: VecDeque::from(vec![
                    Point(5, 612.0),
                    Point(6, 24.9),
                    Point(7, -4.0),
                    Point(8, 1e300),
                ]),
            },
        );
        let body = String::from_utf8(encode_batch(&entries).unwrap()).unwrap();
        assert!(body.contains("[5,612]"), "{}", body);
        assert!(body.contains("[6,24.9]"), "{}", body);
        assert!(body.contains("[7,-4]"), "{}", body);
        assert!(!body.contains("[8,1000"), "{}", body);
    }

    #[tokio::test]
    async fn explicit_flush_of_empty_buffer_is_noop() {
        let rec = Arc::new(Recorder::default());
        let buf = BatchBuffer::new(rec.clone(), BatchPolicy::with_capacity(10));
        assert_eq!(buf.flush().await.unwrap(), 0);
        assert!(rec.bodies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_across_paths() {
        let rec = Arc::new(Recorder::default());
        let policy = BatchPolicy {
            capacity: 100,
            timeout: None,
            max_pending: Some(3),
        };
        let buf = BatchBuffer::new(rec.clone(), policy);
        buf.submit("a", reading(1, 1.0)).await.unwrap();
        buf.submit("b", reading(2, 2.0)).await.unwrap();
        buf.submit("a", reading(3, 3.0)).await.unwrap();
        buf.submit("b", reading(4, 4.0)).await.unwrap();
        assert_eq!(buf.pending().await, 3);
        assert_eq!(buf.stats().await.overflow_dropped, 1);

        buf.flush().await.unwrap();
        let bodies = rec.bodies.lock().unwrap();
        assert_eq!(bodies[0]["a"]["Readings"], serde_json::json!([[3, 3]]));
        assert_eq!(
            bodies[0]["b"]["Readings"],
            serde_json::json!([[2, 2], [4, 4]])
        );
    }

    #[tokio::test]
    async fn overflow_on_a_single_path_keeps_newest() {
        let rec = Arc::new(Recorder::default());
        let policy = BatchPolicy {
            capacity: 1000,
            timeout: None,
            max_pending: Some(100),
        };
        let buf = BatchBuffer::new(rec.clone(), policy);
        for ts in 0..250 {
            buf.submit("a", reading(ts, 0.5)).await.unwrap();
        }
        assert_eq!(buf.pending().await, 100);
        assert_eq!(buf.stats().await.overflow_dropped, 150);

        buf.flush().await.unwrap();
        let bodies = rec.bodies.lock().unwrap();
        let readings = bodies[0]["a"]["Readings"].as_array().unwrap();
        assert_eq!(readings.len(), 100);
        assert_eq!(readings[0][0], 150);
        assert_eq!(readings[99][0], 249);
    }
}
