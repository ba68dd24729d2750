//! Sink feeding the shared batch buffer.
use super::{destination_path, ReadingSink, Sample};
use crate::delivery::{BatchBuffer, TimeseriesReading};
use async_trait::async_trait;
use std::sync::Arc;

/// Submits samples from one serial port to the process-wide [`BatchBuffer`].
pub struct BatchSink {
    port: String,
    buffer: Arc<BatchBuffer>,
}

impl BatchSink {
    pub fn new(port: impl Into<String>, buffer: Arc<BatchBuffer>) -> Self {
        Self {
            port: port.into(),
            buffer,
        }
    }
}

#[async_trait]
impl ReadingSink for BatchSink {
    fn name(&self) -> &str {
        "batch"
    }

    async fn accept(&self, sample: &Sample) -> anyhow::Result<()> {
        let path = destination_path(&self.port, sample.node_id, sample.channel);
        self.buffer
            .submit(
                &path,
                TimeseriesReading {
                    uuid: sample.uuid.to_string(),
                    timestamp: sample.timestamp,
                    value: sample.value,
                },
            )
            .await?;
        Ok(())
    }
}
