//! HTTP collector: POSTs each batch as JSON and treats anything but 200 as failure.
use super::{Collector, DeliveryError};
use async_trait::async_trait;
use log::debug;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

pub struct HttpCollector {
    uri: String,
    client: reqwest::Client,
}

impl HttpCollector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(uri: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            uri: uri.into(),
            client,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn post(&self, body: Vec<u8>) -> Result<(), DeliveryError> {
        debug!("POST {} ({} bytes)", self.uri, body.len());
        let response = self
            .client
            .post(&self.uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(())
    }
}
