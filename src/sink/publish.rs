//! Bus publication.
//!
//! The message bus binding lives outside this crate. [`Publisher`] is the
//! seam: a node announces an interface once, then publishes signals on it
//! keyed by node id and channel. [`PublishSink`] adapts a publisher to the
//! sample fan-out and remembers, per port, which interfaces each node has
//! already registered. [`LogPublisher`] emits everything on the `publish`
//! log target so a deployment can tail or forward it.
use super::{Channel, ReadingSink, Sample};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Announce `interface` for a node. Called once per (node, interface) and port.
    async fn register(&self, node_id: u16, interface: &str) -> anyhow::Result<()>;

    async fn publish(
        &self,
        node_id: u16,
        interface: &str,
        channel: Channel,
        sample: &Sample,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct LogPublisher {
    base_uri: String,
}

impl LogPublisher {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            base_uri: base_uri.into(),
        }
    }

    /// URI of a node's interface, e.g. `building/motes/12/i.mote-temperature`.
    pub fn interface_uri(&self, node_id: u16, interface: &str) -> String {
        let base = self.base_uri.trim_end_matches('/');
        if base.is_empty() {
            format!("{}/{}", node_id, interface)
        } else {
            format!("{}/{}/{}", base, node_id, interface)
        }
    }

    /// Signal URI of a channel, e.g. `building/motes/12/i.mote-temperature/signal/humidity`.
    pub fn signal_uri(&self, node_id: u16, interface: &str, channel: Channel) -> String {
        format!("{}/signal/{}", self.interface_uri(node_id, interface), channel)
    }
}

#[async_trait]
impl Publisher for LogPublisher {
    async fn register(&self, node_id: u16, interface: &str) -> anyhow::Result<()> {
        info!(
            target: "publish",
            "registered {}",
            self.interface_uri(node_id, interface)
        );
        Ok(())
    }

    async fn publish(
        &self,
        node_id: u16,
        interface: &str,
        channel: Channel,
        sample: &Sample,
    ) -> anyhow::Result<()> {
        info!(
            target: "publish",
            "{} uuid={} time={} value={} serial={}",
            self.signal_uri(node_id, interface, channel),
            sample.uuid,
            sample.timestamp,
            sample.value,
            sample.serial
        );
        Ok(())
    }
}

/// What a port has published for one node.
#[derive(Debug, Clone)]
pub struct PublishedNode {
    pub interfaces: Vec<&'static str>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub samples: u64,
}

/// Per-port map of node id to the interfaces registered for it.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    nodes: HashMap<u16, PublishedNode>,
}

impl InterfaceRegistry {
    pub fn get(&self, node_id: u16) -> Option<&PublishedNode> {
        self.nodes.get(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn is_registered(&self, node_id: u16, interface: &str) -> bool {
        self.nodes
            .get(&node_id)
            .is_some_and(|n| n.interfaces.contains(&interface))
    }

    fn record(&mut self, node_id: u16, interface: Option<&'static str>, now: Instant) {
        let node = self.nodes.entry(node_id).or_insert_with(|| PublishedNode {
            interfaces: Vec::new(),
            first_seen: now,
            last_seen: now,
            samples: 0,
        });
        if let Some(iface) = interface {
            node.interfaces.push(iface);
        }
        node.last_seen = now;
        node.samples += 1;
    }
}

/// Publishes samples of one port, registering each node's interface on first use.
pub struct PublishSink {
    port: String,
    publisher: Arc<dyn Publisher>,
    registry: Mutex<InterfaceRegistry>,
}

impl PublishSink {
    pub fn new(port: impl Into<String>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            port: port.into(),
            publisher,
            registry: Mutex::new(InterfaceRegistry::default()),
        }
    }

    /// Interfaces registered so far for `node_id`.
    pub async fn interfaces(&self, node_id: u16) -> Vec<&'static str> {
        self.registry
            .lock()
            .await
            .get(node_id)
            .map(|n| n.interfaces.clone())
            .unwrap_or_default()
    }

    pub async fn node_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

#[async_trait]
impl ReadingSink for PublishSink {
    fn name(&self) -> &str {
        "publish"
    }

    async fn accept(&self, sample: &Sample) -> anyhow::Result<()> {
        let interface = sample.channel.interface();
        let mut registry = self.registry.lock().await;

        // registration failure leaves the node unregistered so the next sample retries
        let fresh = if registry.is_registered(sample.node_id, interface) {
            None
        } else {
            self.publisher.register(sample.node_id, interface).await?;
            debug!(
                "{}: node {} registered {}",
                self.port, sample.node_id, interface
            );
            Some(interface)
        };
        registry.record(sample.node_id, fresh, Instant::now());
        drop(registry);

        self.publisher
            .publish(sample.node_id, interface, sample.channel, sample)
            .await
    }
}
