use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use crate::{node::P2pNode, transport::Transport, Error, InboundMessage, Result};

/// Peer to peer transport over the node's pubsub overlay
pub struct PubsubTransport {
    /// only present while the node is running locally
    node: Option<Arc<dyn P2pNode>>,
}

impl PubsubTransport {
    pub fn new(node: Option<Arc<dyn P2pNode>>) -> Self {
        Self { node }
    }

    fn node(&self) -> Result<&dyn P2pNode> {
        match &self.node {
            Some(node) => Ok(&**node),
            None => {
                warn!("Node is not online!");
                Err(Error::NodeNotRunning)
            }
        }
    }
}

#[async_trait]
impl Transport for PubsubTransport {
    async fn subscribe(&mut self, topic: &str, handler: Sender<InboundMessage>) -> Result<()> {
        self.node()?.pubsub_subscribe(topic, true, handler).await?;
        info!("Subscribed to {topic} in IPFS");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.node()?.pubsub_publish(topic, payload).await
    }
}
