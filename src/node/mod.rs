//! The peer-to-peer messaging node, seen from the agent.
//!
//! The node's repo and networking internals live behind [`P2pNode`]; the
//! agent only drives it through startup, pubsub and shutdown. A
//! [`NodeBackend`] produces node handles, either a locally managed node or a
//! client for one that is already running elsewhere.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::{
    config::{ApiOptions, NodeConfig},
    InboundMessage, Result,
};

pub mod kubo;
pub mod lifecycle;

/// Parameters for creating a fresh local repo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOptions {
    pub empty_repo: bool,
    /// key strength in bits
    pub bits: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            empty_repo: true,
            bits: 2048,
        }
    }
}

/// Peer id of the node, known once startup completes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(pub String);

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the agent needs from a messaging node
#[async_trait]
pub trait P2pNode: Send + Sync {
    /// Whether the local repo has already been initialized
    async fn repo_exists(&self) -> Result<bool>;

    /// Resolves once an existing repo has been opened
    async fn ready(&self) -> Result<()>;

    /// Initialize an empty local repo
    async fn init(&self, opts: InitOptions) -> Result<()>;

    /// Bring the networking stack up
    async fn start(&self) -> Result<()>;

    async fn is_online(&self) -> bool;

    async fn id(&self) -> Result<NodeIdentity>;

    /// Dial a peer by multiaddr
    async fn swarm_connect(&self, addr: &str) -> Result<()>;

    /// Addresses of currently connected peers
    async fn swarm_peers(&self) -> Result<Vec<String>>;

    /// Subscribe to a pubsub topic, messages are delivered to `handler` until the node stops
    async fn pubsub_subscribe(
        &self,
        topic: &str,
        discover: bool,
        handler: Sender<InboundMessage>,
    ) -> Result<()>;

    async fn pubsub_publish(&self, topic: &str, data: Vec<u8>) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Produces node handles for the two startup paths
pub trait NodeBackend: Send + Sync {
    /// Build a local node for `config`, does no I/O
    fn construct(&self, config: NodeConfig) -> Arc<dyn P2pNode>;

    /// A client for a node that is already running
    fn connect_api(&self, opts: &ApiOptions) -> Arc<dyn P2pNode>;
}
