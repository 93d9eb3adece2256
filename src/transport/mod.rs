//! One subscribe/publish surface over the two M2M transports.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;

use crate::{Error, InboundMessage, Result};

pub mod mqtt;
pub mod pubsub;

/// The M2M network used for the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// broker based, MQTT v5
    Mqtt,
    /// peer to peer, the node's pubsub overlay
    Ipfs,
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MQTT" => Ok(TransportKind::Mqtt),
            "IPFS" => Ok(TransportKind::Ipfs),
            _ => Err(Error::UnsupportedTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mqtt => f.write_str("MQTT"),
            TransportKind::Ipfs => f.write_str("IPFS"),
        }
    }
}

/// A pub/sub backend
#[async_trait]
pub trait Transport: Send {
    /// Resolves once the subscription is in place, messages then flow to `handler`
    async fn subscribe(&mut self, topic: &str, handler: Sender<InboundMessage>) -> Result<()>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// MQTT style topic filter match, `+` is one level and a trailing `#` any number
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
