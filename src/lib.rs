pub mod config;
pub mod error;

// MODULES
pub mod command;
pub mod gps;
pub mod nmea;
pub mod node;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};

/// A message delivered by either transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    /// sending peer, only known on the pubsub transport
    pub from: Option<String>,
    pub payload: Vec<u8>,
}

/// the topic car commands arrive on
pub const CMD_TOPIC: &str = "car/cmd";

/// the topic car status is published to
pub const STATUS_TOPIC: &str = "car/status";
