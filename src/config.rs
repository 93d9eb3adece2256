use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::Error;

/// Default MQTT port when the broker address omits one
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Where positioning data is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositioningSource {
    /// a serial device node opened at `baud`
    Serial { device: String, baud: u32 },
    /// a TCP endpoint streaming raw NMEA, `host:port`
    Tcp(String),
}

impl PositioningSource {
    /// Parse `tcp://host:port` or a device path, the baud only applies to devices
    pub fn parse(value: &str, baud: u32) -> Self {
        match value.strip_prefix("tcp://") {
            Some(addr) => PositioningSource::Tcp(addr.to_string()),
            None => PositioningSource::Serial {
                device: value.to_string(),
                baud,
            },
        }
    }
}

impl fmt::Display for PositioningSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositioningSource::Serial { device, baud } => write!(f, "{device}@{baud}"),
            PositioningSource::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// MQTT broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    /// client id prefix, a timestamp is appended per connection
    pub client_prefix: String,
}

impl FromStr for BrokerOptions {
    type Err = Error;

    /// Accepts `host:port`, `host`, or either prefixed with `tcp://` / `mqtt://`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("mqtt://"))
            .unwrap_or(s)
            .trim_end_matches('/');
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::BrokerAddress(s.to_string()))?,
            ),
            None => (addr, DEFAULT_MQTT_PORT),
        };
        if host.is_empty() {
            return Err(Error::BrokerAddress(s.to_string()));
        }
        Ok(BrokerOptions {
            host: host.to_string(),
            port,
            client_prefix: "car".to_string(),
        })
    }
}

/// Address of an already running node's HTTP API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiOptions {
    pub host: String,
    pub port: u16,
}

impl ApiOptions {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/api/v0", self.host, self.port)
    }
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
        }
    }
}

/// Bounds on every step that waits on the network
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// each node startup step
    pub node_step: Duration,
    /// each bootstrap peer connect attempt
    pub bootstrap: Duration,
    /// wait for the broker to acknowledge the connection
    pub broker_connect: Duration,
    /// stopping the node, after that it is abandoned
    pub node_stop: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            node_step: Duration::from_secs(30),
            bootstrap: Duration::from_secs(10),
            broker_connect: Duration::from_secs(10),
            node_stop: Duration::from_secs(30),
        }
    }
}

/// Static settings for a [`crate::service::CarService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub broker: BrokerOptions,
    pub bootstrap_peers: Vec<String>,
    pub positioning: PositioningSource,
    pub timeouts: Timeouts,
    /// where status documents are published, none disables publication
    pub status_topic: Option<String>,
    pub status_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            broker: BrokerOptions {
                host: "localhost".to_string(),
                port: DEFAULT_MQTT_PORT,
                client_prefix: "car".to_string(),
            },
            bootstrap_peers: Vec::new(),
            positioning: PositioningSource::Serial {
                device: "/dev/ttyS0".to_string(),
                baud: 9600,
            },
            timeouts: Timeouts::default(),
            status_topic: None,
            status_interval: Duration::from_secs(5),
        }
    }
}

/// Local repo settings for [`crate::node::NodeBackend::construct`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub repo: PathBuf,
    pub pubsub: bool,
}
