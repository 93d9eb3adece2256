use std::time::Duration;

use thiserror::Error;

/// Result type for the car agent
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the car agent
#[derive(Debug, Error)]
pub enum Error {
    #[error("error bringing node online")]
    NodeOffline,
    #[error("node is not online, start it before using pubsub")]
    NodeNotRunning,
    #[error("node api error: {0}")]
    NodeApi(String),
    #[error("{step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("{step} cancelled")]
    Cancelled { step: &'static str },
    #[error("M2M protocol {0} not supported!")]
    UnsupportedTransport(String),
    #[error("invalid broker address: {0}")]
    BrokerAddress(String),
    #[error("broker connection closed")]
    BrokerClosed,
    #[error(transparent)]
    State(#[from] crate::state::IllegalTransition),
    #[error(transparent)]
    Mqtt(#[from] rumqttc::v5::ClientError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
