use std::{path::PathBuf, sync::Arc, time::Duration};

use car_agent::{
    command::{Actuator, LogActuator, ShellActuator},
    config::{ApiOptions, BrokerOptions, PositioningSource, ServiceConfig, Timeouts},
    node::kubo::KuboBackend,
    service::CarService,
    transport::TransportKind,
    CMD_TOPIC, STATUS_TOPIC,
};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// car-agent command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct CarArgs {
    /// Local node repo, a node is started on it unless --api-host is given
    #[arg(short = 'r', long, default_value = "car-repo", env = "CAR_AGENT_REPO")]
    repo: PathBuf,

    /// Attach to an already running node API on this host instead of starting one
    #[arg(long, env = "CAR_AGENT_API_HOST")]
    api_host: Option<String>,

    /// API port of the node, local or remote
    #[arg(long, default_value_t = 5001, env = "CAR_AGENT_API_PORT")]
    api_port: u16,

    /// The kubo binary used for a local node
    #[arg(long, default_value = "ipfs", env = "CAR_AGENT_IPFS_BIN")]
    ipfs_bin: String,

    /// Bootstrap peer multiaddrs, tried in order
    #[arg(short = 'b', long = "bootstrap", env = "CAR_AGENT_BOOTSTRAP", value_delimiter = ',')]
    bootstrap_peers: Vec<String>,

    /// The M2M network for commands, MQTT or IPFS
    #[arg(short = 'p', long, default_value = "MQTT", value_parser = parse_transport, env = "CAR_AGENT_PROTOCOL")]
    protocol: TransportKind,

    /// The MQTT broker URL
    #[arg(
        short = 'u',
        long,
        default_value = "localhost:1883",
        env = "CAR_AGENT_BROKER_URL"
    )]
    broker_url: String,

    /// Topic car commands arrive on
    #[arg(long, default_value = CMD_TOPIC, env = "CAR_AGENT_CMD_TOPIC")]
    cmd_topic: String,

    /// Topic car status is published to
    #[arg(long, default_value = STATUS_TOPIC, env = "CAR_AGENT_STATUS_TOPIC")]
    status_topic: String,

    /// Seconds between status publications, 0 disables them
    #[arg(long, default_value_t = 5, env = "CAR_AGENT_STATUS_INTERVAL")]
    status_interval: u64,

    /// GPS device path, or tcp://host:port for a network NMEA feed
    #[arg(short = 'g', long, default_value = "/dev/ttyS0", env = "CAR_AGENT_GPS")]
    gps: String,

    /// GPS serial baud rate
    #[arg(long, default_value_t = 9600, env = "CAR_AGENT_GPS_BAUD")]
    gps_baud: u32,

    /// Disable GPS streaming
    #[arg(long, env = "CAR_AGENT_NO_GPS")]
    no_gps: bool,

    /// Command run to lock the car, only logged when unset
    #[arg(long, env = "CAR_AGENT_LOCK_CMD")]
    lock_cmd: Option<String>,

    /// Command run to unlock the car
    #[arg(long, env = "CAR_AGENT_UNLOCK_CMD")]
    unlock_cmd: Option<String>,

    /// Seconds each node startup step may take
    #[arg(long, default_value_t = 30, env = "CAR_AGENT_STEP_TIMEOUT")]
    step_timeout: u64,

    /// Seconds each bootstrap peer dial may take
    #[arg(long, default_value_t = 10, env = "CAR_AGENT_BOOTSTRAP_TIMEOUT")]
    bootstrap_timeout: u64,

    /// Seconds to wait for the broker to accept the connection
    #[arg(long, default_value_t = 10, env = "CAR_AGENT_BROKER_TIMEOUT")]
    broker_timeout: u64,

    /// Seconds to wait for the node to stop before abandoning it
    #[arg(long, default_value_t = 30, env = "CAR_AGENT_STOP_TIMEOUT")]
    stop_timeout: u64,
}

impl CarArgs {
    fn timeouts(&self) -> Timeouts {
        Timeouts {
            node_step: Duration::from_secs(self.step_timeout),
            bootstrap: Duration::from_secs(self.bootstrap_timeout),
            broker_connect: Duration::from_secs(self.broker_timeout),
            node_stop: Duration::from_secs(self.stop_timeout),
        }
    }
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    value.parse().map_err(|err: car_agent::Error| err.to_string())
}

#[tokio::main]
async fn main() {
    let cli = CarArgs::parse();

    println!("Initializing car agent...");
    // construct a subscriber that prints formatted traces to stdout
    // if RUST_LOG is not set, defaults to loglevel INFO
    let subscriber = tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_ansi(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Could not init tracing");

    let broker: BrokerOptions = match cli.broker_url.parse() {
        Ok(broker) => broker,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };

    let config = ServiceConfig {
        broker,
        timeouts: cli.timeouts(),
        bootstrap_peers: cli.bootstrap_peers,
        positioning: PositioningSource::parse(&cli.gps, cli.gps_baud),
        status_topic: (cli.status_interval > 0).then_some(cli.status_topic),
        status_interval: Duration::from_secs(cli.status_interval.max(1)),
    };

    let actuator: Arc<dyn Actuator> = match (&cli.lock_cmd, &cli.unlock_cmd) {
        (Some(lock), Some(unlock)) => Arc::new(ShellActuator::new(lock, unlock)),
        (None, None) => {
            warn!("No actuator commands configured, lock commands are only logged");
            Arc::new(LogActuator)
        }
        _ => {
            error!("--lock-cmd and --unlock-cmd must be given together");
            std::process::exit(2);
        }
    };

    let api = ApiOptions {
        host: cli.api_host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
        port: cli.api_port,
    };
    let backend = Arc::new(KuboBackend::new(cli.ipfs_bin, api.clone()));
    let mut service = CarService::new(config, backend, actuator);

    // ctrl+c aborts startup or ends the run loop, either way the service is stopped
    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Could not read cancellation trigger (ctrl+c): {err}");
            return;
        }
        info!("Received exit signal, shutting down!");
        shutdown.cancel();
    });

    let started = match cli.api_host {
        Some(_) => service.start_remote(&api).await,
        None => service.start(&cli.repo).await,
    };
    if let Err(err) = started {
        error!("Could not start node: {err}");
        service.stop().await;
        std::process::exit(1);
    }

    let handler = service.command_handler();
    if let Err(err) = service.listen(cli.protocol, &cli.cmd_topic, handler).await {
        error!("Could not listen on {} over {}: {err}", cli.cmd_topic, cli.protocol);
        service.stop().await;
        std::process::exit(1);
    }

    if !cli.no_gps {
        service.start_telemetry();
    }

    info!("Initialization complete, ready...");
    info!("Use Ctrl+C or SIGINT to exit cleanly!");
    service.run().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_default_and_override() {
        let cli = CarArgs::try_parse_from(["car-agent"]).unwrap();
        let timeouts = cli.timeouts();
        let defaults = Timeouts::default();
        assert_eq!(timeouts.node_step, defaults.node_step);
        assert_eq!(timeouts.bootstrap, defaults.bootstrap);
        assert_eq!(timeouts.broker_connect, defaults.broker_connect);
        assert_eq!(timeouts.node_stop, defaults.node_stop);

        let cli = CarArgs::try_parse_from([
            "car-agent",
            "--bootstrap-timeout",
            "3",
            "--stop-timeout",
            "7",
        ])
        .unwrap();
        let timeouts = cli.timeouts();
        assert_eq!(timeouts.bootstrap, Duration::from_secs(3));
        assert_eq!(timeouts.node_stop, Duration::from_secs(7));
    }
}
