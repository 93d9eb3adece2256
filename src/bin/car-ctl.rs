use std::time::Duration;

use car_agent::{
    config::BrokerOptions,
    transport::{mqtt::MqttTransport, Transport},
    CMD_TOPIC,
};
use clap::{Parser, ValueEnum};
use tracing::error;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CarCommand {
    Lock,
    Unlock,
}

/// car-ctl command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct CtlArgs {
    /// The command to send
    #[arg(value_enum)]
    command: CarCommand,

    /// The MQTT broker URL
    #[arg(
        short = 'u',
        long,
        default_value = "localhost:1883",
        env = "CAR_AGENT_BROKER_URL"
    )]
    broker_url: String,

    /// Topic the car listens on
    #[arg(long, default_value = CMD_TOPIC, env = "CAR_AGENT_CMD_TOPIC")]
    cmd_topic: String,
}

#[tokio::main]
async fn main() {
    let cli = CtlArgs::parse();
    tracing_subscriber::fmt::init();

    let mut opts: BrokerOptions = match cli.broker_url.parse() {
        Ok(opts) => opts,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };
    opts.client_prefix = "car-ctl".to_string();
    let mut transport = MqttTransport::new(opts, Duration::from_secs(10));

    let payload = match cli.command {
        CarCommand::Lock => "lock",
        CarCommand::Unlock => "unlock",
    };
    let sent = match transport.connect().await {
        Ok(()) => {
            transport
                .publish(&cli.cmd_topic, payload.as_bytes().to_vec())
                .await
        }
        Err(err) => Err(err),
    };
    transport.close().await;

    match sent {
        Ok(()) => println!("Sent {payload} to {}", cli.cmd_topic),
        Err(err) => {
            error!("Could not send {payload}: {err}");
            std::process::exit(1);
        }
    }
}
