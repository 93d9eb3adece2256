use std::{path::PathBuf, sync::Arc};

use serde::Serialize;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    time::Interval,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    command::{decode_command, Actuator, CommandExecutor},
    config::{ApiOptions, ServiceConfig},
    gps::{gps_reader, TelemetryProcessor},
    node::{
        lifecycle::{self, StartedNode},
        NodeBackend, NodeIdentity, P2pNode,
    },
    state::{NodePhase, RunEvent, ServiceRunState},
    telemetry::{LockState, TelemetrySnapshot, TelemetryState},
    transport::{mqtt::MqttTransport, pubsub::PubsubTransport, Transport, TransportKind},
    InboundMessage, Result,
};

/// Status document published on the status topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarStatus {
    pub node_id: Option<String>,
    pub locked: LockState,
    pub gps_fixed: bool,
    /// only present while the receiver holds a fix
    pub location: Option<TelemetrySnapshot>,
}

/// The in-car service.
///
/// Owns the messaging node, the broker transport and all vehicle state. Every
/// mutation happens through `&mut self`, inbound commands and GPS bytes are
/// queued on channels and applied one at a time by [`CarService::run`].
/// The GPS channel is recreated per stream, it closing means the reader ended.
pub struct CarService {
    config: ServiceConfig,
    backend: Arc<dyn NodeBackend>,
    executor: CommandExecutor,
    node: Option<Arc<dyn P2pNode>>,
    node_id: Option<NodeIdentity>,
    run_state: ServiceRunState,
    telemetry: TelemetryState,
    processor: TelemetryProcessor,
    lock: LockState,
    broker: MqttTransport,
    /// transport status documents go out on, the one last listened on
    status_kind: Option<TransportKind>,
    shutdown_token: CancellationToken,
    gps_token: Option<CancellationToken>,
    tasks: TaskTracker,
    cmd_tx: Sender<InboundMessage>,
    cmd_rx: Receiver<InboundMessage>,
    gps_rx: Option<Receiver<Vec<u8>>>,
    status_tick: Option<Interval>,
}

impl CarService {
    pub fn new(
        config: ServiceConfig,
        backend: Arc<dyn NodeBackend>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let broker = MqttTransport::new(config.broker.clone(), config.timeouts.broker_connect);
        Self {
            config,
            backend,
            executor: CommandExecutor::new(actuator),
            node: None,
            node_id: None,
            run_state: ServiceRunState::default(),
            telemetry: TelemetryState::default(),
            processor: TelemetryProcessor::new(),
            lock: LockState::default(),
            broker,
            status_kind: None,
            shutdown_token: CancellationToken::new(),
            gps_token: None,
            tasks: TaskTracker::new(),
            cmd_tx,
            cmd_rx,
            gps_rx: None,
            status_tick: None,
        }
    }

    /// Initialize and start a local node on `repo`
    pub async fn start(&mut self, repo: impl Into<PathBuf>) -> Result<()> {
        let mut next = self.run_state;
        next.transition(RunEvent::NodeStarted)?;
        let started = lifecycle::start_local(
            &*self.backend,
            repo.into(),
            &self.config.bootstrap_peers,
            self.config.timeouts,
            &self.shutdown_token,
        )
        .await?;
        self.attach(started, next);
        Ok(())
    }

    /// Attach to an already running node through its API
    pub async fn start_remote(&mut self, opts: &ApiOptions) -> Result<()> {
        let mut next = self.run_state;
        next.transition(RunEvent::RemoteAttached)?;
        let started = lifecycle::start_remote(
            &*self.backend,
            opts,
            self.config.timeouts,
            &self.shutdown_token,
        )
        .await?;
        self.attach(started, next);
        Ok(())
    }

    fn attach(&mut self, started: StartedNode, next: ServiceRunState) {
        match &self.node_id {
            Some(id) if *id != started.identity => {
                warn!("Node id already set to {id}, ignoring {}", started.identity)
            }
            Some(_) => {}
            None => self.node_id = Some(started.identity),
        }
        self.node = Some(started.node);
        self.run_state = next;
    }

    /// The node, only while this service runs it locally
    fn running_node(&self) -> Option<Arc<dyn P2pNode>> {
        if self.run_state.node_running() {
            self.node.clone()
        } else {
            None
        }
    }

    /// Listen for `topic` on the chosen network, messages go to `handler`
    pub async fn listen(
        &mut self,
        kind: TransportKind,
        topic: &str,
        handler: Sender<InboundMessage>,
    ) -> Result<()> {
        match kind {
            TransportKind::Mqtt => self.broker.subscribe(topic, handler).await?,
            TransportKind::Ipfs => {
                PubsubTransport::new(self.running_node())
                    .subscribe(topic, handler)
                    .await?
            }
        }
        self.status_kind = Some(kind);
        Ok(())
    }

    /// Publish `payload` on `topic` over the chosen network
    pub async fn publish(
        &mut self,
        kind: TransportKind,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        match kind {
            TransportKind::Mqtt => self.broker.publish(topic, payload).await,
            TransportKind::Ipfs => {
                PubsubTransport::new(self.running_node())
                    .publish(topic, payload)
                    .await
            }
        }
    }

    /// Start streaming positioning data, does nothing if already streaming
    pub fn start_telemetry(&mut self) {
        if self.run_state.transition(RunEvent::TelemetryStarted).is_err() {
            debug!("GPS already streaming");
            return;
        }
        let token = self.shutdown_token.child_token();
        let source = self.config.positioning.clone();
        let (chunk_tx, chunk_rx) = mpsc::channel(100);
        self.gps_rx = Some(chunk_rx);
        self.tasks.spawn({
            let token = token.clone();
            async move {
                if let Err(err) = gps_reader(token, source, chunk_tx).await {
                    warn!("GPS reader stopped: {err}");
                }
            }
        });
        self.gps_token = Some(token);
        info!("Start sharing GPS data.");
    }

    /// Execute a car command, returns whether it was recognised
    pub fn execute(&mut self, command: &str) -> bool {
        self.executor.execute(command, &mut self.lock)
    }

    /// The reader ended on its own, a later `start_telemetry` opens the source again
    fn telemetry_ended(&mut self) {
        self.gps_rx = None;
        self.gps_token = None;
        if let Err(err) = self.run_state.transition(RunEvent::TelemetryStopped) {
            warn!("{err}");
            return;
        }
        if self.telemetry.is_fixed() {
            info!("GPS fix lost");
        }
        self.telemetry.fix_lost();
        warn!("GPS stream ended, telemetry stopped");
    }

    /// Feed raw positioning bytes
    pub fn ingest_gps(&mut self, chunk: &[u8]) {
        self.processor.ingest(chunk, &mut self.telemetry);
    }

    fn handle_message(&mut self, msg: InboundMessage) {
        trace!("Command message on {} from {:?}", msg.topic, msg.from);
        if let Some(command) = decode_command(&msg.payload) {
            self.execute(&command);
        }
    }

    pub fn status(&self) -> CarStatus {
        CarStatus {
            node_id: self.node_id.as_ref().map(|id| id.0.clone()),
            locked: self.lock,
            gps_fixed: self.telemetry.is_fixed(),
            location: self.telemetry.trusted().copied(),
        }
    }

    async fn publish_status(&mut self) {
        let (Some(topic), Some(kind)) = (self.config.status_topic.clone(), self.status_kind) else {
            return;
        };
        let payload = match serde_json::to_vec(&self.status()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to serialize status: {err}");
                return;
            }
        };
        if let Err(err) = self.publish(kind, &topic, payload).await {
            warn!("Failed to publish status: {err}");
        }
    }

    /// Wait for the next queued command, GPS chunk or status tick and apply it.
    /// Returns false once the shutdown token has fired.
    pub async fn process_next(&mut self) -> bool {
        let publish_status = self.config.status_topic.is_some();
        let interval = self.config.status_interval;
        let status_tick = self
            .status_tick
            .get_or_insert_with(|| tokio::time::interval(interval));
        tokio::select! {
            _ = self.shutdown_token.cancelled() => {
                debug!("Shutdown requested");
                return false;
            },
            Some(msg) = self.cmd_rx.recv() => self.handle_message(msg),
            chunk = next_chunk(&mut self.gps_rx) => match chunk {
                Some(chunk) => self.ingest_gps(&chunk),
                None => self.telemetry_ended(),
            },
            _ = status_tick.tick(), if publish_status => self.publish_status().await,
        }
        true
    }

    /// Process queued commands and GPS data until the shutdown token fires, then stop
    pub async fn run(&mut self) {
        while self.process_next().await {}
        self.stop().await;
    }

    /// Stop the node, then telemetry, then the broker session.
    /// Never fails, each step runs regardless of the others and errors are logged.
    pub async fn stop(&mut self) {
        let mut stopped_any = false;

        match self.run_state.node() {
            NodePhase::Running => {
                if let Some(node) = self.node.take() {
                    match lifecycle::shutdown(&*node, self.config.timeouts.node_stop).await {
                        Ok(()) => info!("Node stopped"),
                        Err(err) => warn!("Could not stop node: {err}"),
                    }
                }
                stopped_any = true;
            }
            NodePhase::Remote => {
                debug!("Detaching from remote node");
                self.node = None;
                stopped_any = true;
            }
            NodePhase::Stopped => {}
        }
        if stopped_any {
            if let Err(err) = self.run_state.transition(RunEvent::NodeStopped) {
                warn!("{err}");
            }
        }

        if self.run_state.telemetry_streaming() {
            if let Some(token) = self.gps_token.take() {
                token.cancel();
            }
            self.gps_rx = None;
            if let Err(err) = self.run_state.transition(RunEvent::TelemetryStopped) {
                warn!("{err}");
            }
            stopped_any = true;
        }

        self.broker.close().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        if stopped_any {
            info!("Car service stopped.");
        }
    }

    pub fn node_id(&self) -> Option<&NodeIdentity> {
        self.node_id.as_ref()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock
    }

    pub fn telemetry(&self) -> &TelemetryState {
        &self.telemetry
    }

    pub fn run_state(&self) -> ServiceRunState {
        self.run_state
    }

    /// A handler for [`CarService::listen`] that feeds messages to the command executor
    pub fn command_handler(&self) -> Sender<InboundMessage> {
        self.cmd_tx.clone()
    }

    /// Cancelling this aborts an in-flight startup and ends [`CarService::run`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// Next chunk of the current GPS stream, `None` once it ended, pending while there is none
async fn next_chunk(rx: &mut Option<Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
