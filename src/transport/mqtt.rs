use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rumqttc::v5::{
    mqttbytes::{v5::Packet, QoS},
    AsyncClient, Event, EventLoop, MqttOptions,
};
use tokio::sync::{
    mpsc::{self, Sender},
    oneshot,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::BrokerOptions,
    transport::{topic_matches, Transport},
    Error, InboundMessage, Result,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Broker transport. Owns its own client, nothing is shared between instances.
///
/// The connection is opened on first use and driven by a background task
/// that also routes incoming publishes to subscription handlers.
pub struct MqttTransport {
    opts: BrokerOptions,
    connect_timeout: Duration,
    session: Option<SessionHandle>,
    cancel_token: CancellationToken,
    tasks: TaskTracker,
}

struct SessionHandle {
    client: AsyncClient,
    commands: Sender<SessionCommand>,
}

enum SessionCommand {
    Subscribe(PendingSubscribe),
    /// wait for the connection to be acknowledged
    Connected(oneshot::Sender<()>),
    Close,
}

/// A subscribe request waiting to be issued on a connected session
pub struct PendingSubscribe {
    filter: String,
    handler: Sender<InboundMessage>,
    ack: oneshot::Sender<Result<()>>,
}

impl MqttTransport {
    pub fn new(opts: BrokerOptions, connect_timeout: Duration) -> Self {
        Self {
            opts,
            connect_timeout,
            session: None,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn session(&mut self) -> &SessionHandle {
        let (opts, tasks, cancel_token) = (&self.opts, &self.tasks, &self.cancel_token);
        self.session.get_or_insert_with(|| {
            info!("Connecting to broker {}:{}", opts.host, opts.port);
            let (client, eventloop) = AsyncClient::new(mqtt_options(opts), 600);
            let (commands, commands_rx) = mpsc::channel(16);
            tasks.spawn(drive_session(
                cancel_token.clone(),
                client.clone(),
                eventloop,
                commands_rx,
            ));
            SessionHandle { client, commands }
        })
    }

    async fn bounded<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        match tokio::time::timeout(self.connect_timeout, rx).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(_)) => Err(Error::BrokerClosed),
            Err(_) => Err(Error::Timeout {
                step: "broker connect",
                after: self.connect_timeout,
            }),
        }
    }

    /// Open the connection and wait for the broker to acknowledge it
    pub async fn connect(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.session()
            .commands
            .send(SessionCommand::Connected(tx))
            .await
            .map_err(|_| Error::BrokerClosed)?;
        self.bounded(rx).await
    }

    /// Disconnect from the broker and end the session task
    pub async fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if session.commands.send(SessionCommand::Close).await.is_err() {
            debug!("Broker session already ended");
        }
        self.tasks.close();
        if tokio::time::timeout(CLOSE_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            debug!("Broker session did not end in time, cancelling");
        }
        self.cancel_token.cancel();
        self.tasks.wait().await;
        // a later subscribe starts a fresh session
        self.cancel_token = CancellationToken::new();
        self.tasks = TaskTracker::new();
    }
}

fn mqtt_options(opts: &BrokerOptions) -> MqttOptions {
    let mut mqtt_opts = MqttOptions::new(
        format!(
            "{}-{:?}",
            opts.client_prefix,
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        ),
        opts.host.clone(),
        opts.port,
    );
    mqtt_opts
        .set_keep_alive(Duration::from_secs(20))
        .set_clean_start(true)
        .set_connection_timeout(3);
    mqtt_opts
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&mut self, topic: &str, handler: Sender<InboundMessage>) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.session()
            .commands
            .send(SessionCommand::Subscribe(PendingSubscribe {
                filter: topic.to_string(),
                handler,
                ack,
            }))
            .await
            .map_err(|_| Error::BrokerClosed)?;
        self.bounded(rx).await??;
        info!("Subscribed to {topic} from MQTT");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.session()
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Subscription bookkeeping of one broker session.
///
/// Subscriptions requested before the broker acknowledged the connection
/// are held back, and nothing is routed to any handler until then.
#[derive(Default)]
pub struct SessionState {
    connected: bool,
    routes: Vec<(String, Sender<InboundMessage>)>,
    pending: Vec<PendingSubscribe>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Queue a subscription, handed back when it can be issued right away
    pub fn request(&mut self, sub: PendingSubscribe) -> Option<PendingSubscribe> {
        if self.connected {
            Some(sub)
        } else {
            self.pending.push(sub);
            None
        }
    }

    fn wait_connected(&mut self, waiter: oneshot::Sender<()>) {
        if self.connected {
            let _ = waiter.send(());
        } else {
            self.waiters.push(waiter);
        }
    }

    /// Mark connected, returns filters to re-issue and queued requests to issue
    pub fn on_connected(&mut self) -> (Vec<String>, Vec<PendingSubscribe>) {
        self.connected = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
        let resubscribe = self.routes.iter().map(|(f, _)| f.clone()).collect();
        // callers that gave up waiting are not subscribed
        let pending = self
            .pending
            .drain(..)
            .filter(|sub| !sub.ack.is_closed())
            .collect();
        (resubscribe, pending)
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
    }

    /// Record a subscription that has been issued
    pub fn activate(&mut self, filter: String, handler: Sender<InboundMessage>) {
        self.routes.push((filter, handler));
    }

    /// Handlers for a received publish, none while disconnected
    pub fn deliverable(&self, topic: &str) -> Vec<Sender<InboundMessage>> {
        if !self.connected {
            return Vec::new();
        }
        self.routes
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

fn issue(client: &AsyncClient, state: &mut SessionState, sub: PendingSubscribe) {
    let res = client
        .try_subscribe(sub.filter.clone(), QoS::AtLeastOnce)
        .map_err(Error::from);
    if res.is_ok() {
        state.activate(sub.filter, sub.handler);
    }
    let _ = sub.ack.send(res);
}

async fn drive_session(
    cancel_token: CancellationToken,
    client: AsyncClient,
    mut eventloop: EventLoop,
    mut commands: mpsc::Receiver<SessionCommand>,
) {
    let mut state = SessionState::default();
    let mut closing = false;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down broker session!");
                break;
            },
            cmd = commands.recv(), if !closing => match cmd {
                Some(SessionCommand::Subscribe(sub)) => {
                    if let Some(sub) = state.request(sub) {
                        issue(&client, &mut state, sub);
                    }
                },
                Some(SessionCommand::Connected(waiter)) => state.wait_connected(waiter),
                Some(SessionCommand::Close) | None => {
                    closing = true;
                    if let Err(err) = client.try_disconnect() {
                        debug!("Could not request disconnect: {err}");
                        break;
                    }
                },
            },
            msg = eventloop.poll() => match msg {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker");
                    let (resubscribe, pending) = state.on_connected();
                    for filter in resubscribe {
                        if let Err(err) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                            warn!("Could not resubscribe to {filter}: {err}");
                        }
                    }
                    for sub in pending {
                        issue(&client, &mut state, sub);
                    }
                },
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    let Ok(topic) = std::str::from_utf8(&msg.topic) else {
                        warn!("Could not parse topic, topic: {:?}", msg.topic);
                        continue;
                    };
                    for handler in state.deliverable(topic) {
                        let inbound = InboundMessage {
                            topic: topic.to_string(),
                            from: None,
                            payload: msg.payload.to_vec(),
                        };
                        if let Err(err) = handler.send(inbound).await {
                            warn!("Error delivering message on {topic}: {err}");
                        }
                    }
                },
                Ok(Event::Incoming(Packet::Disconnect(_))) => {
                    warn!("Broker disconnected us");
                    state.on_disconnected();
                },
                Ok(_) => {},
                Err(err) => {
                    state.on_disconnected();
                    if closing {
                        debug!("Broker session closed: {err}");
                        break;
                    }
                    trace!("Broker connection error: {err}");
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    fn broker_opts(port: u16) -> BrokerOptions {
        BrokerOptions {
            host: "127.0.0.1".to_string(),
            port,
            client_prefix: "test".to_string(),
        }
    }

    /// Read one control packet, returns its type and variable part
    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let kind = socket.read_u8().await.unwrap() >> 4;
        let mut len = 0usize;
        for shift in (0..28).step_by(7) {
            let byte = socket.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await.unwrap();
        (kind, body)
    }

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let len = 2 + topic.len() + 1 + payload.len();
        let mut packet = vec![0x30, len as u8, 0, topic.len() as u8];
        packet.extend_from_slice(topic.as_bytes());
        // no properties
        packet.push(0);
        packet.extend_from_slice(payload);
        packet
    }

    fn pending(filter: &str) -> (PendingSubscribe, mpsc::Receiver<InboundMessage>, oneshot::Receiver<Result<()>>) {
        let (handler, handler_rx) = mpsc::channel(4);
        let (ack, ack_rx) = oneshot::channel();
        (
            PendingSubscribe {
                filter: filter.to_string(),
                handler,
                ack,
            },
            handler_rx,
            ack_rx,
        )
    }

    #[test]
    fn nothing_routed_before_connack() {
        let mut state = SessionState::default();
        let (sub, _rx, _ack) = pending("car/cmd");
        assert!(state.request(sub).is_none());
        assert!(state.deliverable("car/cmd").is_empty());

        let (resubscribe, queued) = state.on_connected();
        assert!(resubscribe.is_empty());
        assert_eq!(queued.len(), 1);
        for sub in queued {
            state.activate(sub.filter, sub.handler);
        }
        assert_eq!(state.deliverable("car/cmd").len(), 1);
        assert!(state.deliverable("car/status").is_empty());
    }

    #[test]
    fn abandoned_requests_are_dropped() {
        let mut state = SessionState::default();
        let (sub, _rx, ack) = pending("car/cmd");
        state.request(sub);
        drop(ack);
        let (_, queued) = state.on_connected();
        assert!(queued.is_empty());
    }

    #[test]
    fn reconnect_resubscribes_and_pauses_routing() {
        let mut state = SessionState::default();
        state.on_connected();
        let (sub, _rx, _ack) = pending("car/#");
        let sub = state.request(sub).expect("issued immediately when connected");
        state.activate(sub.filter, sub.handler);

        state.on_disconnected();
        assert!(state.deliverable("car/cmd").is_empty());

        let (resubscribe, _) = state.on_connected();
        assert_eq!(resubscribe, vec!["car/#".to_string()]);
        assert_eq!(state.deliverable("car/cmd").len(), 1);
    }

    #[tokio::test]
    async fn connect_waiters_released_on_connack() {
        let mut state = SessionState::default();
        let (tx, mut rx) = oneshot::channel();
        state.wait_connected(tx);
        assert!(rx.try_recv().is_err());
        state.on_connected();
        assert!(rx.await.is_ok());
    }

    #[test]
    fn sessions_start_clean() {
        let opts = mqtt_options(&broker_opts(crate::config::DEFAULT_MQTT_PORT));
        assert!(opts.clean_start());
        assert!(opts.client_id().starts_with("test-"));
    }

    #[tokio::test]
    async fn publish_before_connack_is_not_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            assert_eq!(read_packet(&mut first).await.0, 1);
            first
                .write_all(&publish_packet("car/cmd", b"early"))
                .await
                .unwrap();

            // the client gives up on the first connection and dials again
            let (mut second, _) = listener.accept().await.unwrap();
            drop(first);
            assert_eq!(read_packet(&mut second).await.0, 1);
            second.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await.unwrap();
            let (kind, subscribe) = read_packet(&mut second).await;
            assert_eq!(kind, 8);
            second
                .write_all(&[0x90, 0x04, subscribe[0], subscribe[1], 0x00, 0x01])
                .await
                .unwrap();
            second
                .write_all(&publish_packet("car/cmd", b"late"))
                .await
                .unwrap();
            second
        });

        let mut transport = MqttTransport::new(broker_opts(port), Duration::from_secs(5));
        let (handler, mut rx) = mpsc::channel(4);
        transport.subscribe("car/cmd", handler).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("nothing delivered after connack")
            .unwrap();
        assert_eq!(msg.payload, b"late");
        assert!(rx.try_recv().is_err());

        drop(broker.await.unwrap());
        transport.close().await;
    }

    #[tokio::test]
    async fn unreachable_broker_times_out() {
        let mut transport = MqttTransport::new(broker_opts(1), Duration::from_millis(200));
        let (handler, _rx) = mpsc::channel(1);
        let res = transport.subscribe("car/cmd", handler).await;
        assert!(matches!(res, Err(Error::Timeout { step: "broker connect", .. })));
        transport.close().await;
    }
}
