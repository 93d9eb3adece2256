//! Node backend for kubo (go-ipfs) speaking its HTTP RPC API.
//!
//! Local nodes are run as an `ipfs daemon` child process against the given
//! repo; remote nodes are only reached over HTTP. Pubsub topics and payloads
//! travel multibase encoded (`u` + unpadded url-safe base64), as the API
//! requires.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use futures_util::StreamExt;
use reqwest::{multipart, Client, Response};
use serde::Deserialize;
use tokio::{
    process::{Child, Command},
    sync::{mpsc::Sender, RwLock},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::{ApiOptions, NodeConfig},
    node::{InitOptions, NodeBackend, NodeIdentity, P2pNode},
    Error, InboundMessage, Result,
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Builds [`KuboNode`]s
pub struct KuboBackend {
    ipfs_bin: String,
    /// API address the local daemon listens on
    local_api: ApiOptions,
    http: Client,
    stop_grace: Duration,
}

impl KuboBackend {
    pub fn new(ipfs_bin: impl Into<String>, local_api: ApiOptions) -> Self {
        Self {
            ipfs_bin: ipfs_bin.into(),
            local_api,
            http: Client::new(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// How long the shutdown call, and then the daemon exit, may each take
    pub fn stop_grace(mut self, after: Duration) -> Self {
        self.stop_grace = after;
        self
    }
}

impl NodeBackend for KuboBackend {
    fn construct(&self, config: NodeConfig) -> Arc<dyn P2pNode> {
        Arc::new(KuboNode {
            http: self.http.clone(),
            base_url: self.local_api.base_url(),
            daemon: Some(LocalDaemon {
                ipfs_bin: self.ipfs_bin.clone(),
                repo: config.repo,
                pubsub: config.pubsub,
                child: RwLock::new(None),
            }),
            stop_grace: self.stop_grace,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    fn connect_api(&self, opts: &ApiOptions) -> Arc<dyn P2pNode> {
        Arc::new(KuboNode {
            http: self.http.clone(),
            base_url: opts.base_url(),
            daemon: None,
            stop_grace: self.stop_grace,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

struct LocalDaemon {
    ipfs_bin: String,
    repo: PathBuf,
    pubsub: bool,
    child: RwLock<Option<Child>>,
}

impl LocalDaemon {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ipfs_bin);
        cmd.env("IPFS_PATH", &self.repo).stdin(Stdio::null());
        cmd
    }

    /// Peer id recorded in the repo config
    async fn peer_id(&self) -> Result<String> {
        let raw = tokio::fs::read(self.repo.join("config")).await?;
        let config: RepoConfig = serde_json::from_slice(&raw)?;
        Ok(config.identity.peer_id)
    }

    /// Fails once the daemon process has exited
    async fn check_alive(&self) -> Result<()> {
        if let Some(child) = self.child.write().await.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(Error::NodeApi(format!("ipfs daemon exited with {status}")));
            }
        }
        Ok(())
    }

    async fn kill(&self) {
        if let Some(mut child) = self.child.write().await.take() {
            if let Err(err) = child.kill().await {
                warn!("Could not kill ipfs daemon: {err}");
            }
        }
    }
}

/// A kubo node, local daemon or remote API
pub struct KuboNode {
    http: Client,
    base_url: String,
    daemon: Option<LocalDaemon>,
    stop_grace: Duration,
    /// ends pubsub subscriptions
    cancel_token: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct PeersResponse {
    #[serde(rename = "Peers")]
    peers: Option<Vec<PeerEntry>>,
}

#[derive(Deserialize)]
struct PeerEntry {
    #[serde(rename = "Addr")]
    addr: String,
    #[serde(rename = "Peer")]
    peer: String,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Deserialize)]
struct RepoConfig {
    #[serde(rename = "Identity")]
    identity: RepoIdentity,
}

#[derive(Deserialize)]
struct RepoIdentity {
    #[serde(rename = "PeerID")]
    peer_id: String,
}

#[derive(Deserialize)]
struct PubsubMessage {
    from: Option<String>,
    data: String,
}

impl KuboNode {
    async fn call(&self, path: &str, args: &[(&str, &str)]) -> Result<Response> {
        let res = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .query(args)
            .send()
            .await?;
        check_status(path, res).await
    }

    /// Poll until the API answers, and make sure it is our daemon answering
    async fn wait_api(&self, daemon: &LocalDaemon) -> Result<()> {
        let expected = daemon.peer_id().await?;
        // the API comes up some time after the process does
        loop {
            daemon.check_alive().await?;
            if let Ok(identity) = self.id().await {
                daemon.check_alive().await?;
                if identity.0 != expected {
                    return Err(Error::NodeApi(format!(
                        "API at {} answers as {identity}, repo belongs to {expected}",
                        self.base_url
                    )));
                }
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn daemon(&self) -> Result<&LocalDaemon> {
        self.daemon
            .as_ref()
            .ok_or_else(|| Error::NodeApi("operation needs a local node".to_string()))
    }
}

async fn check_status(path: &str, res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or(body);
    Err(Error::NodeApi(format!("{path}: {status} {reason}")))
}

#[async_trait]
impl P2pNode for KuboNode {
    async fn repo_exists(&self) -> Result<bool> {
        match &self.daemon {
            Some(daemon) => Ok(tokio::fs::try_exists(daemon.repo.join("config")).await?),
            None => Ok(true),
        }
    }

    async fn ready(&self) -> Result<()> {
        let Some(daemon) = &self.daemon else {
            return Ok(());
        };
        let peer_id = daemon.peer_id().await?;
        debug!("Opened repo for peer {peer_id}");
        Ok(())
    }

    async fn init(&self, opts: InitOptions) -> Result<()> {
        let daemon = self.daemon()?;
        let bits = opts.bits.to_string();
        let mut cmd = daemon.command();
        cmd.args(["init", "--algorithm", "rsa", "--bits", bits.as_str()]);
        if opts.empty_repo {
            cmd.arg("--empty-repo");
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(Error::NodeApi(format!(
                "ipfs init exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Initialized repo at {}", daemon.repo.display());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let daemon = self.daemon()?;
        let mut cmd = daemon.command();
        cmd.arg("daemon")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if daemon.pubsub {
            cmd.arg("--enable-pubsub-experiment");
        }
        *daemon.child.write().await = Some(cmd.spawn()?);

        let res = self.wait_api(daemon).await;
        if res.is_err() {
            // never leave our own daemon running, and never stop whoever else answered
            daemon.kill().await;
        }
        res
    }

    async fn is_online(&self) -> bool {
        self.id().await.is_ok()
    }

    async fn id(&self) -> Result<NodeIdentity> {
        let res: IdResponse = self.call("id", &[]).await?.json().await?;
        Ok(NodeIdentity(res.id))
    }

    async fn swarm_connect(&self, addr: &str) -> Result<()> {
        self.call("swarm/connect", &[("arg", addr)]).await?;
        Ok(())
    }

    async fn swarm_peers(&self) -> Result<Vec<String>> {
        let res: PeersResponse = self.call("swarm/peers", &[]).await?.json().await?;
        Ok(res
            .peers
            .unwrap_or_default()
            .into_iter()
            .map(|p| format!("{}/p2p/{}", p.addr, p.peer))
            .collect())
    }

    async fn pubsub_subscribe(
        &self,
        topic: &str,
        discover: bool,
        handler: Sender<InboundMessage>,
    ) -> Result<()> {
        let encoded = encode_multibase(topic.as_bytes());
        let discover = discover.to_string();
        let res = self
            .call("pubsub/sub", &[("arg", encoded.as_str()), ("discover", discover.as_str())])
            .await?;

        let topic = topic.to_string();
        let cancel_token = self.cancel_token.clone();
        self.tasks.spawn(async move {
            let mut stream = res.bytes_stream();
            let mut pending: Vec<u8> = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Ending pubsub subscription to {topic}");
                        break;
                    },
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            pending.extend_from_slice(&bytes);
                            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                                let line: Vec<u8> = pending.drain(..=end).collect();
                                let Some(msg) = parse_pubsub_line(&line, &topic) else {
                                    continue;
                                };
                                if handler.send(msg).await.is_err() {
                                    debug!("Pubsub handler for {topic} dropped");
                                    return;
                                }
                            }
                        },
                        Some(Err(err)) => {
                            warn!("Pubsub stream for {topic} failed: {err}");
                            break;
                        },
                        None => {
                            warn!("Pubsub stream for {topic} closed");
                            break;
                        },
                    }
                }
            }
        });
        Ok(())
    }

    async fn pubsub_publish(&self, topic: &str, data: Vec<u8>) -> Result<()> {
        let path = "pubsub/pub";
        let res = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .query(&[("arg", encode_multibase(topic.as_bytes()))])
            .multipart(multipart::Form::new().part("data", multipart::Part::bytes(data)))
            .send()
            .await?;
        check_status(path, res).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let Some(daemon) = &self.daemon else {
            return Ok(());
        };
        let Some(mut child) = daemon.child.write().await.take() else {
            return Ok(());
        };
        let shutdown = match tokio::time::timeout(self.stop_grace, self.call("shutdown", &[]))
            .await
        {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                step: "node shutdown",
                after: self.stop_grace,
            }),
        };
        if let Err(err) = &shutdown {
            warn!("Graceful node shutdown failed: {err}");
        }
        // give the daemon time to flush its repo, then make sure it is gone
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!("ipfs daemon exited with {status}"),
            _ => {
                warn!("ipfs daemon did not exit, killing it");
                child.kill().await?;
            }
        }
        shutdown.map(|_| ())
    }
}

fn encode_multibase(bytes: &[u8]) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn decode_multibase(value: &str) -> Option<Vec<u8>> {
    match value.strip_prefix('u') {
        Some(rest) => URL_SAFE_NO_PAD.decode(rest).ok(),
        // older daemons send plain base64
        None => STANDARD.decode(value).ok(),
    }
}

fn parse_pubsub_line(line: &[u8], topic: &str) -> Option<InboundMessage> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    let msg: PubsubMessage = match serde_json::from_slice(line) {
        Ok(msg) => msg,
        Err(err) => {
            trace!("Could not decode pubsub message: {err}");
            return None;
        }
    };
    let Some(payload) = decode_multibase(&msg.data) else {
        trace!("Could not decode pubsub payload {}", msg.data);
        return None;
    };
    Some(InboundMessage {
        topic: topic.to_string(),
        from: msg.from,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// An API that answers every request with `body`, or never answers when `body` is `None`
    async fn fake_api(body: Option<&'static str>) -> ApiOptions {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                let Some(body) = body else {
                    held.push(socket);
                    continue;
                };
                tokio::spawn(async move {
                    let mut req = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !req.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => req.extend_from_slice(&buf[..n]),
                        }
                    }
                    let res = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(res.as_bytes()).await;
                });
            }
        });
        ApiOptions {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    async fn repo_dir(name: &str, peer_id: &str) -> PathBuf {
        let repo = std::env::temp_dir().join(format!("car-agent-{name}-{}", std::process::id()));
        tokio::fs::create_dir_all(&repo).await.unwrap();
        let config = format!(r#"{{"Identity":{{"PeerID":"{peer_id}"}}}}"#);
        tokio::fs::write(repo.join("config"), config).await.unwrap();
        repo
    }

    fn local_node(api: &ApiOptions, repo: PathBuf, stop_grace: Duration) -> KuboNode {
        KuboNode {
            http: Client::new(),
            base_url: api.base_url(),
            daemon: Some(LocalDaemon {
                ipfs_bin: "ipfs".to_string(),
                repo,
                pubsub: true,
                child: RwLock::new(None),
            }),
            stop_grace,
            cancel_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    #[tokio::test]
    async fn api_answering_for_another_peer_is_rejected() {
        let api = fake_api(Some(r#"{"ID":"QmSomeoneElse"}"#)).await;
        let repo = repo_dir("foreign-api", "QmCarNode").await;
        let node = local_node(&api, repo.clone(), DEFAULT_STOP_GRACE);

        let err = node.wait_api(node.daemon().unwrap()).await.unwrap_err();

        assert!(
            matches!(&err, Error::NodeApi(msg) if msg.contains("QmSomeoneElse")),
            "{err}"
        );
        tokio::fs::remove_dir_all(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn api_answering_for_our_repo_is_ready() {
        let api = fake_api(Some(r#"{"ID":"QmCarNode"}"#)).await;
        let repo = repo_dir("own-api", "QmCarNode").await;
        let node = local_node(&api, repo.clone(), DEFAULT_STOP_GRACE);

        assert!(node.wait_api(node.daemon().unwrap()).await.is_ok());
        tokio::fs::remove_dir_all(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn daemon_that_exits_fails_start() {
        let api = fake_api(Some(r#"{"ID":"QmSomeoneElse"}"#)).await;
        let repo = repo_dir("dead-daemon", "QmCarNode").await;
        let backend = KuboBackend::new("false", api);
        let node = backend.construct(NodeConfig {
            repo: repo.clone(),
            pubsub: true,
        });

        assert!(matches!(node.start().await, Err(Error::NodeApi(_))));
        // nothing of ours is left running, so the other node is never told to shut down
        assert!(node.stop().await.is_ok());
        tokio::fs::remove_dir_all(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_bounded_when_the_api_hangs() {
        let api = fake_api(None).await;
        let repo = repo_dir("hung-api", "QmCarNode").await;
        let node = local_node(&api, repo.clone(), Duration::from_millis(200));
        let child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        *node.daemon().unwrap().child.write().await = Some(child);

        let res = tokio::time::timeout(Duration::from_secs(5), node.stop())
            .await
            .expect("stop hung on the shutdown call");

        assert!(matches!(res, Err(Error::Timeout { step: "node shutdown", .. })));
        assert!(node.daemon().unwrap().child.read().await.is_none());
        tokio::fs::remove_dir_all(&repo).await.unwrap();
    }

    #[test]
    fn multibase_topic_encoding() {
        assert_eq!(encode_multibase(b"car/cmd"), "uY2FyL2NtZA");
        assert_eq!(decode_multibase("uY2FyL2NtZA").unwrap(), b"car/cmd");
        assert_eq!(decode_multibase("bG9jaw==").unwrap(), b"lock");
        assert!(decode_multibase("u!!").is_none());
    }

    #[test]
    fn pubsub_line() {
        let msg = parse_pubsub_line(
            br#"{"from":"12D3KooWabc","data":"ubG9jaw","seqno":"uAA","topicIDs":["uY2FyL2NtZA"]}
"#,
            "car/cmd",
        )
        .unwrap();
        assert_eq!(msg.payload, b"lock");
        assert_eq!(msg.from.as_deref(), Some("12D3KooWabc"));
        assert_eq!(msg.topic, "car/cmd");

        assert!(parse_pubsub_line(b"  \n", "car/cmd").is_none());
        assert!(parse_pubsub_line(b"{not json}\n", "car/cmd").is_none());
    }

    #[tokio::test]
    async fn remote_node_has_no_repo_work() {
        let backend = KuboBackend::new("ipfs", ApiOptions::default());
        let node = backend.connect_api(&ApiOptions {
            host: "127.0.0.1".to_string(),
            port: 1,
        });
        assert!(node.repo_exists().await.unwrap());
        assert!(node.ready().await.is_ok());
        assert!(matches!(
            node.init(InitOptions::default()).await,
            Err(Error::NodeApi(_))
        ));
        assert!(node.stop().await.is_ok());
    }

    #[tokio::test]
    async fn local_repo_detection() {
        let repo = std::env::temp_dir().join(format!("car-agent-repo-{}", std::process::id()));
        tokio::fs::create_dir_all(&repo).await.unwrap();
        let backend = KuboBackend::new("ipfs", ApiOptions::default());
        let node = backend.construct(NodeConfig {
            repo: repo.clone(),
            pubsub: true,
        });
        assert!(!node.repo_exists().await.unwrap());

        tokio::fs::write(repo.join("config"), br#"{"Identity":{"PeerID":"QmPeer"}}"#)
            .await
            .unwrap();
        assert!(node.repo_exists().await.unwrap());
        assert!(node.ready().await.is_ok());

        tokio::fs::remove_dir_all(&repo).await.unwrap();
    }
}
