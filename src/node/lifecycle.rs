use std::{future::Future, path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::{ApiOptions, NodeConfig, Timeouts},
    node::{InitOptions, NodeBackend, NodeIdentity, P2pNode},
    Error, Result,
};

/// A node that finished startup
pub struct StartedNode {
    pub node: Arc<dyn P2pNode>,
    pub identity: NodeIdentity,
}

/// Run one startup step, bounded by `after` and aborted by `cancel_token`
async fn step<T>(
    name: &'static str,
    after: Duration,
    cancel_token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    debug!("Node startup: {name}");
    tokio::select! {
        _ = cancel_token.cancelled() => Err(Error::Cancelled { step: name }),
        res = tokio::time::timeout(after, fut) => match res {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout { step: name, after }),
        },
    }
}

/// Bring a local node from nothing to online and peer connected.
///
/// Steps run strictly in order and the first failing one aborts the rest:
/// construct, open or init the repo, start, verify online and fetch the id,
/// then dial bootstrap peers and list connections. The last two are best
/// effort, only their cancellation aborts startup. A node that got past
/// `start` is stopped again when startup aborts.
#[instrument(skip_all, fields(repo = %repo.display()))]
pub async fn start_local(
    backend: &dyn NodeBackend,
    repo: PathBuf,
    bootstrap_peers: &[String],
    timeouts: Timeouts,
    cancel_token: &CancellationToken,
) -> Result<StartedNode> {
    let node = backend.construct(NodeConfig { repo, pubsub: true });
    let after = timeouts.node_step;

    let exists = step("repo check", after, cancel_token, node.repo_exists()).await?;
    if exists {
        step("repo ready", after, cancel_token, node.ready()).await?;
    } else {
        info!("No repo found, initializing a new one");
        step(
            "repo init",
            after,
            cancel_token,
            node.init(InitOptions::default()),
        )
        .await?;
    }

    step("start", after, cancel_token, node.start()).await?;

    match bring_online(&*node, bootstrap_peers, timeouts, cancel_token).await {
        Ok(identity) => Ok(StartedNode { node, identity }),
        Err(err) => {
            stop_quietly(&*node, timeouts.node_stop).await;
            Err(err)
        }
    }
}

/// Everything after a successful start, any error here leaves a started node to stop
async fn bring_online(
    node: &dyn P2pNode,
    bootstrap_peers: &[String],
    timeouts: Timeouts,
    cancel_token: &CancellationToken,
) -> Result<NodeIdentity> {
    let after = timeouts.node_step;
    let online = step("online check", after, cancel_token, async {
        Ok(node.is_online().await)
    })
    .await?;
    if !online {
        return Err(Error::NodeOffline);
    }
    let identity = step("identity", after, cancel_token, node.id()).await?;
    info!("Node id {identity}");

    connect_bootstrap(node, bootstrap_peers, timeouts, cancel_token).await?;

    match step("peer query", after, cancel_token, node.swarm_peers()).await {
        Ok(peers) => info!("Connected to {} peers", peers.len()),
        Err(err @ Error::Cancelled { .. }) => return Err(err),
        Err(err) => warn!("Could not list peers: {err}"),
    }
    Ok(identity)
}

/// Dial bootstrap peers in order until one connects, failures are only logged
async fn connect_bootstrap(
    node: &dyn P2pNode,
    bootstrap_peers: &[String],
    timeouts: Timeouts,
    cancel_token: &CancellationToken,
) -> Result<()> {
    for addr in bootstrap_peers {
        match step(
            "bootstrap connect",
            timeouts.bootstrap,
            cancel_token,
            node.swarm_connect(addr),
        )
        .await
        {
            Ok(()) => {
                info!("Connected to bootstrap peer {addr}");
                return Ok(());
            }
            Err(err @ Error::Cancelled { .. }) => return Err(err),
            Err(err) => warn!("Could not connect to bootstrap peer {addr}: {err}"),
        }
    }
    if !bootstrap_peers.is_empty() {
        warn!("No bootstrap peer reachable, continuing without one");
    }
    Ok(())
}

async fn stop_quietly(node: &dyn P2pNode, after: Duration) {
    if let Err(err) = shutdown(node, after).await {
        warn!("Could not stop node after aborted startup: {err}");
    }
}

/// Attach to a node that is already running, only its identity is fetched
#[instrument(skip_all, fields(host = %opts.host, port = opts.port))]
pub async fn start_remote(
    backend: &dyn NodeBackend,
    opts: &ApiOptions,
    timeouts: Timeouts,
    cancel_token: &CancellationToken,
) -> Result<StartedNode> {
    let node = backend.connect_api(opts);
    let identity = step("identity", timeouts.node_step, cancel_token, node.id()).await?;
    info!("Node id {identity}");
    Ok(StartedNode { node, identity })
}

/// Stop a running node, giving up after `after`
pub async fn shutdown(node: &dyn P2pNode, after: Duration) -> Result<()> {
    debug!("Stopping node");
    tokio::time::timeout(after, node.stop())
        .await
        .unwrap_or(Err(Error::Timeout {
            step: "node shutdown",
            after,
        }))
}
