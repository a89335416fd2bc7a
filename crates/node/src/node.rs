//! Node runtime: wires the store, identity, connection layer and engine together and runs the
//! background loops.

use anyhow::Context;
use libp2p_identity::Keypair;
use sds_protocol::Message;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, SpEndpoint};
use crate::conn::{ConnId, ConnSettings, Connection, ConnectionManager, Inbound, OfflineEvent};
use crate::engine::{ChainBroadcaster, EngineDeps, EngineSettings, LogBroadcaster, NodeStatusProbe, SliceProtocolEngine, StoreStatusProbe};
use crate::error::NodeError;
use crate::events::EventBus;
use crate::identity::{load_or_create_keypair, NodeIdentity};
use crate::store::{SledSliceStore, SliceStore};
use crate::task::TaskRegistry;
use crate::transport::{TcpTransport, Transport};

/// Everything a node is built from. `PpNode::start` fills this from a config; tests build it by hand.
pub struct NodeParts {
    pub config: NodeConfig,
    pub keypair: Keypair,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn SliceStore>,
    pub status_probe: Option<Arc<dyn NodeStatusProbe>>,
    pub chain: Option<Arc<dyn ChainBroadcaster>>,
}

pub struct PpNode {
    engine: Arc<SliceProtocolEngine>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PpNode {
    /// Opens the sled store under the configured storage path, binds the TCP listener and launches.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_path)
            .with_context(|| format!("failed to create storage path {}", config.storage_path))?;
        let keypair = load_or_create_keypair(Path::new(&config.storage_path))?;
        let store = SledSliceStore::open(&config.storage_path, config.max_gb)
            .with_context(|| format!("failed to open slice store under {}", config.storage_path))?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        info!(listen = %config.listen, "Listening for peer connections");

        let mut node = Self::launch(NodeParts {
            config,
            keypair,
            transport: Arc::new(TcpTransport::default()),
            store: Arc::new(store),
            status_probe: None,
            chain: None,
        });
        let conns = node.engine.connections().clone();
        let shutdown = node.shutdown_tx.subscribe();
        node.handles.push(tokio::spawn(accept_loop(listener, conns, shutdown)));
        Ok(node)
    }

    /// Builds the engine and spawns the dispatcher, the indexing-server supervisor and the
    /// status and cleanup loops.
    pub fn launch(parts: NodeParts) -> Self {
        let NodeParts {
            config,
            keypair,
            transport,
            store,
            status_probe,
            chain,
        } = parts;
        let identity = Arc::new(NodeIdentity::new(
            keypair,
            &config.wallet_address,
            config.beneficiary(),
            &config.network_address,
        ));
        info!(p2p = %identity.p2p_address, wallet = %identity.wallet_address, "Node identity loaded");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (conns, offline_rx) = ConnectionManager::new(
            transport,
            inbound_tx,
            ConnSettings::from_config(&config, &identity.p2p_address),
        );
        let engine = SliceProtocolEngine::new(EngineDeps {
            identity,
            settings: EngineSettings::from_config(&config),
            conns,
            tasks: Arc::new(TaskRegistry::new()),
            status_probe: status_probe.unwrap_or_else(|| Arc::new(StoreStatusProbe::new(store.clone()))),
            store,
            events: EventBus::default(),
            chain: chain.unwrap_or_else(|| Arc::new(LogBroadcaster)),
        });

        let (shutdown_tx, _) = watch::channel(false);
        let closed_rx = engine.connections().subscribe_closed();
        let handles = vec![
            tokio::spawn(dispatch_loop(engine.clone(), inbound_rx, shutdown_tx.subscribe())),
            tokio::spawn(supervise_sp(
                engine.clone(),
                config.sp_list.clone(),
                config.backoff.min_interval(),
                offline_rx,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(status_loop(
                engine.clone(),
                config.node_status_interval(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(janitor_loop(
                engine.clone(),
                closed_rx,
                config.sweep_interval(),
                config.stale_transfer_after(),
                shutdown_tx.subscribe(),
            )),
        ];
        Self {
            engine,
            shutdown_tx,
            handles,
        }
    }

    pub fn engine(&self) -> &Arc<SliceProtocolEngine> {
        &self.engine
    }

    /// Runs until `shutdown` fires, then stops every loop and closes outbound links.
    pub async fn run_until(self, shutdown: oneshot::Receiver<()>) {
        let _ = shutdown.await;
        info!("Shutdown signal received, stopping node");
        self.stop().await;
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.engine.connections().close_all();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Messages whose handlers dial peers run on their own task so the link they came in on keeps
/// draining. Everything else is handled in arrival order per link.
fn runs_detached(message: &Message) -> bool {
    matches!(
        message,
        Message::RspUploadFile(_)
            | Message::NoticeBackupFile(_)
            | Message::RspUploadSlicesWrong(_)
            | Message::RspFileStorageInfo(_)
            | Message::NoticeFileSliceBackup(_)
            | Message::NoticeFileSliceVerify(_)
            | Message::RspPrepay(_)
    )
}

async fn dispatch_loop(
    engine: Arc<SliceProtocolEngine>,
    mut inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lanes: HashMap<ConnId, (Arc<dyn Connection>, mpsc::UnboundedSender<Inbound>)> = HashMap::new();
    loop {
        let inbound = tokio::select! {
            _ = shutdown.changed() => break,
            inbound = inbound_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        if runs_detached(&inbound.envelope.message) {
            let engine = engine.clone();
            tokio::spawn(async move { engine.handle(inbound).await });
            continue;
        }
        let id = inbound.conn.id();
        if !lanes.contains_key(&id) {
            lanes.retain(|_, (conn, _)| !conn.is_closed());
            let (lane_tx, mut lane_rx) = mpsc::unbounded_channel::<Inbound>();
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(inbound) = lane_rx.recv().await {
                    engine.handle(inbound).await;
                }
            });
            lanes.insert(id, (inbound.conn.clone(), lane_tx));
        }
        if let Some((_, lane)) = lanes.get(&id) {
            if lane.send(inbound).is_err() {
                lanes.remove(&id);
            }
        }
    }
    debug!("Dispatcher stopped");
}

async fn accept_loop(listener: TcpListener, conns: Arc<ConnectionManager>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(remote = %remote, error = %err, "Could not set nodelay");
                    }
                    if let Err(err) = conns.adopt(Box::new(stream), &remote.to_string()) {
                        warn!(remote = %remote, error = %err, "Could not adopt inbound connection");
                    }
                }
                Err(err) => warn!(error = %err, "Accept failed"),
            },
        }
    }
    debug!("Listener stopped");
}

/// Connects to the first indexing server the backoff table lets through, starting at `start`.
/// Returns the index of the server now in use.
async fn connect_first_allowed(
    engine: &Arc<SliceProtocolEngine>,
    sp_list: &[SpEndpoint],
    start: usize,
) -> Option<usize> {
    let conns = engine.connections();
    for step in 0..sp_list.len() {
        let idx = (start + step) % sp_list.len();
        let sp = &sp_list[idx];
        if !conns.record_failure_and_check_backoff(&sp.network_address, Instant::now()) {
            let err = NodeError::BackoffRefused(sp.network_address.clone());
            debug!(sp = %sp.p2p_address, error = %err, "Skipping indexing server");
            continue;
        }
        match conns.connect(&sp.network_address, true, true, true).await {
            Ok(_) => {
                if let Err(err) = engine.register() {
                    warn!(sp = %sp.p2p_address, error = %err, "Registration not sent");
                }
                return Some(idx);
            }
            Err(err) => warn!(sp = %sp.p2p_address, address = %sp.network_address, error = %err, "Indexing server unreachable"),
        }
    }
    None
}

/// Keeps the node attached to an indexing server, failing over along `sp_list` when the main
/// link drops.
async fn supervise_sp(
    engine: Arc<SliceProtocolEngine>,
    sp_list: Vec<SpEndpoint>,
    retry_every: Duration,
    mut offline_rx: mpsc::Receiver<OfflineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    if sp_list.is_empty() {
        warn!("No indexing servers configured, running detached");
        return;
    }
    let mut next = 0usize;
    loop {
        let Some(current) = connect_first_allowed(&engine, &sp_list, next).await else {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(retry_every) => {}
            }
            continue;
        };
        let current_address = sp_list[current].network_address.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = offline_rx.recv() => match event {
                    Some(event) if event.address == current_address => break,
                    Some(event) => debug!(address = %event.address, "Stale offline event"),
                    None => return,
                },
            }
        }
        info!(sp = %sp_list[current].p2p_address, "Failing over to the next indexing server");
        next = (current + 1) % sp_list.len();
    }
}

async fn status_loop(engine: Arc<SliceProtocolEngine>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match engine.report_node_status() {
                    Ok(()) => {}
                    Err(NodeError::NoSpConnection) => debug!("Node status skipped, no indexing server"),
                    Err(err) => warn!(error = %err, "Node status report failed"),
                }
            }
        }
    }
}

/// Forgets closed links as they go and periodically drops transfers that stopped moving.
async fn janitor_loop(
    engine: Arc<SliceProtocolEngine>,
    mut closed_rx: broadcast::Receiver<ConnId>,
    every: Duration,
    max_idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            closed = closed_rx.recv() => match closed {
                Ok(id) => engine.forget_connection(id),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Missed link closures, sweeping now");
                    engine.sweep_stale(max_idle);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                engine.sweep_stale(max_idle);
            }
        }
    }
    debug!("Janitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sds_protocol::{Heartbeat, RspUploadFile};

    #[test]
    fn only_dialing_flows_leave_their_lane() {
        assert!(runs_detached(&Message::RspUploadFile(RspUploadFile::default())));
        assert!(!runs_detached(&Message::Heartbeat(Heartbeat::default())));
    }
}
