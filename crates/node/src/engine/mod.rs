//! Slice protocol engine: turns gateway calls and inbound frames into protocol exchanges.

mod download;
mod node_ops;
mod report;
mod sweep;
mod transfer;
mod upload;

use async_trait::async_trait;
use dashmap::DashMap;
use sds_protocol::{Message, NodeStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::conn::{Connection, ConnectionManager, Inbound};
use crate::error::{NodeError, Result};
use crate::events::EventBus;
use crate::identity::NodeIdentity;
use crate::store::SliceStore;
use crate::task::TaskRegistry;

pub use download::{DownloadRequest, ShareLink};
pub use node_ops::FileListQuery;
pub use sweep::BufferStats;
pub use upload::UploadRequest;

use download::{DownloadBuffer, PendingSecret};
use transfer::Migration;
use upload::{IncomingSlice, UploadSource};

/// Host metrics for the periodic node-status report.
pub trait NodeStatusProbe: Send + Sync {
    fn probe(&self) -> NodeStatus;
}

/// Hands signed prepay transactions to the chain.
#[async_trait]
pub trait ChainBroadcaster: Send + Sync {
    async fn broadcast_tx(&self, wallet_address: &str, tx: &[u8]) -> anyhow::Result<()>;
}

/// Reports CPU count and slice-store usage; memory figures stay zero.
pub struct StoreStatusProbe {
    store: Arc<dyn SliceStore>,
}

impl StoreStatusProbe {
    pub fn new(store: Arc<dyn SliceStore>) -> Self {
        Self { store }
    }
}

impl NodeStatusProbe for StoreStatusProbe {
    fn probe(&self) -> NodeStatus {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as i64)
            .unwrap_or(1);
        NodeStatus {
            cpu_cores,
            disk_used: self.store.used_bytes() as i64,
            disk_total: self.store.capacity_bytes() as i64,
            ..Default::default()
        }
    }
}

/// Logs prepay transactions instead of broadcasting them.
pub struct LogBroadcaster;

#[async_trait]
impl ChainBroadcaster for LogBroadcaster {
    async fn broadcast_tx(&self, wallet_address: &str, tx: &[u8]) -> anyhow::Result<()> {
        tracing::info!(wallet = %wallet_address, tx_len = tx.len(), "Prepay transaction ready, no chain client configured");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub slice_size: u64,
    pub max_frame_payload: usize,
    pub receipt_max_age: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            slice_size: config.slice_size.max(1),
            max_frame_payload: config.max_frame_payload.max(1),
            receipt_max_age: Duration::from_secs(config.receipt_max_age_secs),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

pub struct EngineDeps {
    pub identity: Arc<NodeIdentity>,
    pub settings: EngineSettings,
    pub conns: Arc<ConnectionManager>,
    pub tasks: Arc<TaskRegistry>,
    pub store: Arc<dyn SliceStore>,
    pub events: EventBus,
    pub status_probe: Arc<dyn NodeStatusProbe>,
    pub chain: Arc<dyn ChainBroadcaster>,
}

pub struct SliceProtocolEngine {
    identity: Arc<NodeIdentity>,
    settings: EngineSettings,
    conns: Arc<ConnectionManager>,
    tasks: Arc<TaskRegistry>,
    store: Arc<dyn SliceStore>,
    events: EventBus,
    status_probe: Arc<dyn NodeStatusProbe>,
    chain: Arc<dyn ChainBroadcaster>,
    /// Last link each remote P2P address was seen on.
    routes: DashMap<String, Arc<dyn Connection>>,
    outgoing: DashMap<String, UploadSource>,
    incoming: DashMap<String, IncomingSlice>,
    downloads: DashMap<String, DownloadBuffer>,
    /// Owner secrets of downloads still waiting for their storage info, by request id.
    secrets: DashMap<String, PendingSecret>,
    migrations: DashMap<String, Migration>,
}

impl SliceProtocolEngine {
    pub fn new(deps: EngineDeps) -> Arc<Self> {
        Arc::new(Self {
            identity: deps.identity,
            settings: deps.settings,
            conns: deps.conns,
            tasks: deps.tasks,
            store: deps.store,
            events: deps.events,
            status_probe: deps.status_probe,
            chain: deps.chain,
            routes: DashMap::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            downloads: DashMap::new(),
            secrets: DashMap::new(),
            migrations: DashMap::new(),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.conns
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Entry point for every inbound frame.
    pub async fn handle(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { conn, envelope } = inbound;
        let kind = envelope.message.kind();
        let req_id = envelope.req_id;
        let outcome = match envelope.message {
            Message::Heartbeat(hb) => {
                self.learn_route(&hb.p2p_address, &conn);
                Ok(())
            }
            Message::RspRegister(rsp) => self.on_rsp_register(rsp),
            Message::RspUploadFile(rsp) => self.on_rsp_upload_file(rsp).await,
            Message::NoticeBackupFile(notice) => self.on_notice_backup_file(notice).await,
            Message::ReqUploadFileSlice(req) => self.on_req_upload_file_slice(&conn, req_id, req),
            Message::RspUploadFileSlice(rsp) => self.on_rsp_upload_file_slice(rsp).await,
            Message::RspUploadSlicesWrong(rsp) => self.on_rsp_upload_slices_wrong(rsp).await,
            Message::RspFileStorageInfo(rsp) => self.on_rsp_file_storage_info(rsp).await,
            Message::ReqDownloadSlice(req) => self.on_req_download_slice(&conn, req_id, req),
            Message::RspDownloadSlice(rsp) => self.on_rsp_download_slice(rsp).await,
            Message::NoticeFileSliceBackup(notice) => self.on_notice_file_slice_backup(notice).await,
            Message::ReqTransferDownload(req) => self.on_req_transfer_download(&conn, req_id, req),
            Message::RspTransferDownload(rsp) => self.on_rsp_transfer_download(rsp),
            Message::NoticeFileSliceVerify(notice) => self.on_notice_file_slice_verify(notice).await,
            Message::ReqVerifyDownload(req) => self.on_req_verify_download(&conn, req_id, req),
            Message::RspVerifyDownload(rsp) => self.on_rsp_verify_download(rsp),
            Message::RspFindMyFileList(rsp) => self.on_rsp_find_my_file_list(rsp),
            Message::RspMaintenance(rsp) => self.on_rsp_maintenance(rsp),
            Message::RspPrepay(rsp) => self.on_rsp_prepay(rsp).await,
            other => {
                debug!(kind = other.kind(), conn = conn.id(), "Ignoring message not addressed to a resource node");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            warn!(kind, conn = conn.id(), role = ?conn.role(), code = %err.code(), error = %err, "Message handling failed");
        }
    }

    fn sp(&self) -> Result<Arc<dyn Connection>> {
        self.conns
            .sp_connection()
            .filter(|conn| !conn.is_closed())
            .ok_or(NodeError::NoSpConnection)
    }

    fn send_to_sp(&self, message: Message) -> Result<()> {
        self.sp()?.send(message).map(|_| ())
    }

    fn learn_route(&self, p2p_address: &str, conn: &Arc<dyn Connection>) {
        if p2p_address.is_empty() || self.identity.is_local(p2p_address) {
            return;
        }
        self.routes.insert(p2p_address.to_string(), conn.clone());
    }

    /// Relays `message` when it targets another node. Returns true if the message was not ours.
    fn forward_if_foreign(&self, target: &str, message: impl FnOnce() -> Message) -> bool {
        if target.is_empty() || self.identity.is_local(target) {
            return false;
        }
        let route = self
            .routes
            .get(target)
            .map(|entry| entry.value().clone())
            .filter(|conn| !conn.is_closed());
        match route {
            Some(conn) => {
                let message = message();
                debug!(target = %target, kind = message.kind(), "Forwarding message to its addressee");
                if let Err(err) = conn.send(message) {
                    warn!(target = %target, error = %err, "Forward failed");
                }
            }
            None => warn!(target = %target, "No route to addressee, dropping message"),
        }
        true
    }

    /// Session link to `peer`, cached under `session` followed by the peer address.
    async fn peer_link(&self, session: &str, peer: &sds_protocol::PpInfo) -> Result<Arc<dyn Connection>> {
        let key = format!("{session}{}", peer.p2p_address);
        let conn = self.conns.session_connection(&key, &peer.network_address).await?;
        self.learn_route(&peer.p2p_address, &conn);
        Ok(conn)
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
