use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::backoff::BackoffTable;
use super::client::{CloseHook, HeartbeatPlan, PeerConn, SpConn};
use super::{ConnId, Connection, Inbound};
use crate::config::{BackoffConfig, NodeConfig};
use crate::error::{NodeError, Result};
use crate::transport::{BoxedStream, Transport};

#[derive(Debug, Clone)]
pub struct ConnSettings {
    pub local_p2p_address: String,
    pub heartbeat_interval: Duration,
    pub offline_channel_capacity: usize,
    pub backoff: BackoffConfig,
}

impl ConnSettings {
    pub fn from_config(config: &NodeConfig, local_p2p_address: &str) -> Self {
        Self {
            local_p2p_address: local_p2p_address.to_string(),
            heartbeat_interval: config.heartbeat_interval(),
            offline_channel_capacity: config.offline_channel_capacity.max(1),
            backoff: config.backoff.clone(),
        }
    }
}

/// Raised when the main indexing-server link goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEvent {
    pub address: String,
    pub conn_id: ConnId,
}

enum Dialing {
    Sp(Arc<SpConn>),
    Peer(Arc<PeerConn>),
}

impl Dialing {
    fn conn(&self) -> Arc<dyn Connection> {
        match self {
            Dialing::Sp(conn) => conn.clone(),
            Dialing::Peer(conn) => conn.clone(),
        }
    }

    fn start(&self, stream: BoxedStream, inbound: mpsc::UnboundedSender<Inbound>, on_close: CloseHook) -> Result<()> {
        match self {
            Dialing::Sp(conn) => conn.start(stream, inbound, on_close),
            Dialing::Peer(conn) => conn.start(stream, inbound, on_close),
        }
    }
}

/// Owns every outbound link of the node.
///
/// The pool keeps one connection per remote address. The main indexing-server link also sits in
/// its own slot. Session connections for a transfer are cached under keys that start with the
/// file hash so the whole transfer can be evicted at once.
pub struct ConnectionManager {
    settings: ConnSettings,
    transport: Arc<dyn Transport>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    pool: Mutex<HashMap<String, Arc<dyn Connection>>>,
    sp_slot: Mutex<Option<Arc<dyn Connection>>>,
    cached: DashMap<String, Arc<dyn Connection>>,
    backoff: BackoffTable,
    offline_tx: mpsc::Sender<OfflineEvent>,
    /// Every link that goes away, pooled or accepted.
    closed_tx: broadcast::Sender<ConnId>,
    next_id: AtomicU64,
}

const CLOSED_CHANNEL_CAPACITY: usize = 256;

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        settings: ConnSettings,
    ) -> (Arc<Self>, mpsc::Receiver<OfflineEvent>) {
        let (offline_tx, offline_rx) = mpsc::channel(settings.offline_channel_capacity.max(1));
        let manager = Arc::new(Self {
            backoff: BackoffTable::new(&settings.backoff),
            settings,
            transport,
            inbound_tx,
            pool: Mutex::new(HashMap::new()),
            sp_slot: Mutex::new(None),
            cached: DashMap::new(),
            offline_tx,
            closed_tx: broadcast::channel(CLOSED_CHANNEL_CAPACITY).0,
            next_id: AtomicU64::new(1),
        });
        (manager, offline_rx)
    }

    pub fn local_p2p_address(&self) -> &str {
        &self.settings.local_p2p_address
    }

    /// Dials `address` and registers the link in the pool.
    ///
    /// An indexing-server link is placed in the main slot before the dial starts so a response
    /// racing the dial always finds the slot filled. A failed dial closes the pending link, undoes
    /// the registration and is returned as-is; retrying is the caller's call.
    pub async fn connect(
        self: &Arc<Self>,
        address: &str,
        heartbeat: bool,
        reconnect: bool,
        is_sp: bool,
    ) -> Result<Arc<dyn Connection>> {
        if let Some(existing) = self.connection(address) {
            if !existing.is_closed() {
                if is_sp {
                    self.set_sp_slot(Some(existing.clone()));
                }
                return Ok(existing);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let plan = heartbeat.then(|| HeartbeatPlan {
            interval: self.settings.heartbeat_interval,
            p2p_address: self.settings.local_p2p_address.clone(),
        });
        let dialing = if is_sp {
            Dialing::Sp(SpConn::new(id, address, plan, reconnect))
        } else {
            Dialing::Peer(PeerConn::new(id, address, plan))
        };
        let conn = dialing.conn();

        if is_sp {
            self.set_sp_slot(Some(conn.clone()));
        }
        if let Ok(mut pool) = self.pool.lock() {
            pool.insert(address.to_string(), conn.clone());
        }

        let stream = match self.transport.open(address).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(address = %address, sp = is_sp, error = %err, "Dial failed");
                self.forget(&conn);
                return Err(NodeError::Io(err));
            }
        };
        if let Err(err) = dialing.start(stream, self.inbound_tx.clone(), self.close_hook()) {
            self.forget(&conn);
            return Err(err);
        }
        info!(address = %address, conn = id, sp = is_sp, heartbeat, "Connection established");
        Ok(conn)
    }

    /// Registers a link a remote node opened to us. Accepted links are not pooled.
    pub fn adopt(self: &Arc<Self>, stream: BoxedStream, remote: &str) -> Result<Arc<dyn Connection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = PeerConn::accepted(id, remote);
        conn.start(stream, self.inbound_tx.clone(), self.close_hook())?;
        debug!(remote = %remote, conn = id, "Accepted inbound connection");
        Ok(conn)
    }

    /// Ids of links as they close. Lagging receivers lose the oldest ids.
    pub fn subscribe_closed(&self) -> broadcast::Receiver<ConnId> {
        self.closed_tx.subscribe()
    }

    pub fn sp_connection(&self) -> Option<Arc<dyn Connection>> {
        self.sp_slot.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn connection(&self, address: &str) -> Option<Arc<dyn Connection>> {
        self.pool.lock().ok().and_then(|pool| pool.get(address).cloned())
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().map(|pool| pool.len()).unwrap_or(0)
    }

    pub fn get_cached_connection(&self, key: &str) -> Option<Arc<dyn Connection>> {
        let conn = self.cached.get(key).map(|entry| entry.value().clone())?;
        if conn.is_closed() {
            self.cached.remove(key);
            return None;
        }
        Some(conn)
    }

    pub fn cache_connection(&self, key: &str, conn: Arc<dyn Connection>) {
        self.cached.insert(key.to_string(), conn);
    }

    pub fn evict_cached_connection(&self, key: &str) -> Option<Arc<dyn Connection>> {
        self.cached.remove(key).map(|(_, conn)| conn)
    }

    /// Drops every cached entry whose key starts with `prefix`. Pooled links stay open.
    pub fn evict_all_with_prefix(&self, prefix: &str) -> usize {
        let mut evicted = 0;
        self.cached.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            debug!(prefix = %prefix, evicted, "Evicted cached session connections");
        }
        evicted
    }

    pub fn cached_keys(&self) -> Vec<String> {
        self.cached.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Session link for one transfer: reuses the cached link under `key` or dials `address`.
    pub async fn session_connection(self: &Arc<Self>, key: &str, address: &str) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = self.get_cached_connection(key) {
            return Ok(conn);
        }
        let conn = self.connect(address, false, false, false).await?;
        self.cache_connection(key, conn.clone());
        Ok(conn)
    }

    pub fn record_failure_and_check_backoff(&self, sp_address: &str, now: Instant) -> bool {
        self.backoff.record_failure_and_check_backoff(sp_address, now)
    }

    pub fn can_connect(&self, sp_address: &str, now: Instant) -> bool {
        self.backoff.can_connect(sp_address, now)
    }

    pub fn close_all(&self) {
        let conns: Vec<_> = self
            .pool
            .lock()
            .map(|pool| pool.values().cloned().collect())
            .unwrap_or_default();
        for conn in conns {
            conn.close();
        }
    }

    fn set_sp_slot(&self, conn: Option<Arc<dyn Connection>>) {
        if let Ok(mut slot) = self.sp_slot.lock() {
            *slot = conn;
        }
    }

    fn close_hook(self: &Arc<Self>) -> CloseHook {
        let manager: Weak<Self> = Arc::downgrade(self);
        Box::new(move |conn: &Arc<dyn Connection>| {
            if let Some(manager) = manager.upgrade() {
                manager.handle_close(conn);
            }
        })
    }

    /// Undoes the registration of a link that never came up. Callers that picked the pending
    /// link out of the pool see it closed.
    fn forget(&self, conn: &Arc<dyn Connection>) {
        conn.close();
        self.remove_from_pool(conn);
        self.cached.retain(|_, cached| cached.id() != conn.id());
        self.take_sp_slot_if(conn.id());
    }

    fn remove_from_pool(&self, conn: &Arc<dyn Connection>) {
        if let Ok(mut pool) = self.pool.lock() {
            if pool.get(conn.remote_addr()).map(|c| c.id()) == Some(conn.id()) {
                pool.remove(conn.remote_addr());
            }
        }
    }

    fn take_sp_slot_if(&self, id: ConnId) -> bool {
        let Ok(mut slot) = self.sp_slot.lock() else {
            return false;
        };
        if slot.as_ref().map(|c| c.id()) == Some(id) {
            *slot = None;
            return true;
        }
        false
    }

    fn handle_close(&self, conn: &Arc<dyn Connection>) {
        self.remove_from_pool(conn);
        self.cached.retain(|_, cached| cached.id() != conn.id());
        let _ = self.closed_tx.send(conn.id());
        if !self.take_sp_slot_if(conn.id()) {
            debug!(address = %conn.remote_addr(), conn = conn.id(), "Connection closed");
            return;
        }
        let event = OfflineEvent {
            address: conn.remote_addr().to_string(),
            conn_id: conn.id(),
        };
        match self.offline_tx.try_send(event) {
            Ok(()) => info!(sp = %conn.remote_addr(), "Indexing server connection lost"),
            Err(TrySendError::Full(_)) => {
                debug!(sp = %conn.remote_addr(), "Offline channel full, dropping event")
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sp = %conn.remote_addr(), "Offline channel closed")
            }
        }
    }
}
