use sds_protocol::{Envelope, Heartbeat, Message};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Interval;
use tracing::debug;

use super::{ConnId, ConnRole, Connection, Inbound};
use crate::error::{NodeError, Result};
use crate::transport::{read_frame, write_frame, BoxedStream, ReadFrame};

/// Called once when a started link stops, whichever side noticed first.
pub(crate) type CloseHook = Box<dyn FnOnce(&Arc<dyn Connection>) + Send>;

#[derive(Debug, Clone)]
pub(crate) struct HeartbeatPlan {
    pub interval: Duration,
    pub p2p_address: String,
}

/// Queue-backed framing shared by both connection kinds.
#[derive(Debug)]
struct Link {
    id: ConnId,
    remote_addr: String,
    heartbeat: Option<HeartbeatPlan>,
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    next_req_id: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Link {
    fn new(id: ConnId, remote_addr: &str, heartbeat: Option<HeartbeatPlan>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            id,
            remote_addr: remote_addr.to_string(),
            heartbeat,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            next_req_id: AtomicU64::new(1),
            closed,
        }
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::ConnectionClosed(self.remote_addr.clone()));
        }
        self.outbound_tx
            .send(envelope)
            .map_err(|_| NodeError::ConnectionClosed(self.remote_addr.clone()))
    }

    fn send(&self, message: Message) -> Result<u64> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        self.enqueue(Envelope::new(req_id, message))?;
        Ok(req_id)
    }

    fn reply(&self, req_id: u64, message: Message) -> Result<()> {
        self.enqueue(Envelope::new(req_id, message))
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Spawns the reader and writer tasks for `conn`, whose link is `self`.
    fn spawn(
        &self,
        conn: Arc<dyn Connection>,
        stream: BoxedStream,
        inbound: mpsc::UnboundedSender<Inbound>,
        on_close: CloseHook,
    ) -> Result<()> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| NodeError::InternalComm(format!("connection {} already started", self.id)))?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let hook = Arc::new(Mutex::new(Some(on_close)));

        let mut closed_w = self.closed.subscribe();
        let mut closed_r = self.closed.subscribe();
        if self.is_closed() {
            finish(&conn, &hook);
            return Ok(());
        }

        let heartbeat = self.heartbeat.clone();
        let writer_conn = conn.clone();
        let writer_hook = hook.clone();
        tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            let mut ticker = heartbeat
                .as_ref()
                .map(|plan| tokio::time::interval(plan.interval));
            loop {
                let envelope = tokio::select! {
                    _ = closed_w.changed() => break,
                    next = outbound_rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = tick(&mut ticker) => {
                        let Some(plan) = heartbeat.as_ref() else { continue };
                        Envelope::new(0, Message::Heartbeat(Heartbeat {
                            p2p_address: plan.p2p_address.clone(),
                            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
                        }))
                    }
                };
                if let Err(err) = write_frame(&mut writer, &envelope).await {
                    debug!(conn = writer_conn.id(), error = %err, "Write failed, closing link");
                    break;
                }
            }
            let _ = writer.shutdown().await;
            finish(&writer_conn, &writer_hook);
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_r.changed() => break,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(ReadFrame::Envelope(envelope)) => {
                            let item = Inbound { conn: conn.clone(), envelope };
                            if inbound.send(item).is_err() {
                                break;
                            }
                        }
                        Ok(ReadFrame::Malformed(err)) => {
                            debug!(conn = conn.id(), error = %err, "Dropping undecodable frame");
                        }
                        Ok(ReadFrame::Eof) => break,
                        Err(err) => {
                            debug!(conn = conn.id(), error = %err, "Read failed, closing link");
                            break;
                        }
                    }
                }
            }
            finish(&conn, &hook);
        });
        Ok(())
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn finish(conn: &Arc<dyn Connection>, hook: &Mutex<Option<CloseHook>>) {
    conn.close();
    let taken = hook.lock().ok().and_then(|mut guard| guard.take());
    if let Some(on_close) = taken {
        on_close(conn);
    }
}

/// Link to an indexing server.
#[derive(Debug)]
pub struct SpConn {
    link: Link,
    auto_reconnect: bool,
}

impl SpConn {
    pub(crate) fn new(
        id: ConnId,
        address: &str,
        heartbeat: Option<HeartbeatPlan>,
        auto_reconnect: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            link: Link::new(id, address, heartbeat),
            auto_reconnect,
        })
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub(crate) fn start(
        self: &Arc<Self>,
        stream: BoxedStream,
        inbound: mpsc::UnboundedSender<Inbound>,
        on_close: CloseHook,
    ) -> Result<()> {
        let conn: Arc<dyn Connection> = self.clone();
        self.link.spawn(conn, stream, inbound, on_close)
    }
}

impl Connection for SpConn {
    fn id(&self) -> ConnId {
        self.link.id
    }

    fn remote_addr(&self) -> &str {
        &self.link.remote_addr
    }

    fn role(&self) -> ConnRole {
        ConnRole::IndexingServer
    }

    fn send(&self, message: Message) -> Result<u64> {
        self.link.send(message)
    }

    fn reply(&self, req_id: u64, message: Message) -> Result<()> {
        self.link.reply(req_id, message)
    }

    fn close(&self) {
        self.link.close()
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}

/// Link to another resource node, dialed or accepted.
#[derive(Debug)]
pub struct PeerConn {
    link: Link,
    accepted: bool,
}

impl PeerConn {
    pub(crate) fn new(id: ConnId, address: &str, heartbeat: Option<HeartbeatPlan>) -> Arc<Self> {
        Arc::new(Self {
            link: Link::new(id, address, heartbeat),
            accepted: false,
        })
    }

    pub(crate) fn accepted(id: ConnId, remote: &str) -> Arc<Self> {
        Arc::new(Self {
            link: Link::new(id, remote, None),
            accepted: true,
        })
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub(crate) fn start(
        self: &Arc<Self>,
        stream: BoxedStream,
        inbound: mpsc::UnboundedSender<Inbound>,
        on_close: CloseHook,
    ) -> Result<()> {
        let conn: Arc<dyn Connection> = self.clone();
        self.link.spawn(conn, stream, inbound, on_close)
    }
}

impl Connection for PeerConn {
    fn id(&self) -> ConnId {
        self.link.id
    }

    fn remote_addr(&self) -> &str {
        &self.link.remote_addr
    }

    fn role(&self) -> ConnRole {
        ConnRole::Peer
    }

    fn send(&self, message: Message) -> Result<u64> {
        self.link.send(message)
    }

    fn reply(&self, req_id: u64, message: Message) -> Result<()> {
        self.link.reply(req_id, message)
    }

    fn close(&self) {
        self.link.close()
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }
}
