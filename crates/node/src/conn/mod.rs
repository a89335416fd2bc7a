//! Connection layer: links to the indexing server and to peer nodes.

pub mod backoff;
mod client;
mod manager;

use sds_protocol::{Envelope, Message};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

pub use backoff::{BackoffTable, ReconnectRecord};
pub use client::{PeerConn, SpConn};
pub use manager::{ConnSettings, ConnectionManager, OfflineEvent};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    IndexingServer,
    Peer,
}

/// What every link offers regardless of who is on the other end.
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnId;
    fn remote_addr(&self) -> &str;
    fn role(&self) -> ConnRole;
    /// Queues a request and returns the request id it went out under.
    fn send(&self, message: Message) -> Result<u64>;
    /// Queues a response to request `req_id`.
    fn reply(&self, req_id: u64, message: Message) -> Result<()>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A decoded frame together with the link it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub conn: Arc<dyn Connection>,
    pub envelope: Envelope,
}
