#![allow(dead_code)]

use libp2p_identity::Keypair;
use sds_node::config::{NodeConfig, SpEndpoint};
use sds_node::events::TransferEvent;
use sds_node::node::{NodeParts, PpNode};
use sds_node::store::SledSliceStore;
use sds_node::transport::{read_frame, write_frame, BoxedStream, MemoryTransport, ReadFrame};
use sds_protocol::{Envelope, Message, PpInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(10);
/// Owner secret encrypted test files are sealed under.
pub const FILE_SECRET: &str = "owner-secret";

pub fn sp_endpoint(n: usize) -> SpEndpoint {
    SpEndpoint {
        p2p_address: format!("sp-p2p-{n}"),
        network_address: format!("sp-{n}"),
    }
}

/// Small slices and frames so a few kilobytes exercise slicing and fragmentation.
pub fn test_config(address: &str, sps: &[SpEndpoint]) -> NodeConfig {
    NodeConfig {
        network_address: address.to_string(),
        sp_list: sps.to_vec(),
        wallet_address: format!("wallet-{address}"),
        slice_size: 1000,
        max_frame_payload: 300,
        heartbeat_interval_secs: 3600,
        node_status_interval_secs: 3600,
        ..NodeConfig::default()
    }
}

pub struct TestNode {
    pub node: PpNode,
    pub store: Arc<SledSliceStore>,
    pub p2p: String,
    pub address: String,
    pub wallet: String,
}

impl TestNode {
    pub fn pp_info(&self) -> PpInfo {
        PpInfo {
            p2p_address: self.p2p.clone(),
            wallet_address: self.wallet.clone(),
            network_address: self.address.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.node.engine().events().subscribe()
    }
}

/// Launches a node on the in-memory transport and accepts the links peers open to it.
pub fn spawn_node(transport: &Arc<MemoryTransport>, config: NodeConfig) -> TestNode {
    let address = config.network_address.clone();
    let wallet = config.wallet_address.clone();
    let mut accepted = transport.bind(&address);
    let store = Arc::new(SledSliceStore::temporary(1 << 30).expect("temporary slice store"));
    let node = PpNode::launch(NodeParts {
        config,
        keypair: Keypair::generate_ed25519(),
        transport: transport.clone(),
        store: store.clone(),
        status_probe: None,
        chain: None,
    });
    let conns = node.engine().connections().clone();
    tokio::spawn(async move {
        while let Some(stream) = accepted.recv().await {
            let _ = conns.adopt(stream, "memory");
        }
    });
    let p2p = node.engine().identity().p2p_address.clone();
    TestNode {
        node,
        store,
        p2p,
        address,
        wallet,
    }
}

/// Waits for the first event `pick` accepts.
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<TransferEvent>,
    mut pick: impl FnMut(&TransferEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Scripted indexing server on the far end of one node link.
pub struct FakeSp {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    next_req_id: u64,
    /// Everything received that an `expect` call skipped over.
    pub seen: Vec<Message>,
}

impl FakeSp {
    pub async fn accept(listener: &mut mpsc::UnboundedReceiver<BoxedStream>) -> Self {
        let stream = timeout(WAIT, listener.recv())
            .await
            .expect("no node dialed the indexing server")
            .expect("listener closed");
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            next_req_id: 1_000_000,
            seen: Vec::new(),
        }
    }

    /// Next non-heartbeat message, or None once the node hangs up.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match read_frame(&mut self.reader).await.ok()? {
                ReadFrame::Envelope(envelope) => match envelope.message {
                    Message::Heartbeat(_) => continue,
                    other => return Some(other),
                },
                ReadFrame::Malformed(_) => continue,
                ReadFrame::Eof => return None,
            }
        }
    }

    pub async fn expect<T>(&mut self, mut pick: impl FnMut(&Message) -> Option<T>) -> T {
        timeout(WAIT, async {
            loop {
                let message = self.recv().await.expect("node closed the indexing server link");
                if let Some(found) = pick(&message) {
                    return found;
                }
                self.seen.push(message);
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    pub async fn send(&mut self, message: Message) {
        self.next_req_id += 1;
        write_frame(&mut self.writer, &Envelope::new(self.next_req_id, message))
            .await
            .expect("write to node");
    }
}

pub fn sample_file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
