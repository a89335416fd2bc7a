mod common;

use common::{sp_endpoint, spawn_node, test_config, wait_until, FakeSp, WAIT};
use sds_node::config::BackoffConfig;
use sds_node::conn::{ConnSettings, ConnectionManager, OfflineEvent};
use sds_node::transport::MemoryTransport;
use sds_protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn manager(transport: Arc<MemoryTransport>, capacity: usize) -> (Arc<ConnectionManager>, mpsc::Receiver<OfflineEvent>) {
    let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
    ConnectionManager::new(
        transport,
        inbound_tx,
        ConnSettings {
            local_p2p_address: "pp-local".into(),
            heartbeat_interval: Duration::from_secs(3600),
            offline_channel_capacity: capacity,
            backoff: BackoffConfig::default(),
        },
    )
}

#[tokio::test]
async fn lost_indexing_server_fails_over_to_the_next() {
    let transport = Arc::new(MemoryTransport::new());
    let mut first_listener = transport.bind("sp-1");
    let mut second_listener = transport.bind("sp-2");
    let node = spawn_node(&transport, test_config("node-a", &[sp_endpoint(1), sp_endpoint(2)]));

    let mut first = FakeSp::accept(&mut first_listener).await;
    let registered = first
        .expect(|m| match m {
            Message::ReqRegister(req) => Some(req.address.clone()),
            _ => None,
        })
        .await;
    assert_eq!(registered, node.pp_info());
    drop(first);

    let mut second = FakeSp::accept(&mut second_listener).await;
    let registered = second
        .expect(|m| match m {
            Message::ReqRegister(req) => Some(req.address.clone()),
            _ => None,
        })
        .await;
    assert_eq!(registered, node.pp_info());

    let conns = node.node.engine().connections().clone();
    wait_until(|| {
        conns
            .sp_connection()
            .map(|conn| conn.remote_addr() == "sp-2" && !conn.is_closed())
            .unwrap_or(false)
    })
    .await;
    assert!(conns.connection("sp-1").is_none());
}

#[tokio::test]
async fn offline_events_beyond_capacity_are_dropped() {
    let transport = Arc::new(MemoryTransport::new());
    let _held = transport.bind("sp-1");
    let (manager, mut offline) = manager(transport, 1);

    for _ in 0..2 {
        let conn = manager.connect("sp-1", true, true, true).await.unwrap();
        conn.close();
        wait_until(|| manager.sp_connection().is_none()).await;
    }

    let event = offline.try_recv().unwrap();
    assert_eq!(event.address, "sp-1");
    assert!(offline.try_recv().is_err());
}

#[tokio::test]
async fn closing_a_peer_link_raises_no_offline_event() {
    let transport = Arc::new(MemoryTransport::new());
    let _held = transport.bind("pp-b");
    let (manager, mut offline) = manager(transport, 2);

    let conn = manager.connect("pp-b", false, false, false).await.unwrap();
    conn.close();
    wait_until(|| manager.pool_len() == 0).await;
    assert!(offline.try_recv().is_err());
}
