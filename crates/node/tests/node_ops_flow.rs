mod common;

use common::{sp_endpoint, spawn_node, test_config, wait_for, FakeSp};
use sds_node::engine::FileListQuery;
use sds_node::events::TransferEvent;
use sds_node::transport::MemoryTransport;
use sds_protocol::{ListedFile, Message, OpResult, RspFindMyFileList, RspMaintenance, RspRegister, WalletSignature};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn registration_status_and_maintenance_round_trip() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let node = spawn_node(&transport, test_config("node-a", &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    let mut events = node.subscribe();
    let register = sp
        .expect(|m| match m {
            Message::ReqRegister(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    assert_eq!(register.address.p2p_address, node.p2p);
    assert!(!register.public_key.is_empty());

    sp.send(Message::RspRegister(RspRegister {
        p2p_address: node.p2p.clone(),
        sp_p2p_address: "sp-p2p-1".into(),
        is_pp: true,
        result: OpResult::success(),
    }))
    .await;
    let is_pp = wait_for(&mut events, |event| match event {
        TransferEvent::Registered { is_pp, .. } => Some(*is_pp),
        _ => None,
    })
    .await;
    assert!(is_pp);

    let engine = node.node.engine();
    engine.report_node_status().unwrap();
    let status = sp
        .expect(|m| match m {
            Message::ReqReportNodeStatus(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    assert_eq!(status.p2p_address, node.p2p);
    assert_eq!(status.status.disk_total, 1 << 30);

    engine.start_maintenance(Duration::from_secs(600)).unwrap();
    let start = sp
        .expect(|m| match m {
            Message::ReqStartMaintenance(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    assert_eq!(start.duration_secs, 600);
    sp.send(Message::RspMaintenance(RspMaintenance {
        starting: true,
        result: OpResult::failed("too many nodes in maintenance"),
    }))
    .await;
    let (starting, success) = wait_for(&mut events, |event| match event {
        TransferEvent::Maintenance { starting, success, .. } => Some((*starting, *success)),
        _ => None,
    })
    .await;
    assert!(starting);
    assert!(!success);

    engine.stop_maintenance().unwrap();
    sp.expect(|m| matches!(m, Message::ReqStopMaintenance(_)).then_some(()))
        .await;
}

#[tokio::test]
async fn file_list_answers_are_published() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let node = spawn_node(&transport, test_config("node-a", &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;
    let mut events = node.subscribe();
    let engine = node.node.engine();

    assert!(engine.find_my_file_list(FileListQuery::default()).is_err());
    let req_id = engine
        .find_my_file_list(FileListQuery {
            keyword: "movie".into(),
            page_id: 2,
            signature: WalletSignature {
                address: "wallet-owner".into(),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    let query = sp
        .expect(|m| match m {
            Message::ReqFindMyFileList(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    assert_eq!(query.req_id, req_id);
    assert_eq!(query.page_id, 2);

    sp.send(Message::RspFindMyFileList(RspFindMyFileList {
        p2p_address: node.p2p.clone(),
        wallet_address: "wallet-owner".into(),
        req_id: req_id.clone(),
        files: vec![ListedFile {
            file_hash: "h1".into(),
            file_name: "movie.bin".into(),
            file_size: 2500,
            ..Default::default()
        }],
        total_file_number: 1,
        page_id: 2,
        result: OpResult::success(),
    }))
    .await;
    let (answered, files) = wait_for(&mut events, |event| match event {
        TransferEvent::FileList { req_id, files, .. } => Some((req_id.clone(), files.clone())),
        _ => None,
    })
    .await;
    assert_eq!(answered, req_id);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name, "movie.bin");
}
