mod common;

use common::{sample_file, sp_endpoint, spawn_node, test_config, wait_for, wait_until, FakeSp, TestNode};
use sds_node::engine::UploadRequest;
use sds_node::events::TransferEvent;
use sds_node::slice::slice_hash;
use sds_node::store::SliceStore;
use sds_node::task::SliceStatus;
use sds_node::transport::{write_frame, MemoryTransport, Transport};
use sds_node::NodeError;
use sds_protocol::{
    Envelope, Message, NoticeBackupFile, OpResult, PpInfo, ReqUploadFileSlice, ResultCode, RspUploadFile,
    RspUploadSlicesWrong, SliceHashAddr, SliceOffset, UploadType,
};
use std::sync::Arc;
use std::time::Duration;

fn upload_request(data: &[u8]) -> UploadRequest {
    UploadRequest {
        file_name: "report.bin".into(),
        data: data.to_vec(),
        declared_size: data.len() as u64,
        wallet_address: "wallet-owner".into(),
        wallet_pubkey_hex: "aa01".into(),
        signature_hex: "bb02".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn failed_slice_is_reassigned_and_upload_completes() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let holder_b = spawn_node(&transport, test_config("node-b", &[]));
    let holder_c = spawn_node(&transport, test_config("node-c", &[]));
    let uploader = spawn_node(&transport, test_config("node-a", &[sp_endpoint(1)]));

    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;
    let mut events = uploader.subscribe();

    let data = sample_file(2500);
    let file_hash = uploader.node.engine().request_upload(upload_request(&data)).unwrap();
    let req = sp
        .expect(|m| match m {
            Message::ReqUploadFile(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    assert_eq!(req.file_info.file_hash, file_hash);
    let ranges: Vec<SliceOffset> = req.slices.iter().map(|s| s.slice_offset).collect();
    assert_eq!(
        ranges,
        vec![SliceOffset::new(0, 1000), SliceOffset::new(1000, 2000), SliceOffset::new(2000, 2500)]
    );

    let ghost = PpInfo {
        p2p_address: "ghost-p2p".into(),
        wallet_address: "wallet-ghost".into(),
        network_address: "ghost".into(),
    };
    let mut plan = req.slices.clone();
    plan[0].pp_info = holder_b.pp_info();
    plan[1].pp_info = ghost.clone();
    plan[2].pp_info = holder_b.pp_info();
    sp.send(Message::RspUploadFile(RspUploadFile {
        task_id: "task-up-1".into(),
        file_hash: file_hash.clone(),
        file_size: 2500,
        owner_wallet_address: "wallet-owner".into(),
        sp_p2p_address: "sp-p2p-1".into(),
        slices: plan.clone(),
        result: OpResult::success(),
        ..Default::default()
    }))
    .await;

    let wrong = sp
        .expect(|m| match m {
            Message::ReqUploadSlicesWrong(wrong) => Some(wrong.clone()),
            _ => None,
        })
        .await;
    assert_eq!(wrong.task_id, "task-up-1");
    assert_eq!(wrong.slices.len(), 1);
    assert_eq!(wrong.slices[0].slice_number, 2);
    assert_eq!(wrong.excluded_destinations, vec![ghost]);

    let uploader_reports: Vec<_> = sp
        .seen
        .iter()
        .filter_map(|m| match m {
            Message::ReportUploadSliceResult(report) => Some(report.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(uploader_reports.len(), 2);
    for report in &uploader_reports {
        assert!(report.upload_success);
        assert!(!report.is_storage_side);
        assert_eq!(report.opponent_p2p_address, holder_b.p2p);
        assert_eq!(report.p2p_address, uploader.p2p);
    }

    let mut reassigned = wrong.slices[0].clone();
    reassigned.pp_info = holder_c.pp_info();
    sp.send(Message::RspUploadSlicesWrong(RspUploadSlicesWrong {
        upload_type: UploadType::Upload,
        task_id: "task-up-1".into(),
        file_hash: file_hash.clone(),
        slices: vec![reassigned],
        result: OpResult::success(),
    }))
    .await;

    let mut last_progress = 0;
    wait_for(&mut events, |event| match event {
        TransferEvent::Progress { done_bytes, total_bytes, .. } => {
            assert!(done_bytes <= total_bytes);
            last_progress = *done_bytes;
            None
        }
        TransferEvent::Completed { file_hash: done, .. } if *done == file_hash => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(last_progress, 2500);

    assert!(holder_b.store.has_slice(&plan[0].slice_hash).unwrap());
    assert!(holder_b.store.has_slice(&plan[2].slice_hash).unwrap());
    assert!(!holder_b.store.has_slice(&plan[1].slice_hash).unwrap());
    assert!(holder_c.store.has_slice(&plan[1].slice_hash).unwrap());
    assert_eq!(
        holder_c.store.get_slice(&plan[1].slice_hash).unwrap().unwrap(),
        data[1000..2000].to_vec()
    );
    assert!(uploader.node.engine().tasks().get_task(&file_hash).is_none());
    assert!(uploader
        .node
        .engine()
        .connections()
        .cached_keys()
        .iter()
        .all(|key| !key.starts_with(&file_hash)));
}

#[tokio::test]
async fn refused_reassignment_fails_the_upload() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let uploader = spawn_node(&transport, test_config("node-a", &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;
    let mut events = uploader.subscribe();

    let data = sample_file(800);
    let file_hash = uploader.node.engine().request_upload(upload_request(&data)).unwrap();
    let req = sp
        .expect(|m| match m {
            Message::ReqUploadFile(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    let mut plan = req.slices.clone();
    plan[0].pp_info = PpInfo {
        p2p_address: "ghost-p2p".into(),
        wallet_address: "wallet-ghost".into(),
        network_address: "ghost".into(),
    };
    sp.send(Message::RspUploadFile(RspUploadFile {
        task_id: "task-up-2".into(),
        file_hash: file_hash.clone(),
        file_size: 800,
        owner_wallet_address: "wallet-owner".into(),
        sp_p2p_address: "sp-p2p-1".into(),
        slices: plan,
        result: OpResult::success(),
        ..Default::default()
    }))
    .await;
    sp.expect(|m| matches!(m, Message::ReqUploadSlicesWrong(_)).then_some(()))
        .await;
    sp.send(Message::RspUploadSlicesWrong(RspUploadSlicesWrong {
        upload_type: UploadType::Upload,
        task_id: "task-up-2".into(),
        file_hash: file_hash.clone(),
        slices: Vec::new(),
        result: OpResult::failed("no storage left"),
    }))
    .await;

    let code = wait_for(&mut events, |event| match event {
        TransferEvent::Failed { file_hash: failed, code, .. } if *failed == file_hash => Some(code.clone()),
        _ => None,
    })
    .await;
    assert_eq!(code, ResultCode::FileRequestFailure.as_str());
    let engine = uploader.node.engine();
    assert!(engine.tasks().get_task(&file_hash).is_none());
    assert!(engine.buffer_stats().is_idle());
    assert!(engine
        .connections()
        .cached_keys()
        .iter()
        .all(|key| !key.starts_with(&file_hash)));
}

#[tokio::test]
async fn upload_requests_are_validated_before_anything_is_sent() {
    let transport = Arc::new(MemoryTransport::new());
    let node = spawn_node(&transport, test_config("node-a", &[]));
    let engine = node.node.engine();
    let data = sample_file(10);

    let mut req = upload_request(&data);
    req.wallet_address.clear();
    assert!(matches!(engine.request_upload(req), Err(NodeError::WrongWalletAddress(_))));

    let mut req = upload_request(&data);
    req.signature_hex = "not hex".into();
    assert!(matches!(engine.request_upload(req), Err(NodeError::SignatureFailure(_))));

    let mut req = upload_request(&data);
    req.declared_size = 11;
    let err = engine.request_upload(req).unwrap_err();
    assert!(matches!(err, NodeError::WrongFileSize { declared: 11, actual: 10 }));

    let mut req = upload_request(&data);
    req.file_name.clear();
    assert!(matches!(engine.request_upload(req), Err(NodeError::WrongInput(_))));

    let mut req = upload_request(&data);
    req.encrypt = true;
    assert!(matches!(engine.request_upload(req), Err(NodeError::WrongInput(_))));

    assert!(matches!(engine.request_upload(upload_request(&data)), Err(NodeError::NoSpConnection)));
}

async fn attached(transport: &Arc<MemoryTransport>, address: &str) -> (TestNode, FakeSp) {
    let mut sp_listener = transport.bind("sp-1");
    let node = spawn_node(transport, test_config(address, &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;
    (node, sp)
}

/// Three stored slices of a 2500-byte file, addressed to `target`.
fn backup_plan(data: &[u8], target: &PpInfo) -> Vec<SliceHashAddr> {
    data.chunks(1000)
        .enumerate()
        .map(|(idx, chunk)| {
            let start = idx as u64 * 1000;
            SliceHashAddr {
                slice_hash: slice_hash(chunk),
                slice_number: idx as u64 + 1,
                slice_size: chunk.len() as u64,
                slice_offset: SliceOffset::new(start, start + chunk.len() as u64),
                pp_info: target.clone(),
            }
        })
        .collect()
}

#[tokio::test]
async fn cancelled_upload_releases_every_buffer() {
    let transport = Arc::new(MemoryTransport::new());
    let _silent_peer = transport.bind("node-p");
    let (uploader, mut sp) = attached(&transport, "node-a").await;
    let mut events = uploader.subscribe();
    let engine = uploader.node.engine();

    let data = sample_file(1800);
    let file_hash = engine.request_upload(upload_request(&data)).unwrap();
    let req = sp
        .expect(|m| match m {
            Message::ReqUploadFile(req) => Some(req.clone()),
            _ => None,
        })
        .await;
    let silent = PpInfo {
        p2p_address: "silent-p2p".into(),
        wallet_address: "wallet-silent".into(),
        network_address: "node-p".into(),
    };
    let mut plan = req.slices.clone();
    for slice in &mut plan {
        slice.pp_info = silent.clone();
    }
    sp.send(Message::RspUploadFile(RspUploadFile {
        task_id: "task-up-3".into(),
        file_hash: file_hash.clone(),
        file_size: 1800,
        owner_wallet_address: "wallet-owner".into(),
        sp_p2p_address: "sp-p2p-1".into(),
        slices: plan,
        result: OpResult::success(),
        ..Default::default()
    }))
    .await;
    wait_until(|| {
        engine
            .tasks()
            .get_task(&file_hash)
            .map(|task| (1..=2).all(|n| task.slice_status(n) == Some(SliceStatus::InFlight)))
            .unwrap_or(false)
    })
    .await;
    assert!(!engine.connections().cached_keys().is_empty());

    assert!(engine.cancel_task(&file_hash));
    let code = wait_for(&mut events, |event| match event {
        TransferEvent::Failed { file_hash: failed, code, .. } if *failed == file_hash => Some(code.clone()),
        _ => None,
    })
    .await;
    assert_eq!(code, ResultCode::FileRequestFailure.as_str());
    assert!(engine.buffer_stats().is_idle());
    assert!(engine.connections().cached_keys().is_empty());
    assert!(!engine.cancel_task(&file_hash));
}

#[tokio::test]
async fn unanswered_upload_is_swept() {
    let transport = Arc::new(MemoryTransport::new());
    let (uploader, mut sp) = attached(&transport, "node-a").await;
    let mut events = uploader.subscribe();
    let engine = uploader.node.engine();

    let data = sample_file(500);
    let file_hash = engine.request_upload(upload_request(&data)).unwrap();
    sp.expect(|m| matches!(m, Message::ReqUploadFile(_)).then_some(())).await;
    assert_eq!(engine.buffer_stats().outgoing, 1);
    assert_eq!(engine.sweep_stale(Duration::from_secs(60)), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(engine.sweep_stale(Duration::ZERO), 1);
    let code = wait_for(&mut events, |event| match event {
        TransferEvent::Failed { file_hash: failed, code, .. } if *failed == file_hash => Some(code.clone()),
        _ => None,
    })
    .await;
    assert_eq!(code, ResultCode::Timeout.as_str());
    assert!(engine.buffer_stats().is_idle());
}

#[tokio::test]
async fn partial_slice_is_dropped_when_its_link_closes() {
    let transport = Arc::new(MemoryTransport::new());
    let holder = spawn_node(&transport, test_config("node-b", &[]));
    let engine = holder.node.engine();

    let wire = sample_file(600);
    let mut stream = transport.open("node-b").await.unwrap();
    let piece = ReqUploadFileSlice {
        upload_type: UploadType::Upload,
        task_id: "task-up-4".into(),
        file_hash: "file-4".into(),
        sp_p2p_address: "sp-p2p-1".into(),
        slice: SliceHashAddr {
            slice_hash: slice_hash(&wire),
            slice_number: 1,
            slice_size: 600,
            slice_offset: SliceOffset::new(0, 600),
            pp_info: holder.pp_info(),
        },
        piece_offset: SliceOffset::new(0, 300),
        data: wire[..300].to_vec(),
        wallet_address: "wallet-owner".into(),
        p2p_address: "sender-p2p".into(),
    };
    write_frame(&mut stream, &Envelope::new(1, Message::ReqUploadFileSlice(piece)))
        .await
        .unwrap();
    wait_until(|| engine.buffer_stats().incoming == 1 && engine.buffer_stats().routes == 1).await;

    drop(stream);
    wait_until(|| engine.buffer_stats().incoming == 0 && engine.buffer_stats().routes == 0).await;
    assert!(!holder.store.has_slice(&slice_hash(&wire)).unwrap());
}

#[tokio::test]
async fn backup_replicates_stored_slices() {
    let transport = Arc::new(MemoryTransport::new());
    let target = spawn_node(&transport, test_config("node-c", &[]));
    let (holder, mut sp) = attached(&transport, "node-b").await;
    let mut events = holder.subscribe();

    let data = sample_file(2500);
    let plan = backup_plan(&data, &target.pp_info());
    for (slice, chunk) in plan.iter().zip(data.chunks(1000)) {
        assert!(holder.store.save_slice(&slice.slice_hash, chunk).unwrap());
    }
    sp.send(Message::NoticeBackupFile(NoticeBackupFile {
        task_id: "task-bk-1".into(),
        file_hash: "file-bk-1".into(),
        file_size: 2500,
        sp_p2p_address: "sp-p2p-1".into(),
        slices: plan.clone(),
    }))
    .await;

    let kind = wait_for(&mut events, |event| match event {
        TransferEvent::Completed { file_hash, kind, .. } if file_hash == "file-bk-1" => Some(kind.clone()),
        _ => None,
    })
    .await;
    assert_eq!(kind, "backup");
    for (slice, chunk) in plan.iter().zip(data.chunks(1000)) {
        assert_eq!(target.store.get_slice(&slice.slice_hash).unwrap().unwrap(), chunk.to_vec());
    }

    let mut reported = Vec::new();
    while reported.len() < 3 {
        let report = sp
            .expect(|m| match m {
                Message::ReportUploadSliceResult(report) => Some(report.clone()),
                _ => None,
            })
            .await;
        assert_eq!(report.upload_type, UploadType::Backup);
        assert!(report.upload_success);
        assert!(!report.is_storage_side);
        assert_eq!(report.opponent_p2p_address, target.p2p);
        reported.push(report.slice.slice_number);
    }
    reported.sort_unstable();
    assert_eq!(reported, vec![1, 2, 3]);
    assert!(holder.node.engine().buffer_stats().is_idle());
}

#[tokio::test]
async fn backup_missing_a_slice_is_refused_once() {
    let transport = Arc::new(MemoryTransport::new());
    let target = spawn_node(&transport, test_config("node-c", &[]));
    let (holder, mut sp) = attached(&transport, "node-b").await;
    let mut events = holder.subscribe();

    let data = sample_file(2500);
    let plan = backup_plan(&data, &target.pp_info());
    for (slice, chunk) in plan.iter().zip(data.chunks(1000)) {
        if slice.slice_number != 2 {
            assert!(holder.store.save_slice(&slice.slice_hash, chunk).unwrap());
        }
    }
    sp.send(Message::NoticeBackupFile(NoticeBackupFile {
        task_id: "task-bk-2".into(),
        file_hash: "file-bk-2".into(),
        file_size: 2500,
        sp_p2p_address: "sp-p2p-1".into(),
        slices: plan,
    }))
    .await;

    let code = wait_for(&mut events, |event| match event {
        TransferEvent::Failed { file_hash, code, .. } if file_hash == "file-bk-2" => Some(code.clone()),
        _ => None,
    })
    .await;
    assert_eq!(code, ResultCode::InternalDataFailure.as_str());
    let report = sp
        .expect(|m| match m {
            Message::ReportUploadSliceResult(report) => Some(report.clone()),
            _ => None,
        })
        .await;
    assert_eq!(report.slice.slice_number, 2);
    assert!(!report.upload_success);
    assert_eq!(report.upload_type, UploadType::Backup);
    assert!(tokio::time::timeout(Duration::from_millis(300), sp.recv()).await.is_err());
    assert!(holder.node.engine().buffer_stats().is_idle());
    assert!(!target.store.has_slice(&slice_hash(&data[..1000])).unwrap());
}
