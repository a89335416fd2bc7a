mod common;

use common::{sample_file, sp_endpoint, spawn_node, test_config, FakeSp};
use sds_node::slice::slice_hash;
use sds_node::store::SliceStore;
use sds_node::transport::MemoryTransport;
use sds_protocol::{Message, NoticeFileSliceBackup, NoticeFileSliceVerify, SliceStorageInfo};
use std::sync::Arc;

#[tokio::test]
async fn slice_moves_to_new_holder_and_verifies() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let original = spawn_node(&transport, test_config("node-b", &[]));
    let new_holder = spawn_node(&transport, test_config("node-c", &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;

    let wire = sample_file(700);
    let hash = slice_hash(&wire);
    assert!(original.store.save_slice(&hash, &wire).unwrap());
    let storage = SliceStorageInfo {
        slice_hash: hash.clone(),
        slice_size: wire.len() as u64,
    };

    sp.send(Message::NoticeFileSliceBackup(NoticeFileSliceBackup {
        task_id: "mig-1".into(),
        file_hash: "file-m".into(),
        slice_storage_info: storage.clone(),
        slice_number: 1,
        pp_info: original.pp_info(),
        sp_p2p_address: "sp-p2p-1".into(),
    }))
    .await;
    let done = sp
        .expect(|m| match m {
            Message::RspTransferDownloadResult(done) => Some(done.clone()),
            _ => None,
        })
        .await;
    assert!(done.result.is_success());
    assert_eq!(done.task_id, "mig-1");
    assert_eq!(done.slice_hash, hash);
    assert_eq!(new_holder.store.get_slice(&hash).unwrap(), Some(wire.clone()));
    let engine = new_holder.node.engine();
    assert!(engine.connections().cached_keys().is_empty());
    assert_eq!(engine.buffer_stats().migrations, 0);

    sp.send(Message::NoticeFileSliceVerify(NoticeFileSliceVerify {
        task_id: "mig-1".into(),
        file_hash: "file-m".into(),
        slice_storage_info: storage,
        slice_number: 1,
        pp_info: original.pp_info(),
        sp_p2p_address: "sp-p2p-1".into(),
    }))
    .await;
    let verified = sp
        .expect(|m| match m {
            Message::RspVerifyDownloadResult(verified) => Some(verified.clone()),
            _ => None,
        })
        .await;
    assert!(verified.result.is_success());
    assert_eq!(verified.task_id, "mig-1");
    assert!(engine.connections().cached_keys().is_empty());
    assert!(engine.buffer_stats().is_idle());
}

#[tokio::test]
async fn transfer_from_a_holder_without_the_slice_is_reported_wrong() {
    let transport = Arc::new(MemoryTransport::new());
    let mut sp_listener = transport.bind("sp-1");
    let original = spawn_node(&transport, test_config("node-b", &[]));
    let new_holder = spawn_node(&transport, test_config("node-c", &[sp_endpoint(1)]));
    let mut sp = FakeSp::accept(&mut sp_listener).await;
    sp.expect(|m| matches!(m, Message::ReqRegister(_)).then_some(())).await;

    let hash = slice_hash(b"never stored");
    sp.send(Message::NoticeFileSliceBackup(NoticeFileSliceBackup {
        task_id: "mig-2".into(),
        file_hash: "file-m".into(),
        slice_storage_info: SliceStorageInfo {
            slice_hash: hash.clone(),
            slice_size: 12,
        },
        slice_number: 1,
        pp_info: original.pp_info(),
        sp_p2p_address: "sp-p2p-1".into(),
    }))
    .await;
    let wrong = sp
        .expect(|m| match m {
            Message::ReqTransferDownloadWrong(wrong) => Some(wrong.clone()),
            _ => None,
        })
        .await;
    assert_eq!(wrong.task_id, "mig-2");
    assert_eq!(wrong.original_pp, original.pp_info());
    assert_eq!(wrong.new_pp, new_holder.pp_info());
    assert!(!new_holder.store.has_slice(&hash).unwrap());
    assert!(new_holder.node.engine().connections().cached_keys().is_empty());
    assert_eq!(new_holder.node.engine().buffer_stats().migrations, 0);
}
