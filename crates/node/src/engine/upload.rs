use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sds_protocol::{
    FileInfo, Message, NodeReceipt, NoticeBackupFile, OpResult, PpInfo, ReqUploadFile, ReqUploadFileSlice,
    ReqUploadSlicesWrong, ResultCode, RspUploadFile, RspUploadFileSlice, RspUploadSlicesWrong, SliceHashAddr,
    SliceOffset, UploadType, WalletSignature,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::report::UploadReport;
use super::{now_ms, now_secs, SliceProtocolEngine};
use crate::cipher::SliceCipher;
use crate::conn::{ConnId, Connection};
use crate::error::{NodeError, Result};
use crate::events::TransferEvent;
use crate::slice::{file_hash, fragment_slice, slice_hash, slice_offsets, SliceAssembler};
use crate::task::{task_key, SliceOutcome, Task, TaskKind, TaskSlice, TaskSpec, TaskState};

/// A file the gateway wants stored on the network.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub file_name: String,
    pub data: Vec<u8>,
    /// Size the client claims; must match `data`.
    pub declared_size: u64,
    pub wallet_address: String,
    pub wallet_pubkey_hex: String,
    pub signature_hex: String,
    pub desired_tier: u32,
    pub allow_higher_tier: bool,
    pub encrypt: bool,
    /// Secret the file key is derived from. Required when `encrypt` is set; downloads pass it back.
    pub encryption_secret: String,
    pub storage_path: String,
    pub duration: u64,
}

/// Wire payloads this node is pushing out for one file.
#[derive(Debug)]
pub(super) struct UploadSource {
    upload_type: UploadType,
    task_id: String,
    sp_p2p_address: String,
    owner_wallet: String,
    wire: BTreeMap<u64, Bytes>,
    created: Instant,
}

/// Pieces of one slice arriving at the storage side.
#[derive(Debug)]
pub(super) struct IncomingSlice {
    assembler: SliceAssembler,
    conn_id: ConnId,
    first_piece_at: Instant,
    last_piece_at: Instant,
}

const ENCRYPTION_TAG_LEN: usize = 8;

fn slice_addr(slice: &TaskSlice) -> SliceHashAddr {
    SliceHashAddr {
        slice_hash: slice.slice_hash.clone(),
        slice_number: slice.slice_number,
        slice_size: slice.slice_size,
        slice_offset: slice.offset,
        pp_info: slice.peer.clone(),
    }
}

impl SliceProtocolEngine {
    /// Validates and slices a file, then asks the indexing server where each slice goes.
    /// Returns the file hash the upload is tracked under.
    pub fn request_upload(&self, req: UploadRequest) -> Result<String> {
        if req.wallet_address.is_empty() {
            return Err(NodeError::WrongWalletAddress(req.wallet_address));
        }
        let signature = hex::decode(&req.signature_hex)
            .map_err(|err| NodeError::SignatureFailure(format!("signature is not hex: {err}")))?;
        let pubkey = hex::decode(&req.wallet_pubkey_hex)
            .map_err(|err| NodeError::SignatureFailure(format!("wallet public key is not hex: {err}")))?;
        if req.data.len() as u64 != req.declared_size {
            return Err(NodeError::WrongFileSize {
                declared: req.declared_size,
                actual: req.data.len() as u64,
            });
        }
        if req.file_name.is_empty() {
            return Err(NodeError::WrongInput("file name is empty".into()));
        }
        if req.encrypt && req.encryption_secret.is_empty() {
            return Err(NodeError::WrongInput("encrypted upload needs an owner secret".into()));
        }

        let file_hash = file_hash(&req.data);
        let encryption_tag: String = if req.encrypt {
            rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(ENCRYPTION_TAG_LEN)
                .map(char::from)
                .collect()
        } else {
            String::new()
        };
        let cipher = req
            .encrypt
            .then(|| SliceCipher::for_file(&req.encryption_secret, &file_hash, &encryption_tag));
        let mut wire = BTreeMap::new();
        let mut plan = Vec::new();
        for (idx, offset) in slice_offsets(req.data.len() as u64, self.settings.slice_size)
            .into_iter()
            .enumerate()
        {
            let raw = &req.data[offset.start as usize..offset.end as usize];
            let payload = match &cipher {
                Some(cipher) => cipher.encrypt(raw)?,
                None => raw.to_vec(),
            };
            let number = idx as u64 + 1;
            plan.push(SliceHashAddr {
                slice_hash: slice_hash(&payload),
                slice_number: number,
                slice_size: payload.len() as u64,
                slice_offset: offset,
                pp_info: PpInfo::default(),
            });
            wire.insert(number, Bytes::from(payload));
        }

        let message = Message::ReqUploadFile(ReqUploadFile {
            file_info: FileInfo {
                file_hash: file_hash.clone(),
                file_name: req.file_name.clone(),
                file_size: req.declared_size,
                storage_path: req.storage_path,
                encryption_tag,
                owner_wallet_address: req.wallet_address.clone(),
                duration: req.duration,
            },
            slices: plan,
            my_address: self.identity.pp_info(),
            signature: WalletSignature {
                address: req.wallet_address.clone(),
                pubkey,
                signature,
            },
            desired_tier: req.desired_tier,
            allow_higher_tier: req.allow_higher_tier,
            req_time: now_secs(),
        });
        self.outgoing.insert(
            file_hash.clone(),
            UploadSource {
                upload_type: UploadType::Upload,
                task_id: String::new(),
                sp_p2p_address: String::new(),
                owner_wallet: req.wallet_address,
                wire,
                created: Instant::now(),
            },
        );
        if let Err(err) = self.send_to_sp(message) {
            self.outgoing.remove(&file_hash);
            return Err(err);
        }
        info!(file_hash = %file_hash, name = %req.file_name, size = req.declared_size, "Upload requested");
        Ok(file_hash)
    }

    pub(super) async fn on_rsp_upload_file(self: &Arc<Self>, rsp: RspUploadFile) -> Result<()> {
        let key = task_key(TaskKind::Upload, &rsp.file_hash, &rsp.owner_wallet_address);
        if !rsp.result.is_success() {
            self.outgoing.remove(&rsp.file_hash);
            self.events.publish(TransferEvent::failed(
                &key,
                &rsp.file_hash,
                ResultCode::FileRequestFailure,
                rsp.result.msg.clone(),
            ));
            return Err(NodeError::FileRequest(format!("upload of {} refused: {}", rsp.file_hash, rsp.result.msg)));
        }
        match self.outgoing.get_mut(&rsp.file_hash) {
            Some(mut source) => {
                source.task_id = rsp.task_id.clone();
                source.sp_p2p_address = rsp.sp_p2p_address.clone();
            }
            None => {
                debug!(file_hash = %rsp.file_hash, "Upload answer for a file we are not uploading");
                return Ok(());
            }
        }
        let spec = TaskSpec {
            task_id: rsp.task_id.clone(),
            file_hash: rsp.file_hash.clone(),
            file_size: rsp.file_size,
            owner_wallet: rsp.owner_wallet_address.clone(),
            sp_address: rsp.sp_p2p_address.clone(),
            slices: rsp.slices.iter().map(TaskSlice::from).collect(),
        };
        let task = match self.tasks.create_task(TaskKind::Upload, &key, spec) {
            Ok(task) => task,
            Err(err) => {
                self.outgoing.remove(&rsp.file_hash);
                self.events
                    .publish(TransferEvent::failed(&key, &rsp.file_hash, err.code(), err.to_string()));
                return Err(err);
            }
        };
        self.events.publish(TransferEvent::UploadAccepted {
            file_hash: rsp.file_hash.clone(),
            task_id: rsp.task_id.clone(),
            slices: rsp.slices.len(),
        });
        for slice in task.slices() {
            self.send_slice(&task, &slice).await;
        }
        Ok(())
    }

    /// Replicates slices this node holds onto the peers the indexing server picked.
    ///
    /// A backup this node cannot fully supply is refused up front: each missing slice is reported
    /// once as failed and nothing is sent.
    pub(super) async fn on_notice_backup_file(self: &Arc<Self>, notice: NoticeBackupFile) -> Result<()> {
        let key = task_key(TaskKind::Backup, &notice.file_hash, "");
        let mut wire = BTreeMap::new();
        let mut missing = Vec::new();
        for slice in &notice.slices {
            match self.store.get_slice(&slice.slice_hash)? {
                Some(data) => {
                    wire.insert(slice.slice_number, Bytes::from(data));
                }
                None => missing.push(slice.clone()),
            }
        }
        if !missing.is_empty() {
            for slice in &missing {
                self.report_missing_payload(
                    UploadType::Backup,
                    &notice.task_id,
                    &notice.file_hash,
                    &notice.sp_p2p_address,
                    slice.clone(),
                );
            }
            let err = NodeError::InternalData(format!(
                "{} of {} backup slices are not stored here",
                missing.len(),
                notice.slices.len()
            ));
            self.events
                .publish(TransferEvent::failed(&key, &notice.file_hash, err.code(), err.to_string()));
            return Err(err);
        }
        let spec = TaskSpec {
            task_id: notice.task_id.clone(),
            file_hash: notice.file_hash.clone(),
            file_size: notice.file_size,
            owner_wallet: String::new(),
            sp_address: notice.sp_p2p_address.clone(),
            slices: notice.slices.iter().map(TaskSlice::from).collect(),
        };
        let task = self.tasks.create_task(TaskKind::Backup, &key, spec)?;
        self.outgoing.insert(
            notice.file_hash.clone(),
            UploadSource {
                upload_type: UploadType::Backup,
                task_id: notice.task_id.clone(),
                sp_p2p_address: notice.sp_p2p_address.clone(),
                owner_wallet: String::new(),
                wire,
                created: Instant::now(),
            },
        );
        info!(file_hash = %notice.file_hash, task_id = %notice.task_id, slices = notice.slices.len(), "Backup started");
        for slice in task.slices() {
            self.send_slice(&task, &slice).await;
        }
        Ok(())
    }

    /// Pushes one slice to its assigned peer in frame-sized pieces.
    async fn send_slice(self: &Arc<Self>, task: &Arc<Task>, slice: &TaskSlice) {
        if task.state() == TaskState::Abandoned {
            return;
        }
        let prepared = self.outgoing.get(&task.file_hash).map(|source| {
            (
                source.upload_type,
                source.task_id.clone(),
                source.sp_p2p_address.clone(),
                source.owner_wallet.clone(),
                source.wire.get(&slice.slice_number).cloned(),
            )
        });
        let Some((upload_type, task_id, sp_p2p_address, owner_wallet, wire)) = prepared else {
            let err = NodeError::InternalData(format!("no upload source for {}", task.file_hash));
            self.fail_task(task, &err);
            return;
        };
        let Some(wire) = wire else {
            self.report_missing_payload(upload_type, &task_id, &task.file_hash, &sp_p2p_address, slice_addr(slice));
            let err = NodeError::InternalData(format!("slice {} is not stored here", slice.slice_hash));
            self.fail_task(task, &err);
            return;
        };

        let conn = match self.peer_link(&task.file_hash, &slice.peer).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(peer = %slice.peer.p2p_address, error = %err, "Cannot reach storage peer");
                self.settle_upload_slice(task, slice, SliceOutcome::Failed, &slice.peer).await;
                return;
            }
        };
        if let Err(err) = task.mark_in_flight(slice.slice_number) {
            warn!(error = %err, "Slice is not part of the task");
            return;
        }
        let whole = SliceOffset::new(0, wire.len() as u64);
        for fragment in fragment_slice(whole, wire.len() as u64, self.settings.max_frame_payload, false) {
            let piece = wire.slice(fragment.wire.start as usize..fragment.wire.end as usize).to_vec();
            let message = Message::ReqUploadFileSlice(ReqUploadFileSlice {
                upload_type,
                task_id: task_id.clone(),
                file_hash: task.file_hash.clone(),
                sp_p2p_address: sp_p2p_address.clone(),
                slice: slice_addr(slice),
                piece_offset: fragment.wire,
                data: piece,
                wallet_address: owner_wallet.clone(),
                p2p_address: self.identity.p2p_address.clone(),
            });
            if let Err(err) = conn.send(message) {
                warn!(peer = %slice.peer.p2p_address, error = %err, "Slice piece send failed");
                self.settle_upload_slice(task, slice, SliceOutcome::Failed, &slice.peer).await;
                return;
            }
        }
        debug!(file_hash = %task.file_hash, slice = slice.slice_number, peer = %slice.peer.p2p_address, "Slice sent");
    }

    /// Reports a slice this node was asked to send but does not hold. Never retried.
    fn report_missing_payload(
        &self,
        upload_type: UploadType,
        task_id: &str,
        file_hash: &str,
        sp_p2p_address: &str,
        slice: SliceHashAddr,
    ) {
        warn!(file_hash = %file_hash, slice = slice.slice_number, "No local payload for slice");
        let opponent = slice.pp_info.p2p_address.clone();
        let report = UploadReport {
            upload_type,
            task_id,
            file_hash,
            sp_p2p_address,
            slice,
            success: false,
            storage_side: false,
            cost_time: 0,
            opponent_p2p_address: &opponent,
            beneficiary_address: &self.identity.beneficiary_address,
        };
        if let Err(err) = self.report_upload_slice(report) {
            warn!(file_hash = %file_hash, error = %err, "Upload report not sent");
        }
    }

    /// Storage side: gathers pieces, checks the content address, stores and acknowledges.
    pub(super) fn on_req_upload_file_slice(
        &self,
        conn: &Arc<dyn Connection>,
        req_id: u64,
        mut req: ReqUploadFileSlice,
    ) -> Result<()> {
        if self.forward_if_foreign(&req.slice.pp_info.p2p_address, || Message::ReqUploadFileSlice(req.clone())) {
            return Ok(());
        }
        self.learn_route(&req.p2p_address, conn);

        let key = format!("{}:{}", req.task_id, req.slice.slice_hash);
        let complete = {
            let now = Instant::now();
            let mut entry = self.incoming.entry(key.clone()).or_insert_with(|| IncomingSlice {
                assembler: SliceAssembler::new(req.slice.slice_size),
                conn_id: conn.id(),
                first_piece_at: now,
                last_piece_at: now,
            });
            entry.last_piece_at = now;
            if let Err(err) = entry.assembler.insert(req.piece_offset.start, std::mem::take(&mut req.data)) {
                drop(entry);
                self.incoming.remove(&key);
                return self.reject_upload_slice(conn, req_id, &req, err);
            }
            entry.assembler.is_complete()
        };
        if !complete {
            return Ok(());
        }
        let Some((_, incoming)) = self.incoming.remove(&key) else {
            return Ok(());
        };
        let cost_time = incoming.first_piece_at.elapsed().as_millis() as i64;
        let data = incoming.assembler.into_bytes()?;
        if slice_hash(&data) != req.slice.slice_hash {
            let err = NodeError::InternalData(format!("slice {} failed its content check", req.slice.slice_hash));
            return self.reject_upload_slice(conn, req_id, &req, err);
        }
        if !self.store.save_slice(&req.slice.slice_hash, &data)? {
            let err = NodeError::InternalData("slice store is full".into());
            return self.reject_upload_slice(conn, req_id, &req, err);
        }

        let timestamp_ms = now_ms();
        let len = data.len() as u64;
        let signature = self
            .identity
            .sign(&NodeReceipt::store_payload(&req.slice.slice_hash, len, timestamp_ms))?;
        conn.reply(
            req_id,
            Message::RspUploadFileSlice(RspUploadFileSlice {
                upload_type: req.upload_type,
                task_id: req.task_id.clone(),
                file_hash: req.file_hash.clone(),
                slice_hash: req.slice.slice_hash.clone(),
                slice_number: req.slice.slice_number,
                slice_size: len,
                p2p_address: self.identity.p2p_address.clone(),
                wallet_address: self.identity.wallet_address.clone(),
                sp_p2p_address: req.sp_p2p_address.clone(),
                beneficiary_address: self.identity.beneficiary_address.clone(),
                receipt: NodeReceipt {
                    timestamp_ms,
                    signature,
                    public_key: self.identity.public_key(),
                },
                result: OpResult::success(),
            }),
        )?;
        info!(slice_hash = %req.slice.slice_hash, bytes = len, from = %req.p2p_address, "Slice stored");
        self.report_upload_slice(UploadReport {
            upload_type: req.upload_type,
            task_id: &req.task_id,
            file_hash: &req.file_hash,
            sp_p2p_address: &req.sp_p2p_address,
            slice: req.slice.clone(),
            success: true,
            storage_side: true,
            cost_time,
            opponent_p2p_address: &req.p2p_address,
            beneficiary_address: &self.identity.beneficiary_address,
        })
    }

    fn reject_upload_slice(
        &self,
        conn: &Arc<dyn Connection>,
        req_id: u64,
        req: &ReqUploadFileSlice,
        err: NodeError,
    ) -> Result<()> {
        warn!(slice_hash = %req.slice.slice_hash, error = %err, "Rejecting slice");
        conn.reply(
            req_id,
            Message::RspUploadFileSlice(RspUploadFileSlice {
                upload_type: req.upload_type,
                task_id: req.task_id.clone(),
                file_hash: req.file_hash.clone(),
                slice_hash: req.slice.slice_hash.clone(),
                slice_number: req.slice.slice_number,
                slice_size: req.slice.slice_size,
                p2p_address: self.identity.p2p_address.clone(),
                wallet_address: self.identity.wallet_address.clone(),
                sp_p2p_address: req.sp_p2p_address.clone(),
                result: OpResult::failed(err.to_string()),
                ..Default::default()
            }),
        )
    }

    /// Uploader side: a peer acknowledged (or refused) a slice.
    pub(super) async fn on_rsp_upload_file_slice(self: &Arc<Self>, rsp: RspUploadFileSlice) -> Result<()> {
        let key = task_key(TaskKind::Upload, &rsp.file_hash, "");
        let Some(task) = self.tasks.get_task(&key) else {
            debug!(file_hash = %rsp.file_hash, "Slice acknowledgement for an unknown task");
            return Ok(());
        };
        let Some(slice) = task
            .slices()
            .into_iter()
            .find(|s| s.slice_hash == rsp.slice_hash && s.slice_number == rsp.slice_number)
        else {
            return Err(NodeError::WrongInput(format!("slice {} is not in task {key}", rsp.slice_hash)));
        };
        let receipt = &rsp.receipt;
        let accepted = rsp.result.is_success()
            && receipt.verify_store(&rsp.slice_hash, rsp.slice_size)
            && receipt.is_fresh(now_ms(), self.settings.receipt_max_age.as_millis() as u64)
            && receipt.signer().as_deref() == Some(rsp.p2p_address.as_str());
        if rsp.result.is_success() && !accepted {
            warn!(slice_hash = %rsp.slice_hash, peer = %rsp.p2p_address, "Storage receipt did not verify");
        }
        let outcome = if accepted { SliceOutcome::Success } else { SliceOutcome::Failed };
        let cost_time = task.elapsed_ms(slice.slice_number);
        let peer = PpInfo {
            p2p_address: rsp.p2p_address.clone(),
            wallet_address: rsp.wallet_address.clone(),
            network_address: slice.peer.network_address.clone(),
        };
        self.report_upload_slice(UploadReport {
            upload_type: rsp.upload_type,
            task_id: &rsp.task_id,
            file_hash: &rsp.file_hash,
            sp_p2p_address: &task.sp_address,
            slice: slice_addr(&slice),
            success: accepted,
            storage_side: false,
            cost_time,
            opponent_p2p_address: &rsp.p2p_address,
            beneficiary_address: &rsp.beneficiary_address,
        })
        .unwrap_or_else(|err| warn!(error = %err, "Upload report not sent"));
        self.settle_upload_slice(&task, &slice, outcome, &peer).await;
        Ok(())
    }

    /// Records a slice outcome and moves the task along its state machine.
    async fn settle_upload_slice(self: &Arc<Self>, task: &Arc<Task>, slice: &TaskSlice, outcome: SliceOutcome, peer: &PpInfo) {
        let state = match self
            .tasks
            .record_slice_result(&task.key, &slice.slice_hash, outcome, peer)
        {
            Ok(state) => state,
            Err(err) => {
                debug!(key = %task.key, error = %err, "Slice result for a finished task");
                return;
            }
        };
        self.events.publish(TransferEvent::SliceResult {
            task_key: task.key.clone(),
            file_hash: task.file_hash.clone(),
            slice_hash: slice.slice_hash.clone(),
            slice_number: slice.slice_number,
            success: outcome == SliceOutcome::Success,
            peer: peer.p2p_address.clone(),
        });
        self.events.publish(TransferEvent::Progress {
            task_key: task.key.clone(),
            file_hash: task.file_hash.clone(),
            done_bytes: task.progress(),
            total_bytes: task.file_size,
        });
        match state {
            TaskState::Complete => {
                self.tasks.remove(&task.key);
                self.outgoing.remove(&task.file_hash);
                self.conns.evict_all_with_prefix(&task.file_hash);
                info!(file_hash = %task.file_hash, kind = task.kind.as_str(), "Transfer complete");
                self.events.publish(TransferEvent::Completed {
                    task_key: task.key.clone(),
                    file_hash: task.file_hash.clone(),
                    kind: task.kind.as_str().to_string(),
                });
            }
            TaskState::PartiallyFailed => {
                if let Err(err) = self.request_slice_reassignment(task) {
                    warn!(file_hash = %task.file_hash, error = %err, "Cannot ask for slice reassignment");
                    self.fail_task(task, &err);
                }
            }
            _ => {}
        }
    }

    fn request_slice_reassignment(&self, task: &Task) -> Result<()> {
        let wrong = self
            .tasks
            .build_wrong_slices_request(&task.key)
            .ok_or_else(|| NodeError::FileRequest(format!("no task under {}", task.key)))?;
        let upload_type = if task.kind == TaskKind::Backup {
            UploadType::Backup
        } else {
            UploadType::Upload
        };
        info!(
            file_hash = %task.file_hash,
            failed = wrong.failed_slices.len(),
            excluded = wrong.excluded_peers.len(),
            "Asking for slice reassignment"
        );
        self.send_to_sp(Message::ReqUploadSlicesWrong(ReqUploadSlicesWrong {
            upload_type,
            task_id: task.task_id(),
            file_hash: task.file_hash.clone(),
            my_address: self.identity.pp_info(),
            sp_p2p_address: task.sp_address.clone(),
            excluded_destinations: wrong.excluded_peers,
            slices: wrong.failed_slices.iter().map(slice_addr).collect(),
        }))
    }

    pub(super) async fn on_rsp_upload_slices_wrong(self: &Arc<Self>, rsp: RspUploadSlicesWrong) -> Result<()> {
        let key = task_key(TaskKind::Upload, &rsp.file_hash, "");
        let Some(task) = self.tasks.get_task(&key) else {
            return Ok(());
        };
        if !rsp.result.is_success() {
            let err = NodeError::FileRequest(format!("reassignment refused: {}", rsp.result.msg));
            self.fail_task(&task, &err);
            return Err(err);
        }
        let updates: Vec<TaskSlice> = rsp.slices.iter().map(TaskSlice::from).collect();
        let applied = self.tasks.apply_reassignment(&key, &updates)?;
        info!(file_hash = %rsp.file_hash, reassigned = applied.len(), "Retrying reassigned slices");
        for slice in applied {
            self.send_slice(&task, &slice).await;
        }
        Ok(())
    }

    /// Drops sources the indexing server never answered and slices whose pieces stopped coming.
    pub(super) fn sweep_uploads(&self, max_idle: Duration) -> usize {
        let orphaned: Vec<String> = self
            .outgoing
            .iter()
            .filter(|entry| entry.created.elapsed() > max_idle && self.tasks.get_task(entry.key()).is_none())
            .map(|entry| entry.key().clone())
            .collect();
        let mut dropped = 0;
        for file_hash in orphaned {
            if self.outgoing.remove(&file_hash).is_some() {
                warn!(file_hash = %file_hash, "Upload never answered, dropping its payloads");
                self.events.publish(TransferEvent::failed(
                    &file_hash,
                    &file_hash,
                    ResultCode::Timeout,
                    "no answer from the indexing server",
                ));
                dropped += 1;
            }
        }
        let before = self.incoming.len();
        self.incoming.retain(|_, slice| slice.last_piece_at.elapsed() <= max_idle);
        dropped + before.saturating_sub(self.incoming.len())
    }

    pub(super) fn drop_incoming_from(&self, conn_id: ConnId) -> usize {
        let before = self.incoming.len();
        self.incoming.retain(|_, slice| slice.conn_id != conn_id);
        before.saturating_sub(self.incoming.len())
    }
}
