use sds_protocol::{
    DownloadSliceInfo, FileIndexes, Message, OpResult, ReqDownloadFileWrong, ReqDownloadSlice, ReqFileStorageInfo,
    ReqGetShareFile, ResultCode, RspDownloadSlice, RspFileStorageInfo, SliceOffsetInfo, SliceStorageInfo,
    WalletSignature,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::report::DownloadReport;
use super::{now_secs, SliceProtocolEngine};
use crate::cipher::SliceCipher;
use crate::conn::Connection;
use crate::error::{NodeError, Result};
use crate::events::TransferEvent;
use crate::slice::{fragment_slice, slice_hash, SliceAssembler};
use crate::task::{task_key, SliceOutcome, SliceStatus, Task, TaskKind, TaskSlice, TaskSpec, TaskState};

const FILE_PATH_SCHEME: &str = "sdm://";

/// Credentials of a link-shared file.
#[derive(Debug, Clone, Default)]
pub struct ShareLink {
    pub keyword: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    /// `sdm://<owner wallet>/<file hash>`; may be empty for shared downloads.
    pub file_path: String,
    pub wallet_address: String,
    pub save_path: String,
    pub save_as: String,
    pub signature: WalletSignature,
    pub share: Option<ShareLink>,
    /// Generated when absent.
    pub req_id: Option<String>,
    /// Secret the owner uploaded under. Only encrypted files need it.
    pub encryption_secret: String,
}

/// Raw slices gathered so far for one download, plus the wire pieces still being assembled.
#[derive(Debug)]
pub(super) struct DownloadBuffer {
    rsp: RspFileStorageInfo,
    /// Present for encrypted files.
    cipher: Option<SliceCipher>,
    raw: BTreeMap<u64, Vec<u8>>,
    assemblers: HashMap<u64, SliceAssembler>,
    /// Slices whose holder asked for a report, sent once the slice checks out.
    report_due: HashMap<u64, DueReport>,
}

#[derive(Debug)]
struct DueReport {
    task_id: String,
    holder: String,
}

#[derive(Debug)]
pub(super) struct PendingSecret {
    secret: String,
    requested_at: Instant,
}

fn parse_file_path(path: &str) -> Result<(String, String)> {
    let rest = path
        .strip_prefix(FILE_PATH_SCHEME)
        .ok_or_else(|| NodeError::WrongInput(format!("file path {path:?} must start with {FILE_PATH_SCHEME}")))?;
    match rest.split_once('/') {
        Some((wallet, hash)) if !wallet.is_empty() && !hash.is_empty() && !hash.contains('/') => {
            Ok((wallet.to_string(), hash.to_string()))
        }
        _ => Err(NodeError::WrongInput(format!("file path {path:?} is not sdm://wallet/hash"))),
    }
}

fn download_slice_info(task_id: &str, slice: &TaskSlice) -> DownloadSliceInfo {
    DownloadSliceInfo {
        slice_storage_info: SliceStorageInfo {
            slice_hash: slice.slice_hash.clone(),
            slice_size: slice.slice_size,
        },
        slice_number: slice.slice_number,
        slice_offset: slice.offset,
        storage_pp_info: slice.peer.clone(),
        task_id: task_id.to_string(),
        visit_result: true,
    }
}

impl SliceProtocolEngine {
    /// Asks the indexing server where a file's slices live. Returns the request id.
    pub fn request_download(&self, req: DownloadRequest) -> Result<String> {
        if req.wallet_address.is_empty() {
            return Err(NodeError::WrongWalletAddress(req.wallet_address));
        }
        if req.share.is_none() {
            parse_file_path(&req.file_path)?;
        }
        let req_id = req
            .req_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
        let req_time = now_secs();
        let share_request = req.share.map(|share| ReqGetShareFile {
            keyword: share.keyword,
            share_password: share.password,
            save_as: req.save_as.clone(),
            p2p_address: self.identity.p2p_address.clone(),
            signature: req.signature.clone(),
            req_time,
        });
        if !req.encryption_secret.is_empty() {
            self.secrets.insert(
                req_id.clone(),
                PendingSecret {
                    secret: req.encryption_secret,
                    requested_at: Instant::now(),
                },
            );
        }
        let sent = self.send_to_sp(Message::ReqFileStorageInfo(ReqFileStorageInfo {
            file_indexes: FileIndexes {
                p2p_address: self.identity.p2p_address.clone(),
                wallet_address: req.wallet_address,
                file_path: req.file_path.clone(),
                save_path: req.save_path,
                save_as: req.save_as,
            },
            signature: req.signature,
            share_request,
            req_id: req_id.clone(),
            req_time,
        }));
        if let Err(err) = sent {
            self.secrets.remove(&req_id);
            return Err(err);
        }
        info!(req_id = %req_id, path = %req.file_path, "Download requested");
        Ok(req_id)
    }

    /// Slice locations for a download. A response for a live task carries reassigned slices.
    pub(super) async fn on_rsp_file_storage_info(self: &Arc<Self>, rsp: RspFileStorageInfo) -> Result<()> {
        if self.forward_if_foreign(&rsp.p2p_address, || Message::RspFileStorageInfo(rsp.clone())) {
            return Ok(());
        }
        let key = task_key(TaskKind::Download, &rsp.file_hash, &rsp.wallet_address);
        let secret = self.secrets.remove(&rsp.req_id).map(|(_, pending)| pending.secret);
        if !rsp.result.is_success() {
            self.events.publish(TransferEvent::failed(
                &key,
                &rsp.file_hash,
                ResultCode::FileRequestFailure,
                rsp.result.msg.clone(),
            ));
            return Err(NodeError::FileRequest(format!("storage info refused: {}", rsp.result.msg)));
        }
        self.store.save_remote_file_hash(&rsp.req_id, &rsp.file_hash)?;

        let (task, to_fetch) = match self.tasks.get_task(&key) {
            Some(task) => {
                let updates: Vec<TaskSlice> = rsp
                    .slices
                    .iter()
                    .map(TaskSlice::from)
                    .filter(|s| task.slice_status(s.slice_number) == Some(SliceStatus::Failed))
                    .collect();
                let applied = self.tasks.apply_reassignment(&key, &updates)?;
                if let Some(mut buffer) = self.downloads.get_mut(&key) {
                    for slice in &applied {
                        buffer.assemblers.remove(&slice.slice_number);
                        buffer.report_due.remove(&slice.slice_number);
                    }
                    buffer.rsp = rsp.clone();
                }
                info!(file_hash = %rsp.file_hash, reassigned = applied.len(), "Retrying reassigned download slices");
                (task, applied)
            }
            None => {
                let cipher = if rsp.encryption_tag.is_empty() {
                    None
                } else {
                    let Some(secret) = secret else {
                        let err = NodeError::WrongInput(format!(
                            "file {} is encrypted and the download carried no secret",
                            rsp.file_hash
                        ));
                        self.events
                            .publish(TransferEvent::failed(&key, &rsp.file_hash, err.code(), err.to_string()));
                        return Err(err);
                    };
                    Some(SliceCipher::for_file(&secret, &rsp.file_hash, &rsp.encryption_tag))
                };
                let spec = TaskSpec {
                    task_id: rsp.slices.first().map(|s| s.task_id.clone()).unwrap_or_default(),
                    file_hash: rsp.file_hash.clone(),
                    file_size: rsp.file_size,
                    owner_wallet: rsp.wallet_address.clone(),
                    sp_address: rsp.sp_p2p_address.clone(),
                    slices: rsp.slices.iter().map(TaskSlice::from).collect(),
                };
                let task = match self.tasks.create_task(TaskKind::Download, &key, spec) {
                    Ok(task) => task,
                    Err(err) => {
                        self.events
                            .publish(TransferEvent::failed(&key, &rsp.file_hash, err.code(), err.to_string()));
                        return Err(err);
                    }
                };
                self.downloads.insert(
                    key.clone(),
                    DownloadBuffer {
                        rsp: rsp.clone(),
                        cipher,
                        raw: BTreeMap::new(),
                        assemblers: HashMap::new(),
                        report_due: HashMap::new(),
                    },
                );
                let slices = task.slices();
                (task, slices)
            }
        };

        for slice in to_fetch {
            if task.state() == TaskState::Abandoned {
                break;
            }
            match self.store.get_slice(&slice.slice_hash) {
                Ok(Some(wire)) => self.serve_local_slice(&task, &slice, wire).await,
                Ok(None) => self.request_remote_slice(&task, &rsp, &slice).await,
                Err(err) => {
                    warn!(slice_hash = %slice.slice_hash, error = %err, "Local store lookup failed");
                    self.request_remote_slice(&task, &rsp, &slice).await;
                }
            }
        }
        Ok(())
    }

    /// A slice already in the local store costs no transfer but is still reported once.
    async fn serve_local_slice(self: &Arc<Self>, task: &Arc<Task>, slice: &TaskSlice, wire: Vec<u8>) {
        debug!(slice_hash = %slice.slice_hash, "Slice found locally");
        if let Err(err) = task.mark_in_flight(slice.slice_number) {
            warn!(error = %err, "Slice is not part of the download");
            return;
        }
        self.complete_download_slice(task, slice, wire, true).await;
    }

    async fn request_remote_slice(self: &Arc<Self>, task: &Arc<Task>, rsp: &RspFileStorageInfo, slice: &TaskSlice) {
        let conn = match self.peer_link(&task.file_hash, &slice.peer).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(peer = %slice.peer.p2p_address, error = %err, "Cannot reach slice holder");
                self.settle_download_slice(task, slice, SliceOutcome::Failed).await;
                return;
            }
        };
        if let Err(err) = task.mark_in_flight(slice.slice_number) {
            warn!(error = %err, "Slice is not part of the download");
            return;
        }
        let message = Message::ReqDownloadSlice(ReqDownloadSlice {
            rsp_file_storage_info: rsp.clone(),
            slice_number: slice.slice_number,
            p2p_address: self.identity.p2p_address.clone(),
        });
        if let Err(err) = conn.send(message) {
            warn!(peer = %slice.peer.p2p_address, error = %err, "Slice request not sent");
            self.settle_download_slice(task, slice, SliceOutcome::Failed).await;
        }
    }

    /// Storage side: streams a stored slice back in frame-sized fragments, then reports once.
    pub(super) fn on_req_download_slice(
        &self,
        conn: &Arc<dyn Connection>,
        req_id: u64,
        req: ReqDownloadSlice,
    ) -> Result<()> {
        let info = &req.rsp_file_storage_info;
        let slice = info
            .slices
            .iter()
            .find(|s| s.slice_number == req.slice_number)
            .cloned()
            .ok_or_else(|| NodeError::WrongInput(format!("request names unknown slice {}", req.slice_number)))?;
        if self.forward_if_foreign(&slice.storage_pp_info.p2p_address, || Message::ReqDownloadSlice(req.clone())) {
            return Ok(());
        }
        self.learn_route(&req.p2p_address, conn);
        let started = Instant::now();
        let slice_hash = &slice.slice_storage_info.slice_hash;
        let encrypted = !info.encryption_tag.is_empty();
        let base = RspDownloadSlice {
            file_hash: info.file_hash.clone(),
            p2p_address: info.p2p_address.clone(),
            wallet_address: info.wallet_address.clone(),
            task_id: slice.task_id.clone(),
            save_path: info.save_path.clone(),
            sp_p2p_address: info.sp_p2p_address.clone(),
            is_encrypted: encrypted,
            storage_p2p_address: self.identity.p2p_address.clone(),
            slice_number: slice.slice_number,
            ..Default::default()
        };

        let Some(wire) = self.store.get_slice(slice_hash)? else {
            conn.reply(
                req_id,
                Message::RspDownloadSlice(RspDownloadSlice {
                    slice_info: SliceOffsetInfo {
                        slice_hash: slice_hash.clone(),
                        slice_offset: slice.slice_offset,
                        ..Default::default()
                    },
                    result: OpResult::failed("slice not stored here"),
                    ..base
                }),
            )?;
            return Err(NodeError::InternalData(format!("slice {slice_hash} not stored here")));
        };

        let wire_len = wire.len() as u64;
        for fragment in fragment_slice(slice.slice_offset, wire_len, self.settings.max_frame_payload, encrypted) {
            conn.reply(
                req_id,
                Message::RspDownloadSlice(RspDownloadSlice {
                    slice_info: SliceOffsetInfo {
                        slice_hash: slice_hash.clone(),
                        slice_offset: fragment.raw,
                        encrypted_slice_offset: fragment.wire,
                    },
                    data: wire[fragment.wire.start as usize..fragment.wire.end as usize].to_vec(),
                    slice_size: wire_len,
                    need_report: fragment.last,
                    result: OpResult::success(),
                    ..base.clone()
                }),
            )?;
        }
        debug!(slice_hash = %slice_hash, bytes = wire_len, to = %info.p2p_address, "Slice served");

        let local = self.identity.pp_info();
        self.report_download_slice(DownloadReport {
            downloader_p2p_address: &info.p2p_address,
            downloader_wallet: &info.wallet_address,
            holder: &local,
            file_hash: &info.file_hash,
            task_id: &slice.task_id,
            sp_p2p_address: &info.sp_p2p_address,
            cost_time: started.elapsed().as_millis() as i64,
            found_locally: false,
            storage_side: true,
            slice_info: slice.clone(),
            opponent_p2p_address: &info.p2p_address,
        })
    }

    /// Downloader side: one fragment of a slice.
    pub(super) async fn on_rsp_download_slice(self: &Arc<Self>, mut rsp: RspDownloadSlice) -> Result<()> {
        if self.forward_if_foreign(&rsp.p2p_address, || Message::RspDownloadSlice(rsp.clone())) {
            return Ok(());
        }
        let key = task_key(TaskKind::Download, &rsp.file_hash, &rsp.wallet_address);
        let Some(task) = self.tasks.get_task(&key) else {
            debug!(file_hash = %rsp.file_hash, "Slice fragment for an unknown download");
            return Ok(());
        };
        let Some(slice) = task.slice(rsp.slice_number) else {
            return Err(NodeError::WrongInput(format!("download {key} has no slice {}", rsp.slice_number)));
        };
        if !rsp.result.is_success() {
            warn!(slice_hash = %slice.slice_hash, peer = %rsp.storage_p2p_address, msg = %rsp.result.msg, "Holder could not serve slice");
            self.settle_download_slice(&task, &slice, SliceOutcome::Failed).await;
            return Ok(());
        }

        let assembled = {
            let Some(mut buffer) = self.downloads.get_mut(&key) else {
                return Ok(());
            };
            if rsp.need_report {
                buffer.report_due.insert(
                    slice.slice_number,
                    DueReport {
                        task_id: rsp.task_id.clone(),
                        holder: rsp.storage_p2p_address.clone(),
                    },
                );
            }
            let assembler = buffer
                .assemblers
                .entry(slice.slice_number)
                .or_insert_with(|| SliceAssembler::new(rsp.slice_size));
            let inserted = assembler.insert(rsp.slice_info.encrypted_slice_offset.start, std::mem::take(&mut rsp.data));
            match inserted {
                Err(err) => {
                    buffer.assemblers.remove(&slice.slice_number);
                    Err(err)
                }
                Ok(()) if assembler.is_complete() => match buffer.assemblers.remove(&slice.slice_number) {
                    Some(done) => done.into_bytes().map(Some),
                    None => Ok(None),
                },
                Ok(()) => Ok(None),
            }
        };
        match assembled {
            Ok(Some(wire)) => self.complete_download_slice(&task, &slice, wire, false).await,
            Ok(None) => {}
            Err(err) => {
                warn!(slice_hash = %slice.slice_hash, error = %err, "Bad slice fragment");
                self.settle_download_slice(&task, &slice, SliceOutcome::Failed).await;
            }
        }
        Ok(())
    }

    /// Checks an assembled wire payload, files its raw bytes and reports the slice.
    ///
    /// A hash mismatch fails only the slice. A payload that matches its hash but does not decode
    /// fails the whole download.
    async fn complete_download_slice(
        self: &Arc<Self>,
        task: &Arc<Task>,
        slice: &TaskSlice,
        wire: Vec<u8>,
        found_locally: bool,
    ) {
        if slice_hash(&wire) != slice.slice_hash {
            warn!(slice_hash = %slice.slice_hash, peer = %slice.peer.p2p_address, "Downloaded slice failed its content check");
            self.settle_download_slice(task, slice, SliceOutcome::Failed).await;
            return;
        }
        let raw = match self.decode_slice(task, slice, wire) {
            Ok(raw) => raw,
            Err(err) => {
                self.fail_task(task, &err);
                return;
            }
        };
        let due = match self.downloads.get_mut(&task.key) {
            Some(mut buffer) => {
                buffer.raw.insert(slice.offset.start, raw);
                buffer.report_due.remove(&slice.slice_number)
            }
            None => return,
        };
        if found_locally {
            let task_id = task.task_id();
            self.report_slice_downloaded(task, slice, &task_id, &self.identity.p2p_address, true);
        } else if let Some(due) = due {
            self.report_slice_downloaded(task, slice, &due.task_id, &due.holder, false);
        }
        self.settle_download_slice(task, slice, SliceOutcome::Success).await;
    }

    fn decode_slice(&self, task: &Task, slice: &TaskSlice, wire: Vec<u8>) -> Result<Vec<u8>> {
        let cipher = self.downloads.get(&task.key).and_then(|buffer| buffer.cipher.clone());
        let raw = match cipher {
            Some(cipher) => cipher.decrypt(&wire).map_err(|err| {
                NodeError::WrongInput(format!("slice {} does not open under the file key: {err}", slice.slice_hash))
            })?,
            None => wire,
        };
        if raw.len() as u64 != slice.offset.len() {
            return Err(NodeError::InternalData(format!(
                "slice {} decodes to {} bytes, expected {}",
                slice.slice_hash,
                raw.len(),
                slice.offset.len()
            )));
        }
        Ok(raw)
    }

    /// Downloader-side report, sent at most once per slice visit.
    fn report_slice_downloaded(&self, task: &Task, slice: &TaskSlice, task_id: &str, opponent: &str, found_locally: bool) {
        let first_visit = self
            .tasks
            .get_slice_info(&task.key, &slice.slice_hash)
            .map(|lookup| lookup.first_visit)
            .unwrap_or(false);
        if !first_visit {
            return;
        }
        let local = self.identity.pp_info();
        let report = DownloadReport {
            downloader_p2p_address: &self.identity.p2p_address,
            downloader_wallet: &task.owner_wallet,
            holder: if found_locally { &local } else { &slice.peer },
            file_hash: &task.file_hash,
            task_id,
            sp_p2p_address: &task.sp_address,
            cost_time: if found_locally { 0 } else { task.elapsed_ms(slice.slice_number) },
            found_locally,
            storage_side: false,
            slice_info: download_slice_info(task_id, slice),
            opponent_p2p_address: opponent,
        };
        if let Err(err) = self.report_download_slice(report) {
            warn!(slice_hash = %slice.slice_hash, error = %err, "Download report not sent");
        }
    }

    async fn settle_download_slice(self: &Arc<Self>, task: &Arc<Task>, slice: &TaskSlice, outcome: SliceOutcome) {
        let state = match self
            .tasks
            .record_slice_result(&task.key, &slice.slice_hash, outcome, &slice.peer)
        {
            Ok(state) => state,
            Err(err) => {
                debug!(key = %task.key, error = %err, "Slice result for a finished download");
                return;
            }
        };
        self.events.publish(TransferEvent::SliceResult {
            task_key: task.key.clone(),
            file_hash: task.file_hash.clone(),
            slice_hash: slice.slice_hash.clone(),
            slice_number: slice.slice_number,
            success: outcome == SliceOutcome::Success,
            peer: slice.peer.p2p_address.clone(),
        });
        self.events.publish(TransferEvent::Progress {
            task_key: task.key.clone(),
            file_hash: task.file_hash.clone(),
            done_bytes: task.progress(),
            total_bytes: task.file_size,
        });
        match state {
            TaskState::Complete => self.finish_download(task),
            TaskState::PartiallyFailed => {
                if let Err(err) = self.report_download_wrong(task) {
                    warn!(file_hash = %task.file_hash, error = %err, "Cannot ask for download reassignment");
                    self.fail_task(task, &err);
                }
            }
            _ => {}
        }
    }

    fn finish_download(&self, task: &Task) {
        let buffer = self.downloads.remove(&task.key);
        self.tasks.remove(&task.key);
        self.conns.evict_all_with_prefix(&task.file_hash);
        let Some((_, buffer)) = buffer else {
            return;
        };
        let mut data = Vec::with_capacity(task.file_size as usize);
        for raw in buffer.raw.into_values() {
            data.extend_from_slice(&raw);
        }
        info!(file_hash = %task.file_hash, bytes = data.len(), "Download complete");
        self.events.publish(TransferEvent::Downloaded {
            req_id: buffer.rsp.req_id.clone(),
            file_hash: task.file_hash.clone(),
            file_name: buffer.rsp.file_name.clone(),
            save_path: buffer.rsp.save_path.clone(),
            data: Arc::new(data),
        });
        self.events.publish(TransferEvent::Completed {
            task_key: task.key.clone(),
            file_hash: task.file_hash.clone(),
            kind: task.kind.as_str().to_string(),
        });
    }

    fn report_download_wrong(&self, task: &Task) -> Result<()> {
        let wrong = self
            .tasks
            .build_wrong_slices_request(&task.key)
            .ok_or_else(|| NodeError::FileRequest(format!("no task under {}", task.key)))?;
        let (req_id, save_path, save_as) = self
            .downloads
            .get(&task.key)
            .map(|b| (b.rsp.req_id.clone(), b.rsp.save_path.clone(), b.rsp.file_name.clone()))
            .unwrap_or_default();
        info!(file_hash = %task.file_hash, failed = wrong.failed_slices.len(), "Asking for download reassignment");
        self.send_to_sp(Message::ReqDownloadFileWrong(ReqDownloadFileWrong {
            file_indexes: FileIndexes {
                p2p_address: self.identity.p2p_address.clone(),
                wallet_address: task.owner_wallet.clone(),
                file_path: format!("{FILE_PATH_SCHEME}{}/{}", task.owner_wallet, task.file_hash),
                save_path,
                save_as,
            },
            file_hash: task.file_hash.clone(),
            task_id: task.task_id(),
            req_id,
            failed_slices: wrong.failed_slices.into_iter().map(|s| s.slice_hash).collect(),
            failed_pp_nodes: wrong.excluded_peers,
        }))
    }

    /// Drops buffers whose task is gone and secrets whose storage info never came.
    pub(super) fn sweep_downloads(&self, max_idle: Duration) -> usize {
        let before = self.downloads.len() + self.secrets.len();
        self.downloads.retain(|key, _| self.tasks.get_task(key).is_some());
        self.secrets.retain(|_, pending| pending.requested_at.elapsed() <= max_idle);
        before.saturating_sub(self.downloads.len() + self.secrets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_path_splits_wallet_and_hash() {
        let (wallet, hash) = parse_file_path("sdm://st1owner/abc123").unwrap();
        assert_eq!(wallet, "st1owner");
        assert_eq!(hash, "abc123");
    }

    #[test]
    fn malformed_file_paths_are_wrong_input() {
        for path in ["", "st1owner/abc", "sdm://", "sdm://st1owner", "sdm:///abc", "sdm://a/b/c"] {
            let err = parse_file_path(path).unwrap_err();
            assert_eq!(err.code(), ResultCode::WrongInput, "{path}");
        }
    }
}
