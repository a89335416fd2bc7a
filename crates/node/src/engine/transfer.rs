//! Slice migration between holders.
//!
//! A transfer moves a slice from its original holder to this node. A verify fetches a migrated
//! slice back from its new holder and checks it before the indexing server settles the
//! migration under the original task id.

use sds_protocol::{
    Message, NoticeFileSliceBackup, NoticeFileSliceVerify, OpResult, PpInfo, ReqTransferDownload,
    ReqTransferDownloadWrong, ReqVerifyDownload, RspTransferDownload, RspTransferDownloadResult, RspVerifyDownload,
    RspVerifyDownloadResult, SliceOffset, SliceStorageInfo,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::SliceProtocolEngine;
use crate::conn::Connection;
use crate::error::{NodeError, Result};
use crate::events::TransferEvent;
use crate::slice::{fragment_slice, slice_hash, SliceAssembler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MigrationKind {
    Transfer,
    Verify,
}

impl MigrationKind {
    fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Transfer => "transfer",
            MigrationKind::Verify => "verify",
        }
    }
}

#[derive(Debug)]
pub(super) struct Migration {
    kind: MigrationKind,
    task_id: String,
    file_hash: String,
    slice: SliceStorageInfo,
    sp_p2p_address: String,
    source: PpInfo,
    assembler: SliceAssembler,
    started: Instant,
}

/// One piece of a migrating slice as it arrives, whichever flow carries it.
struct MigrationPiece {
    task_id: String,
    slice_hash: String,
    offset: u64,
    slice_size: u64,
    data: Vec<u8>,
    result: OpResult,
}

fn migration_key(kind: MigrationKind, task_id: &str, slice_hash: &str) -> String {
    format!("{}:{task_id}:{slice_hash}", kind.as_str())
}

/// Prefix of the cached link a migration pulls its slice over.
fn migration_session(migration: &Migration) -> String {
    format!("{}@", migration_key(migration.kind, &migration.task_id, &migration.slice.slice_hash))
}

impl SliceProtocolEngine {
    /// This node is the new holder of a slice and pulls it from the original one.
    pub(super) async fn on_notice_file_slice_backup(self: &Arc<Self>, notice: NoticeFileSliceBackup) -> Result<()> {
        let migration = Migration {
            kind: MigrationKind::Transfer,
            task_id: notice.task_id.clone(),
            file_hash: notice.file_hash.clone(),
            slice: notice.slice_storage_info.clone(),
            sp_p2p_address: notice.sp_p2p_address.clone(),
            source: notice.pp_info.clone(),
            assembler: SliceAssembler::new(notice.slice_storage_info.slice_size),
            started: Instant::now(),
        };
        let message = Message::ReqTransferDownload(ReqTransferDownload {
            notice,
            new_pp: self.identity.pp_info(),
            p2p_address: self.identity.p2p_address.clone(),
        });
        self.start_migration(migration, message).await
    }

    /// Pulls a migrated slice from its new holder to check it.
    pub(super) async fn on_notice_file_slice_verify(self: &Arc<Self>, notice: NoticeFileSliceVerify) -> Result<()> {
        let migration = Migration {
            kind: MigrationKind::Verify,
            task_id: notice.task_id.clone(),
            file_hash: notice.file_hash.clone(),
            slice: notice.slice_storage_info.clone(),
            sp_p2p_address: notice.sp_p2p_address.clone(),
            source: notice.pp_info.clone(),
            assembler: SliceAssembler::new(notice.slice_storage_info.slice_size),
            started: Instant::now(),
        };
        let message = Message::ReqVerifyDownload(ReqVerifyDownload {
            new_pp: notice.pp_info.clone(),
            notice,
            p2p_address: self.identity.p2p_address.clone(),
        });
        self.start_migration(migration, message).await
    }

    async fn start_migration(self: &Arc<Self>, migration: Migration, request: Message) -> Result<()> {
        let key = migration_key(migration.kind, &migration.task_id, &migration.slice.slice_hash);
        let source = migration.source.clone();
        let session = migration_session(&migration);
        info!(
            kind = migration.kind.as_str(),
            task_id = %migration.task_id,
            slice_hash = %migration.slice.slice_hash,
            source = %source.p2p_address,
            "Slice migration started"
        );
        self.migrations.insert(key.clone(), migration);
        let sent = match self.peer_link(&session, &source).await {
            Ok(conn) => conn.send(request).map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            warn!(source = %source.p2p_address, error = %err, "Cannot reach migration source");
            if let Some((_, migration)) = self.migrations.remove(&key) {
                self.fail_migration(&migration, &err.to_string());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Original holder side of a transfer.
    pub(super) fn on_req_transfer_download(
        &self,
        conn: &Arc<dyn Connection>,
        req_id: u64,
        req: ReqTransferDownload,
    ) -> Result<()> {
        if self.forward_if_foreign(&req.notice.pp_info.p2p_address, || Message::ReqTransferDownload(req.clone())) {
            return Ok(());
        }
        self.learn_route(&req.p2p_address, conn);
        let notice = &req.notice;
        let template = RspTransferDownload {
            task_id: notice.task_id.clone(),
            sp_p2p_address: notice.sp_p2p_address.clone(),
            slice_hash: notice.slice_storage_info.slice_hash.clone(),
            p2p_address: req.new_pp.p2p_address.clone(),
            ..Default::default()
        };
        let pieces = self.migration_pieces(&notice.slice_storage_info.slice_hash);
        match pieces {
            Ok((slice_size, pieces)) => {
                for (offset, data) in pieces {
                    conn.reply(
                        req_id,
                        Message::RspTransferDownload(RspTransferDownload {
                            data,
                            offset,
                            slice_size,
                            result: OpResult::success(),
                            ..template.clone()
                        }),
                    )?;
                }
                debug!(slice_hash = %template.slice_hash, to = %req.new_pp.p2p_address, "Slice handed over");
                Ok(())
            }
            Err(err) => {
                conn.reply(
                    req_id,
                    Message::RspTransferDownload(RspTransferDownload {
                        result: OpResult::failed(err.to_string()),
                        ..template
                    }),
                )?;
                Err(err)
            }
        }
    }

    /// New holder side of a verify.
    pub(super) fn on_req_verify_download(
        &self,
        conn: &Arc<dyn Connection>,
        req_id: u64,
        req: ReqVerifyDownload,
    ) -> Result<()> {
        if self.forward_if_foreign(&req.notice.pp_info.p2p_address, || Message::ReqVerifyDownload(req.clone())) {
            return Ok(());
        }
        self.learn_route(&req.p2p_address, conn);
        let notice = &req.notice;
        let template = RspVerifyDownload {
            task_id: notice.task_id.clone(),
            sp_p2p_address: notice.sp_p2p_address.clone(),
            slice_hash: notice.slice_storage_info.slice_hash.clone(),
            p2p_address: req.p2p_address.clone(),
            slice_number: notice.slice_number,
            ..Default::default()
        };
        match self.migration_pieces(&notice.slice_storage_info.slice_hash) {
            Ok((slice_size, pieces)) => {
                for (offset, data) in pieces {
                    conn.reply(
                        req_id,
                        Message::RspVerifyDownload(RspVerifyDownload {
                            data,
                            offset,
                            slice_size,
                            result: OpResult::success(),
                            ..template.clone()
                        }),
                    )?;
                }
                Ok(())
            }
            Err(err) => {
                conn.reply(
                    req_id,
                    Message::RspVerifyDownload(RspVerifyDownload {
                        result: OpResult::failed(err.to_string()),
                        ..template
                    }),
                )?;
                Err(err)
            }
        }
    }

    /// Stored slice cut into frame-sized `(offset, bytes)` pieces.
    fn migration_pieces(&self, slice_hash: &str) -> Result<(u64, Vec<(u64, Vec<u8>)>)> {
        let wire = self
            .store
            .get_slice(slice_hash)?
            .ok_or_else(|| NodeError::InternalData(format!("slice {slice_hash} not stored here")))?;
        let len = wire.len() as u64;
        let pieces = fragment_slice(SliceOffset::new(0, len), len, self.settings.max_frame_payload, false)
            .into_iter()
            .map(|f| (f.wire.start, wire[f.wire.start as usize..f.wire.end as usize].to_vec()))
            .collect();
        Ok((len, pieces))
    }

    pub(super) fn on_rsp_transfer_download(&self, rsp: RspTransferDownload) -> Result<()> {
        if self.forward_if_foreign(&rsp.p2p_address, || Message::RspTransferDownload(rsp.clone())) {
            return Ok(());
        }
        self.accept_migration_piece(
            MigrationKind::Transfer,
            MigrationPiece {
                task_id: rsp.task_id,
                slice_hash: rsp.slice_hash,
                offset: rsp.offset,
                slice_size: rsp.slice_size,
                data: rsp.data,
                result: rsp.result,
            },
        )
    }

    pub(super) fn on_rsp_verify_download(&self, rsp: RspVerifyDownload) -> Result<()> {
        if self.forward_if_foreign(&rsp.p2p_address, || Message::RspVerifyDownload(rsp.clone())) {
            return Ok(());
        }
        self.accept_migration_piece(
            MigrationKind::Verify,
            MigrationPiece {
                task_id: rsp.task_id,
                slice_hash: rsp.slice_hash,
                offset: rsp.offset,
                slice_size: rsp.slice_size,
                data: rsp.data,
                result: rsp.result,
            },
        )
    }

    fn accept_migration_piece(&self, kind: MigrationKind, piece: MigrationPiece) -> Result<()> {
        let key = migration_key(kind, &piece.task_id, &piece.slice_hash);
        let complete = {
            let Some(mut migration) = self.migrations.get_mut(&key) else {
                debug!(key = %key, "Piece for an unknown migration");
                return Ok(());
            };
            if !piece.result.is_success() {
                Err(NodeError::FileRequest(piece.result.msg))
            } else if piece.slice_size != migration.assembler.expected_len() {
                Err(NodeError::WrongFileSize {
                    declared: migration.assembler.expected_len(),
                    actual: piece.slice_size,
                })
            } else {
                migration
                    .assembler
                    .insert(piece.offset, piece.data)
                    .map(|()| migration.assembler.is_complete())
            }
        };
        match complete {
            Ok(false) => Ok(()),
            Ok(true) => {
                let Some((_, migration)) = self.migrations.remove(&key) else {
                    return Ok(());
                };
                let settled = self.settle_migration(&migration);
                if let Err(err) = &settled {
                    self.fail_migration(&migration, &err.to_string());
                }
                settled
            }
            Err(err) => {
                if let Some((_, migration)) = self.migrations.remove(&key) {
                    self.fail_migration(&migration, &err.to_string());
                }
                Err(err)
            }
        }
    }

    fn settle_migration(&self, migration: &Migration) -> Result<()> {
        self.conns.evict_all_with_prefix(&migration_session(migration));
        let slice = &migration.slice;
        let data = migration.assembler.to_bytes()?;
        if slice_hash(&data) != slice.slice_hash {
            return Err(NodeError::InternalData(format!("slice {} failed its content check", slice.slice_hash)));
        }
        let elapsed_ms = migration.started.elapsed().as_millis() as u64;
        match migration.kind {
            MigrationKind::Transfer => {
                if !self.store.save_slice(&slice.slice_hash, &data)? {
                    return Err(NodeError::InternalData("slice store is full".into()));
                }
                self.send_to_sp(Message::RspTransferDownloadResult(RspTransferDownloadResult {
                    task_id: migration.task_id.clone(),
                    result: OpResult::success(),
                    sp_p2p_address: migration.sp_p2p_address.clone(),
                    slice_hash: slice.slice_hash.clone(),
                }))?;
                info!(task_id = %migration.task_id, slice_hash = %slice.slice_hash, elapsed_ms, "Slice migrated");
                self.events.publish(TransferEvent::SliceMigrated {
                    task_id: migration.task_id.clone(),
                    slice_hash: slice.slice_hash.clone(),
                    success: true,
                });
            }
            MigrationKind::Verify => {
                self.send_to_sp(Message::RspVerifyDownloadResult(RspVerifyDownloadResult {
                    task_id: migration.task_id.clone(),
                    result: OpResult::success(),
                    sp_p2p_address: migration.sp_p2p_address.clone(),
                    slice_hash: slice.slice_hash.clone(),
                }))?;
                info!(task_id = %migration.task_id, slice_hash = %slice.slice_hash, elapsed_ms, "Migrated slice verified");
                self.events.publish(TransferEvent::SliceVerified {
                    task_id: migration.task_id.clone(),
                    slice_hash: slice.slice_hash.clone(),
                    success: true,
                });
            }
        }
        Ok(())
    }

    fn fail_migration(&self, migration: &Migration, reason: &str) {
        self.conns.evict_all_with_prefix(&migration_session(migration));
        warn!(
            kind = migration.kind.as_str(),
            task_id = %migration.task_id,
            slice_hash = %migration.slice.slice_hash,
            reason,
            "Slice migration failed"
        );
        let sent = match migration.kind {
            MigrationKind::Transfer => {
                self.events.publish(TransferEvent::SliceMigrated {
                    task_id: migration.task_id.clone(),
                    slice_hash: migration.slice.slice_hash.clone(),
                    success: false,
                });
                self.send_to_sp(Message::ReqTransferDownloadWrong(ReqTransferDownloadWrong {
                    task_id: migration.task_id.clone(),
                    new_pp: self.identity.pp_info(),
                    original_pp: migration.source.clone(),
                    slice_storage_info: migration.slice.clone(),
                    file_hash: migration.file_hash.clone(),
                    sp_p2p_address: migration.sp_p2p_address.clone(),
                }))
            }
            MigrationKind::Verify => {
                self.events.publish(TransferEvent::SliceVerified {
                    task_id: migration.task_id.clone(),
                    slice_hash: migration.slice.slice_hash.clone(),
                    success: false,
                });
                self.send_to_sp(Message::RspVerifyDownloadResult(RspVerifyDownloadResult {
                    task_id: migration.task_id.clone(),
                    result: OpResult::failed(reason),
                    sp_p2p_address: migration.sp_p2p_address.clone(),
                    slice_hash: migration.slice.slice_hash.clone(),
                }))
            }
        };
        if let Err(err) = sent {
            warn!(task_id = %migration.task_id, error = %err, "Migration failure not reported");
        }
    }

    /// Fails migrations whose source stopped sending.
    pub(super) fn sweep_migrations(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .migrations
            .iter()
            .filter(|entry| entry.started.elapsed() > max_idle)
            .map(|entry| entry.key().clone())
            .collect();
        let mut dropped = 0;
        for key in stale {
            if let Some((_, migration)) = self.migrations.remove(&key) {
                self.fail_migration(&migration, "migration source went quiet");
                dropped += 1;
            }
        }
        dropped
    }
}
