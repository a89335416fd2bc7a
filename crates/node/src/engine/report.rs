use sds_protocol::{DownloadSliceInfo, Message, PpInfo, ReportUploadSliceResult, ReqReportDownloadResult, SliceHashAddr, UploadType};
use tracing::debug;

use super::SliceProtocolEngine;
use crate::error::Result;

/// One side's view of a slice upload, reported to the indexing server for accounting.
pub(super) struct UploadReport<'a> {
    pub upload_type: UploadType,
    pub task_id: &'a str,
    pub file_hash: &'a str,
    pub sp_p2p_address: &'a str,
    pub slice: SliceHashAddr,
    pub success: bool,
    pub storage_side: bool,
    pub cost_time: i64,
    pub opponent_p2p_address: &'a str,
    pub beneficiary_address: &'a str,
}

/// One side's view of a slice download.
pub(super) struct DownloadReport<'a> {
    pub downloader_p2p_address: &'a str,
    pub downloader_wallet: &'a str,
    pub holder: &'a PpInfo,
    pub file_hash: &'a str,
    pub task_id: &'a str,
    pub sp_p2p_address: &'a str,
    pub cost_time: i64,
    pub found_locally: bool,
    pub storage_side: bool,
    pub slice_info: DownloadSliceInfo,
    pub opponent_p2p_address: &'a str,
}

impl SliceProtocolEngine {
    pub(super) fn report_upload_slice(&self, report: UploadReport<'_>) -> Result<()> {
        debug!(
            slice_hash = %report.slice.slice_hash,
            success = report.success,
            storage_side = report.storage_side,
            cost_ms = report.cost_time,
            "Reporting upload slice result"
        );
        self.send_to_sp(Message::ReportUploadSliceResult(ReportUploadSliceResult {
            upload_type: report.upload_type,
            task_id: report.task_id.to_string(),
            slice: report.slice,
            upload_success: report.success,
            is_storage_side: report.storage_side,
            file_hash: report.file_hash.to_string(),
            p2p_address: self.identity.p2p_address.clone(),
            wallet_address: self.identity.wallet_address.clone(),
            sp_p2p_address: report.sp_p2p_address.to_string(),
            cost_time: report.cost_time,
            opponent_p2p_address: report.opponent_p2p_address.to_string(),
            beneficiary_address: report.beneficiary_address.to_string(),
        }))
    }

    /// The beneficiary is always this node's; each side claims its own share.
    pub(super) fn report_download_slice(&self, report: DownloadReport<'_>) -> Result<()> {
        debug!(
            slice_hash = %report.slice_info.slice_storage_info.slice_hash,
            found_locally = report.found_locally,
            storage_side = report.storage_side,
            cost_ms = report.cost_time,
            "Reporting download slice result"
        );
        self.send_to_sp(Message::ReqReportDownloadResult(ReqReportDownloadResult {
            downloader_p2p_address: report.downloader_p2p_address.to_string(),
            wallet_address: report.downloader_wallet.to_string(),
            pp_p2p_address: report.holder.p2p_address.clone(),
            pp_wallet_address: report.holder.wallet_address.clone(),
            file_hash: report.file_hash.to_string(),
            task_id: report.task_id.to_string(),
            sp_p2p_address: report.sp_p2p_address.to_string(),
            cost_time: report.cost_time,
            beneficiary_address: self.identity.beneficiary_address.clone(),
            is_found_locally: report.found_locally,
            is_storage_side: report.storage_side,
            slice_info: report.slice_info,
            opponent_p2p_address: report.opponent_p2p_address.to_string(),
        }))
    }
}
