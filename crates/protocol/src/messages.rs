use serde::{Deserialize, Serialize};

/// Identity of a resource node as the indexing tier knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PpInfo {
    pub p2p_address: String,
    pub wallet_address: String,
    pub network_address: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceOffset {
    pub start: u64,
    pub end: u64,
}

impl SliceOffset {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultState {
    #[default]
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub state: ResultState,
    pub msg: String,
}

impl OpResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            state: ResultState::Failed,
            msg: msg.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ResultState::Success
    }
}

/// Wallet signature authorising a request. Verification belongs to the indexing tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSignature {
    pub address: String,
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub storage_path: String,
    pub encryption_tag: String,
    pub owner_wallet_address: String,
    pub duration: u64,
}

/// One entry of a slice plan: which slice, where it lives in the file, and the peer assigned to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceHashAddr {
    pub slice_hash: String,
    pub slice_number: u64,
    pub slice_size: u64,
    pub slice_offset: SliceOffset,
    pub pp_info: PpInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadType {
    #[default]
    Upload,
    Backup,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub p2p_address: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqRegister {
    pub address: PpInfo,
    pub public_key: Vec<u8>,
    pub req_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspRegister {
    pub p2p_address: String,
    pub sp_p2p_address: String,
    pub is_pp: bool,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqUploadFile {
    pub file_info: FileInfo,
    pub slices: Vec<SliceHashAddr>,
    pub my_address: PpInfo,
    pub signature: WalletSignature,
    pub desired_tier: u32,
    pub allow_higher_tier: bool,
    pub req_time: i64,
}

/// Indexing server's answer to an upload request: the task id and the peer assigned to every slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspUploadFile {
    pub task_id: String,
    pub file_hash: String,
    pub file_size: u64,
    pub owner_wallet_address: String,
    pub sp_p2p_address: String,
    pub storage_tier: u32,
    pub is_encrypted: bool,
    pub slices: Vec<SliceHashAddr>,
    pub result: OpResult,
}

/// Indexing server asks this node to replicate slices it holds onto new peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeBackupFile {
    pub task_id: String,
    pub file_hash: String,
    pub file_size: u64,
    pub sp_p2p_address: String,
    pub slices: Vec<SliceHashAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqUploadFileSlice {
    pub upload_type: UploadType,
    pub task_id: String,
    pub file_hash: String,
    pub sp_p2p_address: String,
    pub slice: SliceHashAddr,
    /// Byte range of `data` within the slice's wire payload.
    pub piece_offset: SliceOffset,
    pub data: Vec<u8>,
    pub wallet_address: String,
    pub p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspUploadFileSlice {
    pub upload_type: UploadType,
    pub task_id: String,
    pub file_hash: String,
    pub slice_hash: String,
    pub slice_number: u64,
    pub slice_size: u64,
    pub p2p_address: String,
    pub wallet_address: String,
    pub sp_p2p_address: String,
    pub beneficiary_address: String,
    pub receipt: NodeReceipt,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqUploadSlicesWrong {
    pub upload_type: UploadType,
    pub task_id: String,
    pub file_hash: String,
    pub my_address: PpInfo,
    pub sp_p2p_address: String,
    pub excluded_destinations: Vec<PpInfo>,
    pub slices: Vec<SliceHashAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspUploadSlicesWrong {
    pub upload_type: UploadType,
    pub task_id: String,
    pub file_hash: String,
    pub slices: Vec<SliceHashAddr>,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportUploadSliceResult {
    pub upload_type: UploadType,
    pub task_id: String,
    pub slice: SliceHashAddr,
    pub upload_success: bool,
    /// True when sent by the peer that stored the slice rather than the one that sent it.
    pub is_storage_side: bool,
    pub file_hash: String,
    pub p2p_address: String,
    pub wallet_address: String,
    pub sp_p2p_address: String,
    pub cost_time: i64,
    pub opponent_p2p_address: String,
    pub beneficiary_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexes {
    pub p2p_address: String,
    pub wallet_address: String,
    pub file_path: String,
    pub save_path: String,
    pub save_as: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqGetShareFile {
    pub keyword: String,
    pub share_password: String,
    pub save_as: String,
    pub p2p_address: String,
    pub signature: WalletSignature,
    pub req_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqFileStorageInfo {
    pub file_indexes: FileIndexes,
    pub signature: WalletSignature,
    pub share_request: Option<ReqGetShareFile>,
    pub req_id: String,
    pub req_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceStorageInfo {
    pub slice_hash: String,
    pub slice_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSliceInfo {
    pub slice_storage_info: SliceStorageInfo,
    pub slice_number: u64,
    /// Raw (pre-encryption) range of the slice within the file.
    pub slice_offset: SliceOffset,
    pub storage_pp_info: PpInfo,
    pub task_id: String,
    pub visit_result: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspFileStorageInfo {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub wallet_address: String,
    /// Downloader's P2P address.
    pub p2p_address: String,
    pub sp_p2p_address: String,
    pub save_path: String,
    pub encryption_tag: String,
    pub req_id: String,
    pub slices: Vec<DownloadSliceInfo>,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqDownloadSlice {
    pub rsp_file_storage_info: RspFileStorageInfo,
    pub slice_number: u64,
    pub p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOffsetInfo {
    pub slice_hash: String,
    /// Raw coordinates, relative to the start of the file.
    pub slice_offset: SliceOffset,
    /// Wire coordinates, relative to the start of the slice's wire payload.
    pub encrypted_slice_offset: SliceOffset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspDownloadSlice {
    pub slice_info: SliceOffsetInfo,
    pub file_hash: String,
    pub data: Vec<u8>,
    /// Downloader's P2P address.
    pub p2p_address: String,
    pub wallet_address: String,
    pub task_id: String,
    /// Length of the slice's wire payload.
    pub slice_size: u64,
    pub result: OpResult,
    pub need_report: bool,
    pub save_path: String,
    pub sp_p2p_address: String,
    pub is_encrypted: bool,
    pub storage_p2p_address: String,
    pub slice_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqReportDownloadResult {
    pub downloader_p2p_address: String,
    pub wallet_address: String,
    pub pp_p2p_address: String,
    pub pp_wallet_address: String,
    pub file_hash: String,
    pub task_id: String,
    pub sp_p2p_address: String,
    pub cost_time: i64,
    pub beneficiary_address: String,
    pub is_found_locally: bool,
    pub is_storage_side: bool,
    pub slice_info: DownloadSliceInfo,
    pub opponent_p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqDownloadFileWrong {
    pub file_indexes: FileIndexes,
    pub file_hash: String,
    pub task_id: String,
    pub req_id: String,
    pub failed_slices: Vec<String>,
    pub failed_pp_nodes: Vec<PpInfo>,
}

/// Indexing server tells a new holder to fetch a slice from its original holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeFileSliceBackup {
    pub task_id: String,
    pub file_hash: String,
    pub slice_storage_info: SliceStorageInfo,
    pub slice_number: u64,
    pub pp_info: PpInfo,
    pub sp_p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqTransferDownload {
    pub notice: NoticeFileSliceBackup,
    pub new_pp: PpInfo,
    pub p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspTransferDownload {
    pub data: Vec<u8>,
    pub task_id: String,
    pub offset: u64,
    pub slice_size: u64,
    pub sp_p2p_address: String,
    pub slice_hash: String,
    pub p2p_address: String,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspTransferDownloadResult {
    pub task_id: String,
    pub result: OpResult,
    pub sp_p2p_address: String,
    pub slice_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqTransferDownloadWrong {
    pub task_id: String,
    pub new_pp: PpInfo,
    pub original_pp: PpInfo,
    pub slice_storage_info: SliceStorageInfo,
    pub file_hash: String,
    pub sp_p2p_address: String,
}

/// Indexing server asks for a migrated slice to be checked at its new holder (`pp_info`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeFileSliceVerify {
    pub task_id: String,
    pub file_hash: String,
    pub slice_storage_info: SliceStorageInfo,
    pub slice_number: u64,
    pub pp_info: PpInfo,
    pub sp_p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqVerifyDownload {
    pub notice: NoticeFileSliceVerify,
    pub new_pp: PpInfo,
    pub p2p_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspVerifyDownload {
    pub data: Vec<u8>,
    pub task_id: String,
    pub offset: u64,
    pub slice_size: u64,
    pub sp_p2p_address: String,
    pub slice_hash: String,
    pub p2p_address: String,
    pub slice_number: u64,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspVerifyDownloadResult {
    pub task_id: String,
    pub result: OpResult,
    pub sp_p2p_address: String,
    pub slice_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqFindMyFileList {
    pub file_name: String,
    pub p2p_address: String,
    pub signature: WalletSignature,
    pub page_id: u64,
    pub keyword: String,
    pub req_id: String,
    pub req_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedFile {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub create_time: u64,
    pub is_directory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspFindMyFileList {
    pub p2p_address: String,
    pub wallet_address: String,
    pub req_id: String,
    pub files: Vec<ListedFile>,
    pub total_file_number: u64,
    pub page_id: u64,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqStartMaintenance {
    pub address: PpInfo,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqStopMaintenance {
    pub address: PpInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspMaintenance {
    pub starting: bool,
    pub result: OpResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub cpu_cores: i64,
    pub cpu_used_percent: f64,
    pub mem_used: i64,
    pub mem_total: i64,
    pub disk_used: i64,
    pub disk_total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReqReportNodeStatus {
    pub p2p_address: String,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RspPrepay {
    pub wallet_address: String,
    pub tx: Vec<u8>,
    pub result: OpResult,
}

/// Signed acknowledgement that a peer stored a slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReceipt {
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Heartbeat(Heartbeat),
    ReqRegister(ReqRegister),
    RspRegister(RspRegister),
    ReqUploadFile(ReqUploadFile),
    RspUploadFile(RspUploadFile),
    NoticeBackupFile(NoticeBackupFile),
    ReqUploadFileSlice(ReqUploadFileSlice),
    RspUploadFileSlice(RspUploadFileSlice),
    ReqUploadSlicesWrong(ReqUploadSlicesWrong),
    RspUploadSlicesWrong(RspUploadSlicesWrong),
    ReportUploadSliceResult(ReportUploadSliceResult),
    ReqFileStorageInfo(ReqFileStorageInfo),
    RspFileStorageInfo(RspFileStorageInfo),
    ReqDownloadSlice(ReqDownloadSlice),
    RspDownloadSlice(RspDownloadSlice),
    ReqReportDownloadResult(ReqReportDownloadResult),
    ReqDownloadFileWrong(ReqDownloadFileWrong),
    NoticeFileSliceBackup(NoticeFileSliceBackup),
    ReqTransferDownload(ReqTransferDownload),
    RspTransferDownload(RspTransferDownload),
    RspTransferDownloadResult(RspTransferDownloadResult),
    ReqTransferDownloadWrong(ReqTransferDownloadWrong),
    NoticeFileSliceVerify(NoticeFileSliceVerify),
    ReqVerifyDownload(ReqVerifyDownload),
    RspVerifyDownload(RspVerifyDownload),
    RspVerifyDownloadResult(RspVerifyDownloadResult),
    ReqFindMyFileList(ReqFindMyFileList),
    RspFindMyFileList(RspFindMyFileList),
    ReqStartMaintenance(ReqStartMaintenance),
    ReqStopMaintenance(ReqStopMaintenance),
    RspMaintenance(RspMaintenance),
    ReqReportNodeStatus(ReqReportNodeStatus),
    RspPrepay(RspPrepay),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Heartbeat(_) => "heartbeat",
            Message::ReqRegister(_) => "req_register",
            Message::RspRegister(_) => "rsp_register",
            Message::ReqUploadFile(_) => "req_upload_file",
            Message::RspUploadFile(_) => "rsp_upload_file",
            Message::NoticeBackupFile(_) => "notice_backup_file",
            Message::ReqUploadFileSlice(_) => "req_upload_file_slice",
            Message::RspUploadFileSlice(_) => "rsp_upload_file_slice",
            Message::ReqUploadSlicesWrong(_) => "req_upload_slices_wrong",
            Message::RspUploadSlicesWrong(_) => "rsp_upload_slices_wrong",
            Message::ReportUploadSliceResult(_) => "report_upload_slice_result",
            Message::ReqFileStorageInfo(_) => "req_file_storage_info",
            Message::RspFileStorageInfo(_) => "rsp_file_storage_info",
            Message::ReqDownloadSlice(_) => "req_download_slice",
            Message::RspDownloadSlice(_) => "rsp_download_slice",
            Message::ReqReportDownloadResult(_) => "req_report_download_result",
            Message::ReqDownloadFileWrong(_) => "req_download_file_wrong",
            Message::NoticeFileSliceBackup(_) => "notice_file_slice_backup",
            Message::ReqTransferDownload(_) => "req_transfer_download",
            Message::RspTransferDownload(_) => "rsp_transfer_download",
            Message::RspTransferDownloadResult(_) => "rsp_transfer_download_result",
            Message::ReqTransferDownloadWrong(_) => "req_transfer_download_wrong",
            Message::NoticeFileSliceVerify(_) => "notice_file_slice_verify",
            Message::ReqVerifyDownload(_) => "req_verify_download",
            Message::RspVerifyDownload(_) => "rsp_verify_download",
            Message::RspVerifyDownloadResult(_) => "rsp_verify_download_result",
            Message::ReqFindMyFileList(_) => "req_find_my_file_list",
            Message::RspFindMyFileList(_) => "rsp_find_my_file_list",
            Message::ReqStartMaintenance(_) => "req_start_maintenance",
            Message::ReqStopMaintenance(_) => "req_stop_maintenance",
            Message::RspMaintenance(_) => "rsp_maintenance",
            Message::ReqReportNodeStatus(_) => "req_report_node_status",
            Message::RspPrepay(_) => "rsp_prepay",
        }
    }
}
