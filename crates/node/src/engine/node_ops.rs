use sds_protocol::{
    Message, ReqFindMyFileList, ReqRegister, ReqReportNodeStatus, ReqStartMaintenance, ReqStopMaintenance,
    RspFindMyFileList, RspMaintenance, RspPrepay, RspRegister, WalletSignature,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{now_secs, SliceProtocolEngine};
use crate::error::{NodeError, Result};
use crate::events::TransferEvent;

#[derive(Debug, Clone, Default)]
pub struct FileListQuery {
    pub file_name: String,
    pub keyword: String,
    pub page_id: u64,
    pub signature: WalletSignature,
    pub req_id: Option<String>,
}

impl SliceProtocolEngine {
    /// Announces this node to the current indexing server.
    pub fn register(&self) -> Result<()> {
        self.send_to_sp(Message::ReqRegister(ReqRegister {
            address: self.identity.pp_info(),
            public_key: self.identity.public_key(),
            req_time: now_secs(),
        }))?;
        debug!(p2p = %self.identity.p2p_address, "Registration sent");
        Ok(())
    }

    pub(super) fn on_rsp_register(&self, rsp: RspRegister) -> Result<()> {
        if !rsp.result.is_success() {
            return Err(NodeError::InternalComm(format!(
                "registration refused by {}: {}",
                rsp.sp_p2p_address, rsp.result.msg
            )));
        }
        info!(sp = %rsp.sp_p2p_address, is_pp = rsp.is_pp, "Registered with indexing server");
        self.events.publish(TransferEvent::Registered {
            sp_p2p_address: rsp.sp_p2p_address,
            is_pp: rsp.is_pp,
        });
        Ok(())
    }

    pub fn report_node_status(&self) -> Result<()> {
        let status = self.status_probe.probe();
        debug!(disk_used = status.disk_used, disk_total = status.disk_total, "Reporting node status");
        self.send_to_sp(Message::ReqReportNodeStatus(ReqReportNodeStatus {
            p2p_address: self.identity.p2p_address.clone(),
            status,
        }))
    }

    pub fn start_maintenance(&self, duration: Duration) -> Result<()> {
        info!(secs = duration.as_secs(), "Requesting maintenance window");
        self.send_to_sp(Message::ReqStartMaintenance(ReqStartMaintenance {
            address: self.identity.pp_info(),
            duration_secs: duration.as_secs(),
        }))
    }

    pub fn stop_maintenance(&self) -> Result<()> {
        info!("Ending maintenance window");
        self.send_to_sp(Message::ReqStopMaintenance(ReqStopMaintenance {
            address: self.identity.pp_info(),
        }))
    }

    pub(super) fn on_rsp_maintenance(&self, rsp: RspMaintenance) -> Result<()> {
        self.events.publish(TransferEvent::Maintenance {
            starting: rsp.starting,
            success: rsp.result.is_success(),
            msg: rsp.result.msg.clone(),
        });
        if rsp.result.is_success() {
            Ok(())
        } else {
            Err(NodeError::FileRequest(format!("maintenance request refused: {}", rsp.result.msg)))
        }
    }

    /// Forwards a file-list query for the wallet that signed it. Returns the request id.
    pub fn find_my_file_list(&self, query: FileListQuery) -> Result<String> {
        if query.signature.address.is_empty() {
            return Err(NodeError::WrongWalletAddress(String::new()));
        }
        let req_id = query
            .req_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
        self.send_to_sp(Message::ReqFindMyFileList(ReqFindMyFileList {
            file_name: query.file_name,
            p2p_address: self.identity.p2p_address.clone(),
            signature: query.signature,
            page_id: query.page_id,
            keyword: query.keyword,
            req_id: req_id.clone(),
            req_time: now_secs(),
        }))?;
        Ok(req_id)
    }

    pub(super) fn on_rsp_find_my_file_list(&self, rsp: RspFindMyFileList) -> Result<()> {
        if self.forward_if_foreign(&rsp.p2p_address, || Message::RspFindMyFileList(rsp.clone())) {
            return Ok(());
        }
        if !rsp.result.is_success() {
            return Err(NodeError::FileRequest(format!("file list {} refused: {}", rsp.req_id, rsp.result.msg)));
        }
        self.events.publish(TransferEvent::FileList {
            req_id: rsp.req_id,
            files: rsp.files,
            total: rsp.total_file_number,
            page_id: rsp.page_id,
        });
        Ok(())
    }

    /// Hands a signed prepay transaction to the chain.
    pub(super) async fn on_rsp_prepay(&self, rsp: RspPrepay) -> Result<()> {
        if !rsp.result.is_success() {
            warn!(wallet = %rsp.wallet_address, msg = %rsp.result.msg, "Prepay rejected");
            return Err(NodeError::FileRequest(format!("prepay rejected: {}", rsp.result.msg)));
        }
        self.chain
            .broadcast_tx(&rsp.wallet_address, &rsp.tx)
            .await
            .map_err(|err| NodeError::InternalComm(format!("prepay broadcast failed: {err:#}")))
    }
}
