// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    models::{
        command::common::{ScsiStatus, TaskAttribute},
        task_mgmt::common::{TmFunction, TmResponseCode},
    },
    target::{
        cmnd::{BackendState, Cmnd, req_cmnd_release, req_cmnd_release_force},
        digest,
        tm::send_task_mgmt_resp,
        tx,
    },
};

/// Expected data movement of a SCSI command, derived from the request
/// flags before the CDB is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    Read,
    Write,
}

/// Queue class a task is submitted under, mapped from the iSCSI task
/// attribute. Unknown attributes map to `Ordered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAttr {
    Untagged,
    Simple,
    Ordered,
    HeadOfQueue,
    Aca,
}

impl From<TaskAttribute> for QueueAttr {
    fn from(attr: TaskAttribute) -> Self {
        match attr {
            TaskAttribute::Untagged => QueueAttr::Untagged,
            TaskAttribute::Simple => QueueAttr::Simple,
            TaskAttribute::Ordered => QueueAttr::Ordered,
            TaskAttribute::HeadOfQueue => QueueAttr::HeadOfQueue,
            TaskAttribute::ACA => QueueAttr::Aca,
            TaskAttribute::Reserved(v) => {
                warn!("Unknown task code {v:#x}, use ORDERED instead");
                QueueAttr::Ordered
            },
        }
    }
}

/// Everything the backend needs to construct one SCSI command.
#[derive(Debug, Clone)]
pub struct ScsiCmdParams {
    pub lun: u64,
    pub cdb: [u8; 16],
    pub direction: DataDirection,
    pub expected_len: u32,
    pub attr: QueueAttr,
}

/// Outcome of preprocessing handed back through `restart_cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocStatus {
    Success,
    ErrorFatal,
}

/// Completion status of a task-management function at the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtStatus {
    Success,
    TaskNotExist,
    LunNotExist,
    FnNotSupported,
    Rejected,
    Failed,
}

/// Final result of executing a SCSI command, delivered to
/// [`xmit_response`].
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub status: ScsiStatus,
    /// Raw fixed-format sense bytes for CHECK CONDITION.
    pub sense: Option<Bytes>,
    /// Read payload (empty for writes and non-data commands).
    pub data: Bytes,
    /// Whether a status PDU is owed for this command.
    pub send_status: bool,
    /// Set when the backend observed an abort of this task.
    pub aborted: bool,
}

impl ExecResult {
    pub fn good() -> Self {
        ExecResult {
            status: ScsiStatus::Good,
            sense: None,
            data: Bytes::new(),
            send_status: true,
            aborted: false,
        }
    }
}

/// The SCSI executor behind the protocol engine.
///
/// The engine hands fully-preprocessed commands to the backend and the
/// backend calls back through the free functions of this module
/// ([`preprocessing_done`], [`pre_exec`], [`xmit_response`],
/// [`task_mgmt_fn_done`]). A backend that stores per-command state must
/// key it by [`Cmnd::id`] and keep at most a `Weak` reference to the
/// command itself; the strong references belong to the engine.
pub trait ScsiBackend: Send + Sync + 'static {
    /// Construct backend state for one SCSI command. An error preposts a
    /// BUSY response and the command never reaches execution.
    fn rx_cmd(&self, req: &Arc<Cmnd>, params: ScsiCmdParams) -> Result<()>;

    /// Begin preprocessing; the backend answers with
    /// [`preprocessing_done`] (possibly before this returns).
    fn init_stage1_done(&self, req: &Arc<Cmnd>);

    /// Resume a command whose write data is complete (or abort it with
    /// `ErrorFatal` when the engine gave up on it). The backend answers
    /// with [`xmit_response`] on the success path.
    fn restart_cmd(&self, req: &Cmnd, status: PreprocStatus);

    /// The engine is done with the command; drop any state keyed by its
    /// id.
    fn tgt_cmd_done(&self, req: &Cmnd);

    /// Optional buffer for the write payload of `params`; `None` lets
    /// the engine allocate one itself.
    fn alloc_data_buf(&self, params: &ScsiCmdParams) -> Option<BytesMut> {
        let _ = params;
        None
    }

    /// Task-management function addressing a single task by tag.
    fn rx_mgmt_fn_tag(&self, mcmd: &Arc<Cmnd>, f: TmFunction, tag: u32) -> Result<()>;

    /// Task-management function addressing a LUN (or the whole target).
    fn rx_mgmt_fn_lun(&self, mcmd: &Arc<Cmnd>, f: TmFunction, lun: u64) -> Result<()>;
}

/// Backend callback: preprocessing finished, wake the reader blocked in
/// the SCSI command start path.
pub fn preprocessing_done(req: &Arc<Cmnd>) {
    debug!(id = req.id(), "preprocessing done");
    req.set_state_wake(BackendState::AfterPreproc);
}

/// Backend hook run right before command execution: verify the digests
/// of all queued Data-Out PDUs. On a mismatch the backend must answer
/// CHECK CONDITION with the returned sense blob instead of executing.
pub fn pre_exec(req: &Arc<Cmnd>) -> Result<(), BytesMut> {
    digest::verify_rx_ddigests(req)
}

/// Backend callback: command execution finished, emit the response
/// PDUs. Mirrors the status/sense/residual rules of the protocol:
/// read data travels as a Data-In burst with the status collapsed into
/// the final PDU, except under CHECK CONDITION where a separate SCSI
/// Response carries sense and residual counts.
pub async fn xmit_response(req: Arc<Cmnd>, res: ExecResult) {
    let conn = req.conn();

    if res.aborted {
        req.tmfabort
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    if req.tmfabort.load(std::sync::atomic::Ordering::SeqCst) {
        debug!(id = req.id(), "req aborted");
        if req.backend_state() == BackendState::Restarted {
            req.set_backend_state(BackendState::Processed);
            req_cmnd_release_force(req, true);
        } else {
            req.set_state_wake(BackendState::Processed);
        }
        return;
    }

    let old_state = req.backend_state();
    if old_state != BackendState::Restarted {
        // An error response produced while the command was still being
        // preprocessed; the reader will flush it in CmdSN order.
        debug!(id = req.id(), ?old_state, "response preposted before restart");
        let rsp = tx::create_status_rsp(&req, res.status, res.sense.as_deref());
        req.stash_preposted(rsp);
        req.set_state_wake(BackendState::Processed);
        return;
    }

    req.set_backend_state(BackendState::Processed);

    req.set_shared_buffer(res.data.clone());

    if !res.data.is_empty() {
        if res.status != ScsiStatus::CheckCondition {
            tx::send_data_rsp(&req, res.status, res.send_status);
        } else {
            tx::send_data_rsp(&req, ScsiStatus::Good, false);
            if res.send_status {
                let rsp = tx::create_status_rsp(&req, res.status, res.sense.as_deref());
                let resid = req.read_size() as i64 - res.data.len() as i64;
                rsp.set_scsi_rsp_residual(resid);
                tx::cmnd_init_write(rsp, tx::InitWrite::REMOVE_HASH);
            }
        }
    } else if res.send_status {
        let rsp = tx::create_status_rsp(&req, res.status, res.sense.as_deref());
        rsp.set_scsi_rsp_residual(req.read_size() as i64);
        tx::cmnd_init_write(rsp, tx::InitWrite::REMOVE_HASH);
    }

    req_cmnd_release(req);

    tx::try_local_processing(&conn).await;
}

/// Backend callback: a task-management function finished; map the
/// backend status onto the wire response code and send the TM response.
pub fn task_mgmt_fn_done(mcmd: Arc<Cmnd>, status: MgmtStatus) {
    let code = match status {
        MgmtStatus::Success => TmResponseCode::FunctionComplete,
        MgmtStatus::TaskNotExist => TmResponseCode::UnknownTask,
        MgmtStatus::LunNotExist => TmResponseCode::UnknownLun,
        MgmtStatus::FnNotSupported => TmResponseCode::FunctionUnsupported,
        MgmtStatus::Rejected | MgmtStatus::Failed => TmResponseCode::FunctionRejected,
    };
    send_task_mgmt_resp(mcmd, code);
}
