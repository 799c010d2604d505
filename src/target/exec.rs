// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error, info, trace};
use zerocopy::IntoBytes;

use crate::{
    models::{
        common::RESERVED_TAG,
        logout::response::LogoutResponseBuilder,
        nop::response::NopInResponseBuilder,
        opcode::Opcode,
        ready_2_transfer::response::ReadyToTransferBuilder,
    },
    target::{
        backend::PreprocStatus,
        cmnd::{BackendState, Cmnd, Disposition, req_cmnd_release, req_cmnd_release_force},
        tm,
        tx::{self, InitWrite},
    },
};

/// Head-of-order dispatch: a command reaches here only once the CmdSN
/// window (or its immediate bit) lets it through.
pub(crate) fn cmnd_exec(cmnd: Arc<Cmnd>) {
    trace!(
        id = cmnd.id(),
        opcode = cmnd.opcode_raw(),
        cmd_sn = cmnd.cmd_sn(),
        "exec"
    );

    if cmnd.tmfabort.load(Ordering::SeqCst) {
        debug!(id = cmnd.id(), "aborted cmnd");
        req_cmnd_release_force(cmnd, true);
        return;
    }

    if cmnd.disposition() == Disposition::ScsiPreposted {
        debug!(id = cmnd.id(), "flushing preposted rsp");
        if let Some(rsp) = cmnd.take_preposted() {
            tx::cmnd_init_write(rsp, InitWrite::REMOVE_HASH | InitWrite::WAKE);
        }
        req_cmnd_release(cmnd);
        return;
    }

    match cmnd.opcode() {
        Some(Opcode::NopOut) => noop_out_exec(cmnd),
        Some(Opcode::ScsiCommandReq) => scsi_cmnd_exec(cmnd),
        Some(Opcode::ScsiTaskMgmtReq) => tm::execute_task_management(cmnd),
        Some(Opcode::LogoutReq) => logout_exec(cmnd),
        other => {
            error!(id = cmnd.id(), ?other, "unexpected cmnd op");
            req_cmnd_release(cmnd);
        },
    }
}

/// SCSI command at the head of the ordered stream: solicit outstanding
/// write data, or hand the command to the backend for execution.
pub(crate) fn scsi_cmnd_exec(cmnd: Arc<Cmnd>) {
    if cmnd.r2t_length.load(Ordering::SeqCst) != 0 {
        if !cmnd.is_unsolicited_data.load(Ordering::SeqCst)
            && cmnd.r2t_to_solicit.load(Ordering::SeqCst) != 0
        {
            send_r2t(&cmnd);
        }
    } else {
        // No race with send_r2t() and the abort path: both run on the
        // connection's single reader.
        cmnd.data_waiting.store(false, Ordering::SeqCst);
        restart_cmnd(&cmnd);
    }
}

fn restart_cmnd(cmnd: &Arc<Cmnd>) {
    cmnd.set_backend_state(BackendState::Restarted);
    if let Some(target) = cmnd.session().target() {
        target.backend.restart_cmd(cmnd, PreprocStatus::Success);
    } else {
        error!(id = cmnd.id(), "target gone before restart");
    }
}

/// Issue R2Ts for the unsolicited remainder of a write: one per burst
/// of MaxBurstLength, stopping at MaxOutstandingR2T, then mark the
/// request as waiting for Data-Out.
pub(crate) fn send_r2t(req: &Arc<Cmnd>) {
    let session = req.session();
    let burst = session.params.max_burst_length;
    let max_outstanding = session.params.max_outstanding_r2t;

    let mut length = req.r2t_to_solicit.load(Ordering::SeqCst);
    let mut offset = req.write_size().saturating_sub(length);
    let req_bhs = req.bhs();

    let mut send = Vec::new();
    loop {
        let rsp = req.create_rsp_cmnd();

        let desired = length.min(burst);
        let builder = ReadyToTransferBuilder::new()
            .target_transfer_tag(req.target_task_tag.load(Ordering::SeqCst))
            .r2t_sn(req.r2t_sn.fetch_add(1, Ordering::SeqCst))
            .buffer_offset(offset)
            .desired_data_transfer_length(desired);

        rsp.update_bhs(|bhs| {
            bhs.copy_from_slice(builder.header.as_bytes());
            bhs[8..16].copy_from_slice(&req_bhs[8..16]); // LUN
            bhs[16..20].copy_from_slice(&req_bhs[16..20]); // echo raw ITT
        });

        length -= desired;
        offset += desired;

        debug!(
            req = req.id(),
            desired,
            offset,
            outstanding = req.outstanding_r2t.load(Ordering::SeqCst),
            "r2t"
        );

        send.push(rsp);

        let outstanding = req.outstanding_r2t.fetch_add(1, Ordering::SeqCst) + 1;
        if outstanding >= max_outstanding || length == 0 {
            break;
        }
    }
    req.r2t_to_solicit.store(length, Ordering::SeqCst);

    tx::cmnds_init_write(send, InitWrite::WAKE);

    req.data_waiting.store(true, Ordering::SeqCst);
}

/// Answer a NOP-Out ping with a NOP-In echoing its data segment; a
/// ping-ack (reserved ITT) is simply consumed.
fn noop_out_exec(req: Arc<Cmnd>) {
    debug!(id = req.id(), "noop exec");

    if req.itt() != RESERVED_TAG {
        let rsp = req.create_rsp_cmnd();

        let builder = NopInResponseBuilder::new().lun(req.lun_raw());
        let req_bhs = req.bhs();
        rsp.update_bhs(|bhs| {
            bhs.copy_from_slice(builder.header.as_bytes());
            bhs[16..20].copy_from_slice(&req_bhs[16..20]); // echo raw ITT
        });

        let datasize = req.datasize();
        if datasize != 0 {
            rsp.set_shared_buffer(req.freeze_buffer());
            rsp.set_datasize(datasize);
        }

        tx::cmnd_init_write(rsp, InitWrite::REMOVE_HASH | InitWrite::WAKE);
        req_cmnd_release(req);
    } else {
        drop(req);
    }
}

/// Answer a Logout request and arrange for the connection to close
/// after the response goes out.
fn logout_exec(req: Arc<Cmnd>) {
    info!(
        initiator = %req.session().params.initiator_name,
        "Logout received"
    );

    let rsp = req.create_rsp_cmnd();
    let builder = LogoutResponseBuilder::new(0);
    let req_bhs = req.bhs();
    rsp.update_bhs(|bhs| {
        bhs.copy_from_slice(builder.header.as_bytes());
        bhs[16..20].copy_from_slice(&req_bhs[16..20]); // echo raw ITT
    });
    rsp.should_close_conn.store(true, Ordering::SeqCst);

    tx::cmnd_init_write(rsp, InitWrite::REMOVE_HASH | InitWrite::WAKE);
    req_cmnd_release(req);
}
