// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, error, warn};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::{
    models::{
        common::RESERVED_TAG,
        task_mgmt::{
            common::{TmFunction, TmResponseCode},
            request::TaskMgmtRequest,
            response::TaskMgmtResponseBuilder,
        },
    },
    target::{
        cmnd::{Cmnd, req_cmnd_release, req_cmnd_release_force},
        conn::Conn,
        session::Session,
        tx::{self, InitWrite},
    },
};

/// Mark one command aborted. A command suspended waiting for Data-Out
/// is force-released on the spot (its queued R2Ts die with it); anyone
/// iterating the connection's command list must restart from the head
/// after a `true` return, since the list changed underneath them.
pub(crate) fn abort_cmnd(cmnd: &Arc<Cmnd>) -> bool {
    warn!(
        id = cmnd.id(),
        itt = format_args!("{:#x}", cmnd.itt()),
        opcode = cmnd.opcode_raw(),
        r2t_length = cmnd.r2t_length.load(Ordering::SeqCst),
        outstanding_r2t = cmnd.outstanding_r2t.load(Ordering::SeqCst),
        "aborting cmnd"
    );

    cmnd.tmfabort.store(true, Ordering::SeqCst);

    if cmnd.data_waiting.load(Ordering::SeqCst) {
        debug!(id = cmnd.id(), "releasing data waiting cmnd");
        req_cmnd_release_force(Arc::clone(cmnd), true);
        return true;
    }

    false
}

/// ABORT TASK: find the referenced task by tag and abort it.
pub(crate) fn cmnd_abort(session: &Arc<Session>, rtt: u32) -> Result<(), TmResponseCode> {
    match session.find_hash(rtt, RESERVED_TAG) {
        Some(cmnd) => {
            abort_cmnd(&cmnd);
            Ok(())
        },
        None => Err(TmResponseCode::UnknownTask),
    }
}

/// Snapshot the live commands of a connection. Abort work happens
/// outside the list lock; an abort that mutates the list only affects
/// commands the snapshot already captured.
fn live_cmnds(conn: &Arc<Conn>) -> Vec<Arc<Cmnd>> {
    conn.cmd_list
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect()
}

fn live_conns(session: &Arc<Session>) -> Vec<Arc<Conn>> {
    session
        .conns
        .lock()
        .iter()
        .filter_map(|w| w.upgrade())
        .collect()
}

/// ABORT/CLEAR TASK SET: abort every command of the session except the
/// TM request itself.
fn task_set_abort(req: &Arc<Cmnd>) {
    let session = req.session();
    for conn in live_conns(&session) {
        for cmnd in live_cmnds(&conn) {
            if !Arc::ptr_eq(&cmnd, req) {
                abort_cmnd(&cmnd);
            }
        }
    }
}

/// TARGET RESET / LUN RESET: abort every command across every session
/// of the target, optionally restricted to one LUN.
fn target_abort(req: &Arc<Cmnd>, lun: Option<u64>) {
    let Some(target) = req.session().target() else {
        return;
    };
    let sessions: Vec<Arc<Session>> = target.sessions.lock().clone();
    for session in sessions {
        for conn in live_conns(&session) {
            for cmnd in live_cmnds(&conn) {
                if Arc::ptr_eq(&cmnd, req) {
                    continue;
                }
                match lun {
                    Some(lun) if cmnd.lun_raw() != lun => {},
                    _ => {
                        abort_cmnd(&cmnd);
                    },
                }
            }
        }
    }
}

/// Drain a faulted connection: abort everything in flight, flush this
/// connection's entries out of the session reorder window, cancel
/// queued responses, and drop the remaining hashed requests.
pub fn conn_abort(conn: &Arc<Conn>) {
    warn!(cid = conn.cid, "aborting conn");

    for cmnd in live_cmnds(conn) {
        abort_cmnd(&cmnd);
    }

    let session = conn.session();
    for cmnd in session.drain_pending_for_conn(conn) {
        cmnd.pending.store(false, Ordering::SeqCst);
        cmnd.tmfabort.store(true, Ordering::SeqCst);
        req_cmnd_release_force(cmnd, false);
    }

    loop {
        let rsp = conn.write_list.lock().pop_front();
        match rsp {
            Some(rsp) => {
                rsp.on_write_list.store(false, Ordering::SeqCst);
                rsp.force_cleanup_done.store(true, Ordering::SeqCst);
                drop(rsp);
            },
            None => break,
        }
    }

    for cmnd in live_cmnds(conn) {
        if cmnd.hashed.load(Ordering::SeqCst) {
            req_cmnd_release(cmnd);
        }
    }
}

/// Dispatch one task-management request. The backend completes the
/// function asynchronously via `task_mgmt_fn_done`, except for the
/// locally-answered cases (unknown function, reassign, unknown task).
pub(crate) fn execute_task_management(req: Arc<Cmnd>) {
    let bhs = req.bhs();
    let Ok(hdr) = TaskMgmtRequest::ref_from_bytes(&bhs) else {
        send_task_mgmt_resp(req, TmResponseCode::FunctionRejected);
        return;
    };
    let function = hdr.tm_function();
    let rtt = hdr.referenced_task_tag.get();
    let lun = hdr.lun.get();

    warn!(
        id = req.id(),
        itt = format_args!("{:#x}", req.itt()),
        %function,
        rtt = format_args!("{rtt:#x}"),
        "TM cmd"
    );

    let session = req.session();
    let Some(target) = session.target() else {
        send_task_mgmt_resp(req, TmResponseCode::FunctionRejected);
        return;
    };

    let backend_res = match function {
        TmFunction::AbortTask => match cmnd_abort(&session, rtt) {
            Ok(()) => target.backend.rx_mgmt_fn_tag(&req, function, rtt),
            Err(code) => {
                send_task_mgmt_resp(req, code);
                return;
            },
        },
        TmFunction::AbortTaskSet | TmFunction::ClearTaskSet => {
            task_set_abort(&req);
            target.backend.rx_mgmt_fn_lun(&req, function, lun)
        },
        TmFunction::ClearAca => target.backend.rx_mgmt_fn_lun(&req, function, lun),
        TmFunction::TargetColdReset | TmFunction::TargetWarmReset => {
            target_abort(&req, None);
            target.backend.rx_mgmt_fn_lun(&req, function, lun)
        },
        TmFunction::LogicalUnitReset => {
            target_abort(&req, Some(lun));
            target.backend.rx_mgmt_fn_lun(&req, function, lun)
        },
        TmFunction::TaskReassign => {
            send_task_mgmt_resp(req, TmResponseCode::FunctionUnsupported);
            return;
        },
        TmFunction::Unknown(v) => {
            error!("unknown TM function {v}");
            send_task_mgmt_resp(req, TmResponseCode::FunctionRejected);
            return;
        },
    };

    if let Err(e) = backend_res {
        error!(id = req.id(), "backend rejected TM function: {e}");
        send_task_mgmt_resp(req, TmResponseCode::FunctionRejected);
    }
}

/// Build and queue the TM response. A cold-reset response closes the
/// connection once it is on the wire.
pub(crate) fn send_task_mgmt_resp(req: Arc<Cmnd>, status: TmResponseCode) {
    debug!(id = req.id(), ?status, "TM resp");

    let bhs = req.bhs();
    let cold_reset = TaskMgmtRequest::ref_from_bytes(&bhs)
        .map(|hdr| hdr.tm_function() == TmFunction::TargetColdReset)
        .unwrap_or(false);

    let rsp = req.create_rsp_cmnd();
    let builder = TaskMgmtResponseBuilder::new(0, status);
    rsp.update_bhs(|out| {
        out.copy_from_slice(builder.header.as_bytes());
        out[16..20].copy_from_slice(&bhs[16..20]); // echo raw ITT
    });

    if cold_reset {
        rsp.should_close_conn.store(true, Ordering::SeqCst);
    }

    tx::cmnd_init_write(rsp, InitWrite::REMOVE_HASH | InitWrite::WAKE);
    req_cmnd_release(req);
}
