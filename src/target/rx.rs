// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::{Result, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};
use zerocopy::{FromBytes as ZFromBytes, IntoBytes};

use crate::{
    models::{
        command::request::ScsiCommandRequest,
        common::{HEADER_LEN, RESERVED_TAG},
        data_fromat::{compute_data_digest, compute_header_digest, pad_len},
        opcode::Opcode,
        parse::Pdu,
        reject::{reject_description::RejectReason, response::RejectPduBuilder},
    },
    target::{
        backend::{DataDirection, QueueAttr, ScsiCmdParams},
        cmnd::{BackendState, Cmnd, DataBuf, Disposition, req_cmnd_release,
               req_cmnd_release_force},
        conn::Conn,
        exec, tx,
    },
};

/// Size of the scratch region unsolicited ping payloads and skipped
/// PDUs are drained into.
const DISCARD_CHUNK: usize = 1024;

/// Where the data segment of the PDU being received should land.
pub(crate) enum RxDest {
    /// Into a buffer the command owns (NOP-Out payload).
    Own,
    /// Into a request's scatter buffer at the given offset (Data-Out,
    /// immediate write data).
    Request { req: Arc<Cmnd>, offset: u32 },
    /// Read and thrown away.
    Skip,
}

/// Per-connection reader: frame PDUs off the socket, drive the start
/// phase, land the data segment, then route the finished PDU. The whole
/// receive side of a connection runs on this single task.
pub async fn run_read_loop<R>(conn: Arc<Conn>, mut r: R) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let hd = conn.hdigest.enabled();
    let dd = conn.ddigest.enabled();
    let mut scratch = BytesMut::new();

    loop {
        if conn.is_closed() {
            return Ok(());
        }

        let mut bhs = [0u8; HEADER_LEN];
        match r.read_exact(&mut bhs).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(cid = conn.cid, "initiator closed the connection");
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        }

        {
            let mut dump = bhs;
            match Pdu::from_bhs_bytes(&mut dump) {
                Ok(pdu) => debug!(cid = conn.cid, ?pdu, "rx PDU"),
                Err(e) => debug!(cid = conn.cid, "rx PDU with unknown header: {e}"),
            }
        }

        let cmnd = Cmnd::alloc(&conn, None);
        let datasize =
            u32::from_be_bytes([0, bhs[5], bhs[6], bhs[7]]);
        let ahs_len = (bhs[4] as usize) * 4;
        {
            let mut pdu = cmnd.pdu.lock();
            pdu.bhs = bhs;
            pdu.datasize = datasize;
        }

        if ahs_len > 0 {
            let mut ahs = vec![0u8; ahs_len];
            r.read_exact(&mut ahs).await?;
            cmnd.pdu.lock().ahs = Some(Bytes::from(ahs));
        }

        if hd {
            let mut dig = [0u8; 4];
            r.read_exact(&mut dig).await?;
            let got = u32::from_be_bytes(dig);
            let ahs = cmnd.ahs().unwrap_or_default();
            let want = compute_header_digest(&bhs, &ahs);
            if got != want {
                bail!(
                    "header digest mismatch (got {got:#010x}, want {want:#010x})"
                );
            }
        }

        let dest = cmnd_rx_start(&cmnd).await?;

        let datasize = cmnd.datasize() as usize;
        if datasize > 0 {
            let padded = datasize + pad_len(datasize);
            match &dest {
                RxDest::Skip => {
                    let mut left = padded;
                    let mut chunk = [0u8; DISCARD_CHUNK];
                    while left > 0 {
                        let n = left.min(DISCARD_CHUNK);
                        r.read_exact(&mut chunk[..n]).await?;
                        left -= n;
                    }
                },
                _ => {
                    scratch.resize(padded, 0);
                    r.read_exact(&mut scratch[..padded]).await?;
                },
            }

            if dd {
                let mut dig = [0u8; 4];
                r.read_exact(&mut dig).await?;
                cmnd.rx_ddigest
                    .store(u32::from_be_bytes(dig), Ordering::SeqCst);
            }

            match dest {
                RxDest::Own => {
                    if dd {
                        let got = cmnd.rx_ddigest.load(Ordering::SeqCst);
                        let want = compute_data_digest(&scratch[..datasize]);
                        if got != want {
                            bail!(
                                "data digest mismatch (got {got:#010x}, want {want:#010x})"
                            );
                        }
                    }
                    let mut buf = BytesMut::with_capacity(datasize);
                    buf.extend_from_slice(&scratch[..datasize]);
                    cmnd.set_owned_buffer(buf);
                },
                RxDest::Request { req, offset } => {
                    let off = offset as usize;
                    let mut sg = req.sg.lock();
                    match &mut *sg {
                        DataBuf::Owned(buf) if off + datasize <= buf.len() => {
                            buf[off..off + datasize]
                                .copy_from_slice(&scratch[..datasize]);
                        },
                        _ => {
                            bail!("write buffer lost under a Data-Out");
                        },
                    }
                },
                RxDest::Skip => {},
            }
        }

        cmnd_rx_end(cmnd);
    }
}

fn check_segment_length(cmnd: &Arc<Cmnd>) -> Result<()> {
    let session = cmnd.session();
    let max = session.params.max_recv_data_length;
    if cmnd.datasize() > max {
        bail!(
            "Initiator {} violated negotiated parameters: data too long \
             (ITT {:#x}, datasize {}, max_recv_data_length {})",
            session.params.initiator_name,
            cmnd.itt(),
            cmnd.datasize(),
            max
        );
    }
    Ok(())
}

/// Start phase of one PDU: validate, hash, and decide where its data
/// segment goes. Protocol violations that stay recoverable prepost a
/// Reject and skip the payload; violations of negotiated limits fail
/// the connection by returning an error.
pub(crate) async fn cmnd_rx_start(cmnd: &Arc<Cmnd>) -> Result<RxDest> {
    check_segment_length(cmnd)?;

    let session = cmnd.session();
    match cmnd.opcode() {
        Some(Opcode::NopOut) => noop_out_start(cmnd),
        Some(Opcode::ScsiCommandReq) => match session.insert_hash(cmnd) {
            Ok(()) => scsi_cmnd_start(cmnd).await,
            Err(reason) => {
                error!(
                    itt = format_args!("{:#x}", cmnd.itt()),
                    "Can't insert in hash: ignore this request"
                );
                Ok(cmnd_reject(cmnd, reason))
            },
        },
        Some(Opcode::ScsiTaskMgmtReq) | Some(Opcode::LogoutReq) => {
            match session.insert_hash(cmnd) {
                Ok(()) => Ok(RxDest::Skip),
                Err(reason) => Ok(cmnd_reject(cmnd, reason)),
            }
        },
        Some(Opcode::ScsiDataOut) => data_out_start(cmnd),
        other => {
            debug!(?other, "unsupported opcode");
            Ok(cmnd_reject(cmnd, RejectReason::CommandNotSupported))
        },
    }
}

/// Prepost a Reject carrying the offending BHS and turn the command
/// into a reject carrier; its remaining payload is skipped.
fn cmnd_reject(cmnd: &Arc<Cmnd>, reason: RejectReason) -> RxDest {
    warn!(id = cmnd.id(), ?reason, "rejecting PDU");

    let rsp = cmnd.create_rsp_cmnd();
    let builder = RejectPduBuilder::new(reason);
    rsp.update_bhs(|bhs| bhs.copy_from_slice(builder.header.as_bytes()));

    let offending = cmnd.bhs();
    let mut payload = BytesMut::with_capacity(HEADER_LEN);
    payload.extend_from_slice(&offending);
    rsp.set_owned_buffer(payload);
    rsp.set_datasize(HEADER_LEN as u32);

    cmnd.stash_preposted(rsp);
    cmnd.set_disposition(Disposition::PduReject);
    RxDest::Skip
}

fn noop_out_start(cmnd: &Arc<Cmnd>) -> Result<RxDest> {
    let session = cmnd.session();

    if cmnd.ttt_field() != RESERVED_TAG {
        // We don't request a NOP-Out by sending a NOP-In.
        error!(itt = format_args!("{:#x}", cmnd.itt()), "initiator bug");
        return Ok(cmnd_reject(cmnd, RejectReason::ProtocolError));
    }

    if cmnd.itt() == RESERVED_TAG {
        if !cmnd.is_immediate() {
            error!("initiator bug: non-immediate ping-ack");
        }
        if let Err(reason) = session.check_cmd_sn(cmnd) {
            return Ok(cmnd_reject(cmnd, reason));
        }
        // Ping payload is read and thrown away.
        Ok(RxDest::Skip)
    } else {
        match session.insert_hash(cmnd) {
            Ok(()) => Ok(RxDest::Own),
            Err(reason) => {
                error!(
                    itt = format_args!("{:#x}", cmnd.itt()),
                    "Can't insert in hash: ignore this request"
                );
                Ok(cmnd_reject(cmnd, reason))
            },
        }
    }
}

/// Start a SCSI command: construct the backend command, block until
/// preprocessing finishes, then set up write-data state and the receive
/// window for any immediate data.
async fn scsi_cmnd_start(cmnd: &Arc<Cmnd>) -> Result<RxDest> {
    let session = cmnd.session();
    let bhs = cmnd.bhs();
    let Ok(hdr) = ScsiCommandRequest::ref_from_bytes(&bhs) else {
        return Ok(cmnd_reject(cmnd, RejectReason::InvalidPduField));
    };

    debug!(cdb = format_args!("{:#04x}", hdr.scsi_descriptor_block[0]), "scsi command");

    let dir = if hdr.flags.read() && !hdr.flags.write() {
        DataDirection::Read
    } else if hdr.flags.write() {
        DataDirection::Write
    } else {
        DataDirection::None
    };

    let params = ScsiCmdParams {
        lun: hdr.lun.get(),
        cdb: hdr.cdb(),
        direction: dir,
        expected_len: hdr.expected_data_transfer_length.get(),
        attr: QueueAttr::from(hdr.flags.task_attr()),
    };
    let is_final = hdr.flags.fin();
    let datasize = cmnd.datasize();

    let Some(target) = session.target() else {
        bail!("target is gone");
    };

    if let Err(e) = target.backend.rx_cmd(cmnd, params.clone()) {
        warn!(id = cmnd.id(), "backend refused command: {e}");
        let rsp = tx::create_status_rsp(
            cmnd,
            crate::models::command::common::ScsiStatus::Busy,
            None,
        );
        cmnd.stash_preposted(rsp);
        prepare_skip_resid(cmnd);
        return Ok(RxDest::Skip);
    }

    cmnd.has_backend.store(true, Ordering::SeqCst);
    cmnd.set_backend_state(BackendState::RxCmd);
    target.backend.init_stage1_done(cmnd);

    cmnd.wait_state_change(BackendState::RxCmd).await;

    if cmnd.backend_state() != BackendState::AfterPreproc {
        debug!(id = cmnd.id(), state = ?cmnd.backend_state(), "not after-preproc");
        if cmnd.backend_state() == BackendState::Processed {
            // Response is already prepared
            prepare_skip_resid(cmnd);
            return Ok(RxDest::Skip);
        }
        if cmnd.tmfabort.load(Ordering::SeqCst) {
            debug!(id = cmnd.id(), "req aborted during preprocessing");
            return Ok(RxDest::Skip);
        }
        error!(id = cmnd.id(), state = ?cmnd.backend_state(), "unexpected state");
        return Ok(RxDest::Skip);
    }

    if dir != DataDirection::Write && (!is_final || datasize != 0) {
        error!(
            itt = format_args!("{:#x}", cmnd.itt()),
            cdb = format_args!("{:#04x}", params.cdb[0]),
            "Unexpected unsolicited data"
        );
        let rsp = tx::create_sense_rsp(
            cmnd,
            crate::models::data::sense_data::keys::ABORTED_COMMAND,
            0x0c,
            0x0c,
        );
        cmnd.stash_preposted(rsp);
        prepare_skip_resid(cmnd);
        return Ok(RxDest::Skip);
    }

    if dir == DataDirection::Write {
        cmnd.is_unsolicited_data.store(!is_final, Ordering::SeqCst);
        let r2t_len = params.expected_len.saturating_sub(datasize);
        cmnd.r2t_length.store(r2t_len, Ordering::SeqCst);
        cmnd.r2t_to_solicit.store(r2t_len, Ordering::SeqCst);
    }
    cmnd.target_task_tag
        .store(session.next_ttt(), Ordering::SeqCst);

    if dir == DataDirection::Write {
        let buf = target
            .backend
            .alloc_data_buf(&params)
            .unwrap_or_else(|| BytesMut::zeroed(params.expected_len as usize));
        if (cmnd.r2t_length.load(Ordering::SeqCst) as usize) > buf.len() {
            error!(
                r2t_length = cmnd.r2t_length.load(Ordering::SeqCst),
                bufflen = buf.len(),
                "r2t_length exceeds buffer"
            );
            cmnd.r2t_length.store(buf.len() as u32, Ordering::SeqCst);
        }
        cmnd.set_owned_buffer(buf);
    }

    debug!(
        id = cmnd.id(),
        ?dir,
        unsolicited = cmnd.is_unsolicited_data.load(Ordering::SeqCst),
        r2t_length = cmnd.r2t_length.load(Ordering::SeqCst),
        "scsi cmnd started"
    );

    if datasize != 0 && !session.params.immediate_data {
        bail!(
            "Initiator {} violated negotiated parameters: forbidden immediate \
             data sent (ITT {:#x}, op {:#x})",
            session.params.initiator_name,
            cmnd.itt(),
            params.cdb[0]
        );
    }

    if session.params.initial_r2t && !is_final {
        bail!(
            "Initiator {} violated negotiated parameters: initial R2T is \
             required (ITT {:#x}, op {:#x})",
            session.params.initiator_name,
            cmnd.itt(),
            params.cdb[0]
        );
    }

    if datasize != 0 {
        Ok(RxDest::Request {
            req: Arc::clone(cmnd),
            offset: 0,
        })
    } else {
        Ok(RxDest::Skip)
    }
}

/// Route an incoming Data-Out to its write request and account the
/// received bytes against the solicitation state.
fn data_out_start(cmnd: &Arc<Cmnd>) -> Result<RxDest> {
    let session = cmnd.session();
    session.update_stat_sn(cmnd);

    let itt = cmnd.itt();
    let ttt = cmnd.ttt_field();
    let Some(req) = session.find_hash(itt, ttt) else {
        error!("unable to find scsi task {itt:#x} {ttt:#x}");
        cmnd.set_disposition(Disposition::DataReject);
        return Ok(RxDest::Skip);
    };
    *cmnd.cmd_req.lock() = Some(Arc::clone(&req));

    let size = cmnd.datasize();
    let offset = {
        let bhs = cmnd.bhs();
        u32::from_be_bytes([bhs[40], bhs[41], bhs[42], bhs[43]])
    };

    let r2t_length = req.r2t_length.load(Ordering::SeqCst);
    if r2t_length < size {
        bail!("Invalid data len {itt:#x} {size} {r2t_length}");
    }

    if r2t_length.wrapping_add(offset) != req.write_size() {
        bail!(
            "Wrong cmd lengths ({itt:#x} {r2t_length} {offset} {})",
            req.write_size()
        );
    }

    req.r2t_length.store(r2t_length - size, Ordering::SeqCst);
    if ttt == RESERVED_TAG {
        let left = req.r2t_to_solicit.load(Ordering::SeqCst);
        req.r2t_to_solicit
            .store(left.saturating_sub(size), Ordering::SeqCst);
    }

    if ttt == RESERVED_TAG && req.is_final() {
        bail!("unexpected data from {itt:#x} {ttt:#x}");
    }

    let bufflen = req.bufflen.load(Ordering::SeqCst);
    if offset >= bufflen || offset + size > bufflen {
        bail!("Wrong ltn ({offset} {size} {bufflen})");
    }

    Ok(RxDest::Request { req, offset })
}

/// End-of-PDU routing: ordered commands go through the session window,
/// Data-Out completion feeds the solicitation state machine, rejects
/// flush their preposted response.
pub(crate) fn cmnd_rx_end(cmnd: Arc<Cmnd>) {
    if cmnd.tmfabort.load(Ordering::SeqCst) {
        debug!(id = cmnd.id(), "aborted during rx");
        req_cmnd_release_force(cmnd, true);
        return;
    }

    debug!(id = cmnd.id(), opcode = cmnd.opcode_raw(), "rx end");

    match cmnd.disposition() {
        Disposition::PduReject => {
            if let Some(rsp) = cmnd.take_preposted() {
                tx::cmnd_init_write(rsp, tx::InitWrite::REMOVE_HASH | tx::InitWrite::WAKE);
            }
            req_cmnd_release(cmnd);
        },
        Disposition::DataReject => {
            drop(cmnd);
        },
        Disposition::Normal | Disposition::ScsiPreposted => match cmnd.opcode() {
            Some(
                Opcode::NopOut
                | Opcode::ScsiCommandReq
                | Opcode::ScsiTaskMgmtReq
                | Opcode::LogoutReq,
            ) => {
                cmnd.session().push_cmnd(cmnd);
            },
            Some(Opcode::ScsiDataOut) => data_out_end(cmnd),
            other => {
                error!(id = cmnd.id(), ?other, "unexpected cmnd op at rx end");
                req_cmnd_release(cmnd);
            },
        },
    }
}

/// A Data-Out finished arriving: queue it for digest verification,
/// track the unsolicited stream, and when a burst completes hand the
/// write request back to the executor.
fn data_out_end(cmnd: Arc<Cmnd>) {
    let req = {
        let cr = cmnd.cmd_req.lock();
        cr.clone()
    };
    let Some(req) = req else {
        error!(id = cmnd.id(), "data-out without a request");
        return;
    };

    let conn = cmnd.conn();
    let is_final = cmnd.is_final();
    let ttt = cmnd.ttt_field();

    if conn.ddigest.enabled() && cmnd.datasize() != 0 {
        debug!(id = cmnd.id(), req = req.id(), "queueing rx ddigest check");
        req.rx_ddigest_cmd_list.lock().push(Arc::clone(&cmnd));
    }

    if ttt == RESERVED_TAG {
        debug!(id = cmnd.id(), is_final, "unsolicited data-out");
        if is_final {
            req.is_unsolicited_data.store(false, Ordering::SeqCst);
            if !req.pending.load(Ordering::SeqCst) {
                exec::scsi_cmnd_exec(req);
            }
        }
    } else {
        if !is_final && req.r2t_length.load(Ordering::SeqCst) == 0 {
            error!(itt = format_args!("{:#x}", req.itt()), "initiator error");
        }
        if is_final {
            req.outstanding_r2t.fetch_sub(1, Ordering::SeqCst);
            exec::scsi_cmnd_exec(req);
        }
    }

    drop(cmnd);
}

/// Record the residual counts of a transfer that will never move data
/// on the preposted SCSI Response, then route the command through the
/// ordered flush path.
fn prepare_skip_resid(req: &Arc<Cmnd>) {
    let Some(rsp) = req.get_rsp_cmnd() else {
        error!(id = req.id(), "no response to set residuals on");
        return;
    };
    if rsp.opcode() != Some(Opcode::ScsiCommandResp) {
        error!(opcode = rsp.opcode_raw(), "unexpected response command");
        return;
    }

    let wsize = req.write_size();
    if wsize != 0 {
        rsp.set_scsi_rsp_residual(wsize as i64);
    }
    let rsize = req.read_size();
    if rsize != 0 {
        let bhs = req.bhs();
        let bidir = bhs[1] & 0x20 != 0; // WRITE flag on a READ command
        if bidir {
            rsp.set_scsi_rsp_bidir_residual(rsize as i64);
        } else {
            rsp.set_scsi_rsp_residual(rsize as i64);
        }
    }

    req.set_disposition(Disposition::ScsiPreposted);
}
