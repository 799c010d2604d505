// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, atomic::Ordering};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tracing::{debug, error, warn};
use zerocopy::IntoBytes;

use crate::{
    models::{
        command::common::ScsiStatus,
        command::response::ScsiCommandResponseBuilder,
        common::HEADER_LEN,
        data::response::ScsiDataInBuilder,
        data_fromat::{compute_header_digest, pad_len},
        opcode::Opcode,
    },
    target::{
        cmnd::{Cmnd, rsp_cmnd_release},
        conn::{Conn, WrState},
        digest,
    },
};

bitflags::bitflags! {
    /// Flags for queueing a response batch.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub(crate) struct InitWrite: u8 {
        /// Wake the writer side after queueing.
        const WAKE = 0x1;
        /// Drop the parent request from the ITT hash before the batch
        /// starts transmitting.
        const REMOVE_HASH = 0x2;
    }
}

/// Queue a batch of responses for transmission.
///
/// The parent request leaves the ITT hash before the first PDU is
/// queued: a release delayed past transmission would otherwise race an
/// initiator reusing the ITT into a false duplicate-task reject.
pub(crate) fn cmnds_init_write(send: Vec<Arc<Cmnd>>, flags: InitWrite) {
    let Some(first) = send.first() else {
        return;
    };
    let conn = first.conn();

    if flags.contains(InitWrite::REMOVE_HASH)
        && let Some(parent) = first.parent_req()
        && parent.hashed.load(Ordering::SeqCst)
        && parent.outstanding_r2t.load(Ordering::SeqCst) == 0
    {
        parent.session().remove_hash(parent);
    }

    for cmnd in send {
        debug!(id = cmnd.id(), opcode = cmnd.opcode_raw(), "queueing for tx");

        if conn.ddigest.enabled() && cmnd.datasize() != 0 {
            *cmnd.tx_ddigest.lock() = Some(digest::digest_tx_data(&cmnd));
        }

        conn.add_to_write_list(cmnd);
    }

    if flags.contains(InitWrite::WAKE) {
        make_conn_wr_active(&conn);
    }
}

/// Queue a single response.
pub(crate) fn cmnd_init_write(rsp: Arc<Cmnd>, flags: InitWrite) {
    if rsp.on_write_list.load(Ordering::SeqCst) {
        error!(id = rsp.id(), "cmd already on write list");
        return;
    }
    cmnds_init_write(vec![rsp], flags);
}

/// Hand the connection to the writer pool unless someone is already
/// draining it.
pub(crate) fn make_conn_wr_active(conn: &Arc<Conn>) {
    let mut st = conn.wr_state.lock();
    if *st == WrState::Idle {
        *st = WrState::InList;
        let _ = conn.wr_tx.send(Arc::clone(conn));
    }
}

/// Opportunistic inline drain: if the connection is idle (or queued but
/// unclaimed), claim it and send on the producing task until the queue
/// empties. Otherwise leave it to the writer pool.
pub(crate) async fn try_local_processing(conn: &Arc<Conn>) {
    let local = {
        let mut st = conn.wr_state.lock();
        match *st {
            WrState::Idle | WrState::InList => {
                *st = WrState::Processing;
                true
            },
            WrState::Processing => false,
        }
    };

    if local {
        drain_writes(conn).await;
    }
}

/// Send queued responses until the list empties or the connection
/// faults, then settle the wr_state machine.
async fn drain_writes(conn: &Arc<Conn>) {
    let mut ok = true;
    while ok && !conn.is_closed() && conn.write_ready() {
        match iscsi_send(conn).await {
            Ok(_) => {},
            Err(e) => {
                warn!(cid = conn.cid, "send failed: {e}");
                conn.mark_closed();
                ok = false;
            },
        }
    }

    let mut st = conn.wr_state.lock();
    if ok && conn.write_ready() && !conn.is_closed() {
        *st = WrState::InList;
        let _ = conn.wr_tx.send(Arc::clone(conn));
    } else {
        *st = WrState::Idle;
    }
}

/// Start `threads` writer tasks draining the shared write-ready queue.
pub(crate) fn spawn_writer_pool(
    wr_rx: mpsc::UnboundedReceiver<Arc<Conn>>,
    threads: usize,
) {
    let rx = Arc::new(tokio::sync::Mutex::new(wr_rx));
    for _ in 0..threads {
        let rx = Arc::clone(&rx);
        tokio::spawn(async move {
            loop {
                let conn = { rx.lock().await.recv().await };
                let Some(conn) = conn else {
                    return;
                };
                let claimed = {
                    let mut st = conn.wr_state.lock();
                    if *st == WrState::InList {
                        *st = WrState::Processing;
                        true
                    } else {
                        false
                    }
                };
                if claimed {
                    drain_writes(&conn).await;
                }
            }
        });
    }
}

/// Transmit one queued response: stamp its sequence numbers, frame the
/// header, digests and padded payload into one buffer, and push the
/// whole burst out in a single write.
pub(crate) async fn iscsi_send(conn: &Arc<Conn>) -> Result<()> {
    let Some(rsp) = conn.next_to_write() else {
        return Ok(());
    };

    cmnd_tx_start(&rsp);

    let frame = frame_pdu(conn, &rsp);
    {
        let mut sock = conn.sock_tx.lock().await;
        sock.write_all(&frame).await?;
        sock.flush().await?;
    }

    cmnd_tx_end(conn, &rsp);
    rsp_cmnd_release(rsp);
    Ok(())
}

/// Stamp sequence numbers per opcode. Status-bearing PDUs consume a
/// StatSN; R2T records the current value without consuming it.
fn cmnd_tx_start(cmnd: &Arc<Cmnd>) {
    let session = cmnd.session();
    match cmnd.opcode() {
        Some(Opcode::ScsiDataIn) => {
            let set_stat = cmnd.bhs()[1] & 0x01 != 0; // S bit
            session.stamp_response_sn(cmnd, set_stat);
        },
        Some(Opcode::ReadyToTransfer) => {
            let stat_sn = session.stamp_response_sn(cmnd, false);
            cmnd.update_bhs(|bhs| {
                bhs[24..28].copy_from_slice(&stat_sn.to_be_bytes());
            });
        },
        Some(
            Opcode::NopIn
            | Opcode::ScsiCommandResp
            | Opcode::ScsiTaskMgmtResp
            | Opcode::TextResp
            | Opcode::LogoutResp
            | Opcode::AsyncMsg
            | Opcode::Reject,
        ) => {
            session.stamp_response_sn(cmnd, true);
        },
        other => {
            error!(id = cmnd.id(), ?other, "unexpected cmnd op on tx");
        },
    }
}

fn cmnd_tx_end(conn: &Arc<Conn>, cmnd: &Arc<Cmnd>) {
    debug!(
        id = cmnd.id(),
        opcode = cmnd.opcode_raw(),
        should_close = cmnd.should_close_conn.load(Ordering::SeqCst),
        "tx end"
    );

    if cmnd.should_close_conn.load(Ordering::SeqCst) {
        warn!(
            initiator = %conn.session().params.initiator_name,
            "closing connection at initiator request"
        );
        conn.mark_closed();
    }
}

/// The payload window this command puts on the wire: a Data-In selects
/// `[buffer_offset, buffer_offset + datasize)` of the shared read
/// buffer; everything else sends the front of its own buffer.
pub(crate) fn tx_payload(cmnd: &Cmnd) -> Bytes {
    let datasize = cmnd.datasize() as usize;
    if datasize == 0 {
        return Bytes::new();
    }

    let offset = if cmnd.opcode() == Some(Opcode::ScsiDataIn) {
        let bhs = cmnd.bhs();
        u32::from_be_bytes([bhs[40], bhs[41], bhs[42], bhs[43]]) as usize
    } else {
        0
    };

    let sg = cmnd.sg.lock();
    let avail = sg.len();
    if offset + datasize > avail {
        error!(
            id = cmnd.id(),
            offset, datasize, avail, "payload window out of bounds"
        );
        return sg.slice(0, avail.min(datasize));
    }
    sg.slice(offset, datasize)
}

/// Assemble the complete wire image of one PDU: BHS, header digest,
/// padded payload, data digest.
fn frame_pdu(conn: &Arc<Conn>, cmnd: &Arc<Cmnd>) -> BytesMut {
    let bhs = cmnd.bhs();
    let payload = tx_payload(cmnd);
    let pad = pad_len(payload.len());

    let hd = conn.hdigest.enabled();
    let dd = conn.ddigest.enabled() && !payload.is_empty();

    let mut out = BytesMut::with_capacity(
        HEADER_LEN + 4 * hd as usize + payload.len() + pad + 4 * dd as usize,
    );
    out.put_slice(&bhs);
    if hd {
        out.put_u32(compute_header_digest(&bhs, &[]));
    }
    out.put_slice(&payload);
    out.put_bytes(0, pad);
    if dd {
        let dig = cmnd
            .tx_ddigest
            .lock()
            .unwrap_or_else(|| digest::digest_tx_data(cmnd));
        out.put_u32(dig);
    }
    out
}

/// Build a SCSI Response carrying `status` (and a sense blob for CHECK
/// CONDITION) as a child of `req`. Sequence numbers are stamped at
/// transmit time.
pub(crate) fn create_status_rsp(
    req: &Arc<Cmnd>,
    status: ScsiStatus,
    sense: Option<&[u8]>,
) -> Arc<Cmnd> {
    let rsp = req.create_rsp_cmnd();
    debug!(req = req.id(), rsp = rsp.id(), ?status, "status rsp");

    let builder = ScsiCommandResponseBuilder::new().status(status);
    let req_bhs = req.bhs();
    rsp.update_bhs(|bhs| {
        bhs.copy_from_slice(builder.header.as_bytes());
        bhs[16..20].copy_from_slice(&req_bhs[16..20]); // echo raw ITT
    });

    if status == ScsiStatus::CheckCondition {
        let sense = sense.unwrap_or(&[]);
        let mut blob = BytesMut::with_capacity(2 + sense.len() + 3);
        blob.put_u16(sense.len() as u16);
        blob.put_slice(sense);
        let datasize = blob.len() as u32;
        blob.put_bytes(0, pad_len(blob.len()));
        rsp.set_owned_buffer(blob);
        rsp.set_datasize(datasize);
    }

    rsp
}

/// Build a CHECK CONDITION response with a fixed-format sense built
/// from (key, asc, ascq).
pub(crate) fn create_sense_rsp(
    req: &Arc<Cmnd>,
    sense_key: u8,
    asc: u8,
    ascq: u8,
) -> Arc<Cmnd> {
    let fixed = crate::models::data::sense_data::SenseData::fixed(sense_key, asc, ascq);
    create_status_rsp(req, ScsiStatus::CheckCondition, Some(&fixed))
}

/// Emit the Data-In burst for a completed read: the payload segmented
/// at MaxXmitDataSegmentLength, DataSN counting up, FINAL on the last
/// chunk, status collapsed into it when `send_status`, and residual
/// flags describing the difference between the expected and produced
/// read sizes.
pub(crate) fn send_data_rsp(req: &Arc<Cmnd>, status: ScsiStatus, send_status: bool) {
    let conn = req.conn();
    let pdusize = conn.session().params.max_xmit_data_length;
    let expsize = req.read_size();
    let bufflen = req.bufflen.load(Ordering::SeqCst);
    let mut size = expsize.min(bufflen);
    let mut offset = 0u32;
    let mut sn = 0u32;

    debug!(req = req.id(), expsize, bufflen, "data rsp");

    let full = {
        let sg = req.sg.lock();
        sg.slice(0, bufflen as usize)
    };
    let req_bhs = req.bhs();

    let mut send = Vec::new();
    loop {
        let rsp = req.create_rsp_cmnd();
        rsp.set_shared_buffer(full.clone());

        let last = size <= pdusize;
        let chunk = size.min(pdusize);

        let mut builder = ScsiDataInBuilder::new()
            .buffer_offset(offset)
            .data_sn(sn);
        if last {
            builder = builder.final_bit();
            if send_status {
                builder = builder.status(status);
            }
            let resid = if bufflen < expsize {
                builder.header.flags.set_u(true);
                expsize - bufflen
            } else if bufflen > expsize {
                builder.header.flags.set_o(true);
                bufflen - expsize
            } else {
                0
            };
            builder.header.residual_count.set(resid);
        }

        rsp.update_bhs(|bhs| {
            bhs.copy_from_slice(builder.header.as_bytes());
            bhs[16..20].copy_from_slice(&req_bhs[16..20]); // echo raw ITT
        });
        rsp.set_datasize(chunk);
        send.push(rsp);

        if last {
            break;
        }
        size -= pdusize;
        offset += pdusize;
        sn += 1;
    }

    cmnds_init_write(send, InitWrite::REMOVE_HASH);
}
