// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, warn};
use zerocopy::FromBytes as ZFromBytes;

use crate::{
    models::{
        command::request::ScsiCommandRequest,
        command::response::ScsiCommandResponse,
        common::{HEADER_LEN, RESERVED_TAG},
        opcode::Opcode,
    },
    target::{backend::PreprocStatus, conn::Conn, session::Session},
};

static NEXT_CMND_ID: AtomicU64 = AtomicU64::new(1);

/// One received or generated PDU: the fixed header, optional AHS bytes,
/// and the length of the data segment that travels with it.
#[derive(Debug)]
pub struct Pdu {
    pub bhs: [u8; HEADER_LEN],
    pub ahs: Option<Bytes>,
    pub datasize: u32,
}

impl Default for Pdu {
    fn default() -> Self {
        Pdu {
            bhs: [0u8; HEADER_LEN],
            ahs: None,
            datasize: 0,
        }
    }
}

/// Where a command is in its life at the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendState {
    New = 0,
    RxCmd = 1,
    AfterPreproc = 2,
    Restarted = 3,
    Processed = 4,
}

impl BackendState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BackendState::RxCmd,
            2 => BackendState::AfterPreproc,
            3 => BackendState::Restarted,
            4 => BackendState::Processed,
            _ => BackendState::New,
        }
    }
}

/// How the end-of-PDU routing should treat this command. Start-phase
/// errors rewrite the disposition instead of the wire opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Disposition {
    /// Route by wire opcode.
    Normal = 0,
    /// A reject response is attached; flush it instead of executing.
    PduReject = 1,
    /// An unmatched Data-Out; payload skipped, release at end.
    DataReject = 2,
    /// A SCSI response was preposted during the start phase; still goes
    /// through CmdSN ordering, then flushes the response.
    ScsiPreposted = 3,
}

impl Disposition {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Disposition::PduReject,
            2 => Disposition::DataReject,
            3 => Disposition::ScsiPreposted,
            _ => Disposition::Normal,
        }
    }
}

/// Data segment attached to a command: either a buffer the command owns
/// (write payloads, sense blobs, reject payloads) or a read-only window
/// shared with the parent request (read bursts).
pub(crate) enum DataBuf {
    None,
    Owned(BytesMut),
    Shared(Bytes),
}

impl DataBuf {
    pub(crate) fn len(&self) -> usize {
        match self {
            DataBuf::None => 0,
            DataBuf::Owned(b) => b.len(),
            DataBuf::Shared(b) => b.len(),
        }
    }

    pub(crate) fn slice(&self, from: usize, len: usize) -> Bytes {
        match self {
            DataBuf::None => Bytes::new(),
            DataBuf::Owned(b) => Bytes::copy_from_slice(&b[from..from + len]),
            DataBuf::Shared(b) => b.slice(from..from + len),
        }
    }
}

/// Reference-counted carrier of one PDU: a request received from the
/// initiator or a response produced for one. Responses hold a strong
/// reference to their parent request; the parent keeps only weak links
/// to enumerate its responses.
pub struct Cmnd {
    id: u64,
    conn: Arc<Conn>,
    parent_req: Option<Arc<Cmnd>>,

    pub(crate) pdu: Mutex<Pdu>,
    pub(crate) sg: Mutex<DataBuf>,
    pub(crate) bufflen: AtomicU32,

    // request-side protocol state
    pub(crate) hashed: AtomicBool,
    pub(crate) r2t_length: AtomicU32,
    pub(crate) r2t_to_solicit: AtomicU32,
    pub(crate) r2t_sn: AtomicU32,
    pub(crate) outstanding_r2t: AtomicU32,
    pub(crate) is_unsolicited_data: AtomicBool,
    pub(crate) target_task_tag: AtomicU32,
    pub(crate) pending: AtomicBool,
    pub(crate) data_waiting: AtomicBool,
    pub(crate) tmfabort: AtomicBool,
    disposition: AtomicU8,

    // response-side state
    pub(crate) on_write_list: AtomicBool,
    pub(crate) write_processing_started: AtomicBool,
    pub(crate) force_cleanup_done: AtomicBool,
    pub(crate) should_close_conn: AtomicBool,
    pub(crate) tx_ddigest: Mutex<Option<u32>>,

    // backend coupling
    state: AtomicU8,
    state_changed: Notify,
    pub(crate) has_backend: AtomicBool,

    // lists
    pub(crate) rsp_cmd_list: Mutex<Vec<Weak<Cmnd>>>,
    preposted_rsp: Mutex<Option<Arc<Cmnd>>>,
    pub(crate) rx_ddigest_cmd_list: Mutex<Vec<Arc<Cmnd>>>,
    pub(crate) cmd_req: Mutex<Option<Arc<Cmnd>>>,
    pub(crate) rx_ddigest: AtomicU32,
}

impl Cmnd {
    /// Allocate a fresh command bound to `conn`; a `parent` makes it a
    /// response linked into the parent's response list.
    pub fn alloc(conn: &Arc<Conn>, parent: Option<&Arc<Cmnd>>) -> Arc<Cmnd> {
        let cmnd = Arc::new(Cmnd {
            id: NEXT_CMND_ID.fetch_add(1, Ordering::Relaxed),
            conn: Arc::clone(conn),
            parent_req: parent.cloned(),
            pdu: Mutex::new(Pdu::default()),
            sg: Mutex::new(DataBuf::None),
            bufflen: AtomicU32::new(0),
            hashed: AtomicBool::new(false),
            r2t_length: AtomicU32::new(0),
            r2t_to_solicit: AtomicU32::new(0),
            r2t_sn: AtomicU32::new(0),
            outstanding_r2t: AtomicU32::new(0),
            is_unsolicited_data: AtomicBool::new(false),
            target_task_tag: AtomicU32::new(RESERVED_TAG),
            pending: AtomicBool::new(false),
            data_waiting: AtomicBool::new(false),
            tmfabort: AtomicBool::new(false),
            disposition: AtomicU8::new(Disposition::Normal as u8),
            on_write_list: AtomicBool::new(false),
            write_processing_started: AtomicBool::new(false),
            force_cleanup_done: AtomicBool::new(false),
            should_close_conn: AtomicBool::new(false),
            tx_ddigest: Mutex::new(None),
            state: AtomicU8::new(BackendState::New as u8),
            state_changed: Notify::new(),
            has_backend: AtomicBool::new(false),
            rsp_cmd_list: Mutex::new(Vec::new()),
            preposted_rsp: Mutex::new(None),
            rx_ddigest_cmd_list: Mutex::new(Vec::new()),
            cmd_req: Mutex::new(None),
            rx_ddigest: AtomicU32::new(0),
        });

        match parent {
            Some(p) => {
                p.rsp_cmd_list.lock().push(Arc::downgrade(&cmnd));
                debug!(rsp = cmnd.id, req = p.id, "adding rsp to parent");
            },
            None => {
                conn.cmd_list.lock().push(Arc::downgrade(&cmnd));
            },
        }

        cmnd
    }

    /// Create a response command for this request.
    pub fn create_rsp_cmnd(self: &Arc<Self>) -> Arc<Cmnd> {
        Cmnd::alloc(&self.conn, Some(self))
    }

    /// Newest live response of this request, if any.
    pub fn get_rsp_cmnd(&self) -> Option<Arc<Cmnd>> {
        self.rsp_cmd_list
            .lock()
            .iter()
            .rev()
            .find_map(|w| w.upgrade())
    }

    /// Park a built-but-unqueued response (reject, preposted status)
    /// until the end-of-PDU path flushes it.
    pub(crate) fn stash_preposted(&self, rsp: Arc<Cmnd>) {
        if let Some(old) = self.preposted_rsp.lock().replace(rsp) {
            warn!(req = self.id, rsp = old.id, "dropping earlier preposted rsp");
        }
    }

    pub(crate) fn take_preposted(&self) -> Option<Arc<Cmnd>> {
        self.preposted_rsp.lock().take()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn conn(&self) -> Arc<Conn> {
        Arc::clone(&self.conn)
    }

    #[inline]
    pub fn session(&self) -> Arc<Session> {
        self.conn.session()
    }

    #[inline]
    pub fn parent_req(&self) -> Option<&Arc<Cmnd>> {
        self.parent_req.as_ref()
    }

    // ---- BHS field access (generic header layout, like the wire) ----

    pub fn bhs(&self) -> [u8; HEADER_LEN] {
        self.pdu.lock().bhs
    }

    pub fn update_bhs(&self, f: impl FnOnce(&mut [u8; HEADER_LEN])) {
        f(&mut self.pdu.lock().bhs)
    }

    pub fn datasize(&self) -> u32 {
        self.pdu.lock().datasize
    }

    pub fn set_datasize(&self, size: u32) {
        let mut pdu = self.pdu.lock();
        pdu.datasize = size;
        let be = size.to_be_bytes();
        pdu.bhs[5..8].copy_from_slice(&be[1..4]);
    }

    pub fn ahs(&self) -> Option<Bytes> {
        self.pdu.lock().ahs.clone()
    }

    #[inline]
    pub fn opcode_raw(&self) -> u8 {
        self.pdu.lock().bhs[0] & 0x3F
    }

    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u6(self.opcode_raw())
    }

    #[inline]
    pub fn is_immediate(&self) -> bool {
        self.pdu.lock().bhs[0] & 0x40 != 0
    }

    fn bhs_u32(&self, off: usize) -> u32 {
        let pdu = self.pdu.lock();
        u32::from_be_bytes([
            pdu.bhs[off],
            pdu.bhs[off + 1],
            pdu.bhs[off + 2],
            pdu.bhs[off + 3],
        ])
    }

    /// Initiator task tag (bytes 16..20 on every PDU).
    #[inline]
    pub fn itt(&self) -> u32 {
        self.bhs_u32(16)
    }

    /// Target transfer tag field (bytes 20..24 where the PDU has one).
    #[inline]
    pub fn ttt_field(&self) -> u32 {
        self.bhs_u32(20)
    }

    /// CmdSN of a request PDU (bytes 24..28).
    #[inline]
    pub fn cmd_sn(&self) -> u32 {
        self.bhs_u32(24)
    }

    /// ExpStatSN of a request PDU (bytes 28..32).
    #[inline]
    pub fn exp_stat_sn_field(&self) -> u32 {
        self.bhs_u32(28)
    }

    /// Raw 8-byte LUN field (bytes 8..16).
    pub fn lun_raw(&self) -> u64 {
        let pdu = self.pdu.lock();
        let mut b = [0u8; 8];
        b.copy_from_slice(&pdu.bhs[8..16]);
        u64::from_be_bytes(b)
    }

    /// FINAL bit of the request flags byte.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.pdu.lock().bhs[1] & 0x80 != 0
    }

    // ---- SCSI command request views ----

    /// Declared write length of a SCSI command, zero for non-writes.
    pub fn write_size(&self) -> u32 {
        let bhs = self.bhs();
        match ScsiCommandRequest::ref_from_bytes(&bhs) {
            Ok(hdr) => hdr.write_size(),
            Err(_) => 0,
        }
    }

    /// Declared read length of a SCSI command. Bidirectional commands
    /// announce it in an expected-read-length AHS (type 0x02).
    pub fn read_size(&self) -> u32 {
        let bhs = self.bhs();
        let Ok(hdr) = ScsiCommandRequest::ref_from_bytes(&bhs) else {
            return 0;
        };
        if !hdr.flags.read() {
            return 0;
        }
        if !hdr.flags.write() {
            return hdr.expected_data_transfer_length.get();
        }
        // Bidirectional: AHS layout is length(2) | type(1) | rsvd(1) |
        // read length(4), all big-endian.
        if let Some(ahs) = self.ahs()
            && ahs.len() >= 8
            && ahs[2] == 0x02
        {
            return u32::from_be_bytes([ahs[4], ahs[5], ahs[6], ahs[7]]);
        }
        0
    }

    /// Patch residual flags/count into a SCSI Response header owned by
    /// this command. Positive = underflow, negative = overflow.
    pub fn set_scsi_rsp_residual(&self, resid: i64) {
        let mut pdu = self.pdu.lock();
        if let Ok(hdr) = ScsiCommandResponse::mut_from_bytes(&mut pdu.bhs) {
            hdr.set_residual(resid);
        }
    }

    /// Patch the bidirectional-read residual of a SCSI Response header
    /// owned by this command.
    pub fn set_scsi_rsp_bidir_residual(&self, resid: i64) {
        let mut pdu = self.pdu.lock();
        if let Ok(hdr) = ScsiCommandResponse::mut_from_bytes(&mut pdu.bhs) {
            if resid > 0 {
                hdr.flags.set_u_small(true);
                hdr.bidirectional_read_residual_count.set(resid as u32);
            } else if resid < 0 {
                hdr.flags.set_o_small(true);
                hdr.bidirectional_read_residual_count.set((-resid) as u32);
            }
        }
    }

    // ---- buffers ----

    /// Hand the command an owned scatter buffer (write payloads).
    pub(crate) fn set_owned_buffer(&self, buf: BytesMut) {
        self.bufflen.store(buf.len() as u32, Ordering::SeqCst);
        *self.sg.lock() = DataBuf::Owned(buf);
    }

    /// Share a read-only payload (read bursts, echoed ping data).
    pub(crate) fn set_shared_buffer(&self, buf: Bytes) {
        self.bufflen.store(buf.len() as u32, Ordering::SeqCst);
        *self.sg.lock() = DataBuf::Shared(buf);
    }

    /// Snapshot of the command's data buffer, as a backend sees the
    /// received write payload.
    pub fn data_buf(&self) -> Bytes {
        let sg = self.sg.lock();
        sg.slice(0, sg.len())
    }

    /// Freeze this command's owned buffer into a shareable one and
    /// return it (NOP payload echo).
    pub(crate) fn freeze_buffer(&self) -> Bytes {
        let mut sg = self.sg.lock();
        match std::mem::replace(&mut *sg, DataBuf::None) {
            DataBuf::None => Bytes::new(),
            DataBuf::Owned(b) => {
                let frozen = b.freeze();
                *sg = DataBuf::Shared(frozen.clone());
                frozen
            },
            DataBuf::Shared(b) => {
                *sg = DataBuf::Shared(b.clone());
                b
            },
        }
    }

    // ---- disposition / backend state ----

    #[inline]
    pub(crate) fn disposition(&self) -> Disposition {
        Disposition::from_u8(self.disposition.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn set_disposition(&self, d: Disposition) {
        self.disposition.store(d as u8, Ordering::SeqCst);
    }

    #[inline]
    pub fn backend_state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_backend_state(&self, s: BackendState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    /// Producer side of the state wait: publish the new state, then wake
    /// the reader parked in [`Cmnd::wait_state_change`]. The `Arc` this
    /// method is called through keeps the command alive across the wake.
    pub fn set_state_wake(self: &Arc<Self>, s: BackendState) {
        let guard = Arc::clone(self);
        guard.set_backend_state(s);
        guard.state_changed.notify_waiters();
        drop(guard);
    }

    /// Park until the backend state leaves `current`. The waiter is
    /// registered before the state re-check, so a wake between the check
    /// and the await cannot be lost.
    pub async fn wait_state_change(&self, current: BackendState) {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.backend_state() != current {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Cmnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmnd")
            .field("id", &self.id)
            .field("opcode", &self.opcode())
            .field("itt", &format_args!("{:#x}", self.itt()))
            .field("is_rsp", &self.parent_req.is_some())
            .field("state", &self.backend_state())
            .finish()
    }
}

impl Drop for Cmnd {
    fn drop(&mut self) {
        let me = self as *const Cmnd;

        if self.on_write_list.load(Ordering::SeqCst) {
            error!(id = self.id, "cmnd dropped while still on write list");
        }

        match &self.parent_req {
            Some(parent) => {
                parent
                    .rsp_cmd_list
                    .lock()
                    .retain(|w| !std::ptr::eq(w.as_ptr(), me));
            },
            None => {
                self.conn
                    .cmd_list
                    .lock()
                    .retain(|w| !std::ptr::eq(w.as_ptr(), me));

                if self.has_backend.load(Ordering::SeqCst)
                    && let Some(target) = self.conn.session().target()
                {
                    match self.backend_state() {
                        BackendState::AfterPreproc => {
                            debug!(id = self.id, "releasing unrestarted cmnd");
                            self.set_backend_state(BackendState::Restarted);
                            target.backend.restart_cmd(self, PreprocStatus::ErrorFatal);
                        },
                        BackendState::Processed => {
                            target.backend.tgt_cmd_done(self);
                        },
                        other => {
                            error!(id = self.id, ?other, "unexpected cmnd backend state");
                        },
                    }
                }
            },
        }
    }
}

/// Release a request: drop queued digest-check Data-Outs, unhash, and
/// give up the pipeline's reference. Mirrors every `get` with its `put`.
pub(crate) fn req_cmnd_release(req: Arc<Cmnd>) {
    debug_assert!(req.parent_req.is_none());

    if req.tmfabort.load(Ordering::SeqCst) {
        debug!(id = req.id, "release aborted req");
    }

    req.rx_ddigest_cmd_list.lock().clear();

    if req.hashed.load(Ordering::SeqCst) {
        req.session().remove_hash(&req);
    }

    drop(req);
}

/// Force-release a request under abort: cancel its queued write-list
/// responses (transmissions already started run to completion), drop
/// any preposted response, then release normally.
pub(crate) fn req_cmnd_release_force(req: Arc<Cmnd>, drain_write_list: bool) {
    debug!(id = req.id(), "force release");

    if drain_write_list {
        let conn = req.conn();
        loop {
            let rsp = {
                let mut wl = conn.write_list.lock();
                wl.pop_front()
            };
            match rsp {
                Some(rsp) => {
                    rsp.on_write_list.store(false, Ordering::SeqCst);
                    rsp.force_cleanup_done.store(true, Ordering::SeqCst);
                    drop(rsp);
                },
                None => break,
            }
        }
    }

    if let Some(rsp) = req.take_preposted() {
        if !rsp.write_processing_started.load(Ordering::SeqCst) {
            rsp.force_cleanup_done.store(true, Ordering::SeqCst);
            drop(rsp);
        } else {
            // Transmission owns it again; put it back for the sender.
            req.stash_preposted(rsp);
        }
    }

    req_cmnd_release(req);
}

/// Release a response after transmission (or cleanup).
pub(crate) fn rsp_cmnd_release(rsp: Arc<Cmnd>) {
    debug_assert!(!rsp.hashed.load(Ordering::SeqCst));
    debug_assert!(rsp.parent_req.is_some());
    drop(rsp);
}
