// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{
    cfg::config::SessionParams,
    models::{common::RESERVED_TAG, reject::reject_description::RejectReason},
    target::{Target, cmnd::Cmnd, conn::Conn, exec},
};

/// `a` precedes `b` in serial-number arithmetic (RFC 1982, 32-bit).
#[inline]
pub(crate) fn sn_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` follows `b` in serial-number arithmetic.
#[inline]
pub(crate) fn sn_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

/// The CmdSN window: the next expected ordered sequence number plus the
/// list of commands that arrived ahead of it, kept in CmdSN order.
struct SnWindow {
    exp_cmd_sn: u32,
    pending: VecDeque<Arc<Cmnd>>,
}

/// One logged-in initiator session: the ITT hash of in-flight requests,
/// the CmdSN reorder window, the TTT allocator, and the negotiated
/// parameters the engine treats as read-only.
pub struct Session {
    pub params: SessionParams,
    target: Weak<Target>,
    cmnd_hash: DashMap<u32, Arc<Cmnd>>,
    sn: Mutex<SnWindow>,
    next_ttt: AtomicU32,
    pub(crate) conns: Mutex<Vec<Weak<Conn>>>,
}

impl Session {
    pub(crate) fn new(params: SessionParams, target: Weak<Target>) -> Arc<Session> {
        Arc::new(Session {
            params,
            target,
            cmnd_hash: DashMap::new(),
            sn: Mutex::new(SnWindow {
                exp_cmd_sn: 0,
                pending: VecDeque::new(),
            }),
            next_ttt: AtomicU32::new(1),
            conns: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn target(&self) -> Option<Arc<Target>> {
        self.target.upgrade()
    }

    pub(crate) fn attach_conn(&self, conn: &Arc<Conn>) {
        let mut conns = self.conns.lock();
        conns.retain(|w| w.upgrade().is_some());
        conns.push(Arc::downgrade(conn));
    }

    /// Seed the window with the CmdSN login negotiated as the first
    /// expected one.
    pub fn set_exp_cmd_sn(&self, sn: u32) {
        self.sn.lock().exp_cmd_sn = sn;
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.sn.lock().exp_cmd_sn
    }

    /// Allocate the next target task tag, skipping the reserved value.
    pub(crate) fn next_ttt(&self) -> u32 {
        loop {
            let ttt = self.next_ttt.fetch_add(1, Ordering::SeqCst);
            if ttt != RESERVED_TAG {
                return ttt;
            }
        }
    }

    // ---- ITT hash ----

    /// Find an in-flight request by (ITT, TTT); `RESERVED_TAG` as the
    /// TTT matches any.
    pub fn find_hash(&self, itt: u32, ttt: u32) -> Option<Arc<Cmnd>> {
        let entry = self.cmnd_hash.get(&itt)?;
        if ttt != RESERVED_TAG
            && ttt != entry.target_task_tag.load(Ordering::SeqCst)
        {
            return None;
        }
        Some(Arc::clone(entry.value()))
    }

    /// Insert a request into the hash and perform the per-request
    /// sequence bookkeeping: ExpStatSN update and stale-CmdSN check.
    pub fn insert_hash(&self, cmnd: &Arc<Cmnd>) -> Result<(), RejectReason> {
        let itt = cmnd.itt();
        debug!(id = cmnd.id(), itt = format_args!("{itt:#x}"), "hash insert");

        if itt == RESERVED_TAG {
            return Err(RejectReason::ProtocolError);
        }

        let mut inserted = false;
        self.cmnd_hash.entry(itt).or_insert_with(|| {
            inserted = true;
            cmnd.hashed.store(true, Ordering::SeqCst);
            Arc::clone(cmnd)
        });
        if !inserted {
            return Err(RejectReason::TaskInProgress);
        }

        let sn = self.sn.lock();
        self.update_stat_sn_locked(cmnd);
        self.check_cmd_sn_locked(&sn, cmnd)
    }

    /// Remove a request from the hash if it is still the hashed entry.
    pub fn remove_hash(&self, cmnd: &Arc<Cmnd>) {
        let itt = cmnd.itt();
        let removed = self
            .cmnd_hash
            .remove_if(&itt, |_, v| Arc::ptr_eq(v, cmnd))
            .is_some();
        if removed {
            cmnd.hashed.store(false, Ordering::SeqCst);
        } else {
            error!(id = cmnd.id(), itt = format_args!("{itt:#x}"), "not found in hash");
        }
    }

    // ---- sequence bookkeeping ----

    /// Advance the connection's ExpStatSN from an incoming PDU when it
    /// moves forward without passing StatSN.
    pub(crate) fn update_stat_sn(&self, cmnd: &Arc<Cmnd>) {
        let _sn = self.sn.lock();
        self.update_stat_sn_locked(cmnd);
    }

    fn update_stat_sn_locked(&self, cmnd: &Arc<Cmnd>) {
        let conn = cmnd.conn();
        let exp_stat_sn = cmnd.exp_stat_sn_field();
        debug!(
            opcode = cmnd.opcode_raw(),
            exp_stat_sn,
            "ExpStatSN update"
        );
        let recorded = conn.exp_stat_sn.load(Ordering::SeqCst);
        let stat_sn = conn.stat_sn.load(Ordering::SeqCst);
        if sn_after(exp_stat_sn, recorded) && !sn_after(exp_stat_sn, stat_sn) {
            conn.exp_stat_sn.store(exp_stat_sn, Ordering::SeqCst);
        }
    }

    fn check_cmd_sn_locked(
        &self,
        sn: &SnWindow,
        cmnd: &Arc<Cmnd>,
    ) -> Result<(), RejectReason> {
        let cmd_sn = cmnd.cmd_sn();
        debug!(cmd_sn, exp_cmd_sn = sn.exp_cmd_sn, "CmdSN check");
        if !sn_before(cmd_sn, sn.exp_cmd_sn) {
            Ok(())
        } else {
            error!("sequence error ({cmd_sn:#x},{:#x})", sn.exp_cmd_sn);
            Err(RejectReason::ProtocolError)
        }
    }

    /// Validate sequence fields of a PDU that is not hashed (ping-ack
    /// NOP-Out with reserved ITT).
    pub(crate) fn check_cmd_sn(&self, cmnd: &Arc<Cmnd>) -> Result<(), RejectReason> {
        let sn = self.sn.lock();
        self.update_stat_sn_locked(cmnd);
        self.check_cmd_sn_locked(&sn, cmnd)
    }

    /// Push a fully-received command toward the executor, reordering
    /// non-immediate commands by CmdSN. Immediate commands bypass the
    /// window. The window lock is dropped around every executor call.
    pub fn push_cmnd(self: &Arc<Self>, cmnd: Arc<Cmnd>) {
        debug!(
            id = cmnd.id(),
            opcode = cmnd.opcode_raw(),
            cmd_sn = cmnd.cmd_sn(),
            "session push"
        );

        if cmnd.is_immediate() {
            exec::cmnd_exec(cmnd);
            return;
        }

        let cmd_sn = cmnd.cmd_sn();
        {
            let mut sn = self.sn.lock();
            if cmd_sn != sn.exp_cmd_sn {
                cmnd.pending.store(true, Ordering::SeqCst);
                if sn_before(cmd_sn, sn.exp_cmd_sn) {
                    error!("unexpected cmd_sn ({cmd_sn},{})", sn.exp_cmd_sn);
                }
                if sn_after(cmd_sn, sn.exp_cmd_sn.wrapping_add(self.params.max_queued_cmnds))
                {
                    error!("too large cmd_sn ({cmd_sn},{})", sn.exp_cmd_sn);
                }
                let pos = sn
                    .pending
                    .iter()
                    .position(|tmp| sn_before(cmd_sn, tmp.cmd_sn()))
                    .unwrap_or(sn.pending.len());
                sn.pending.insert(pos, cmnd);
                return;
            }
        }

        let mut cur = cmnd;
        loop {
            {
                let mut sn = self.sn.lock();
                sn.exp_cmd_sn = sn.exp_cmd_sn.wrapping_add(1);
            }

            exec::cmnd_exec(cur);

            let next = {
                let mut sn = self.sn.lock();
                let head_ready = sn
                    .pending
                    .front()
                    .map(|head| head.cmd_sn() == sn.exp_cmd_sn)
                    .unwrap_or(false);
                if head_ready { sn.pending.pop_front() } else { None }
            };
            match next {
                Some(head) => {
                    head.pending.store(false, Ordering::SeqCst);
                    cur = head;
                },
                None => break,
            }
        }
    }

    /// Pull a faulted connection's commands out of the reorder window.
    pub(crate) fn drain_pending_for_conn(&self, conn: &Arc<Conn>) -> Vec<Arc<Cmnd>> {
        let mut sn = self.sn.lock();
        let mut drained = Vec::new();
        sn.pending.retain(|cmnd| {
            if Arc::ptr_eq(&cmnd.conn(), conn) {
                drained.push(Arc::clone(cmnd));
                false
            } else {
                true
            }
        });
        drained
    }

    /// Stamp the sequence fields of an outgoing response under the
    /// window lock: StatSN (consumed when `set_stat_sn`), ExpCmdSN and
    /// MaxCmdSN. Returns the StatSN value after stamping, which R2T
    /// records without consuming.
    pub(crate) fn stamp_response_sn(&self, cmnd: &Cmnd, set_stat_sn: bool) -> u32 {
        let conn = cmnd.conn();
        let sn = self.sn.lock();

        let mut pdu = cmnd.pdu.lock();
        if set_stat_sn {
            let stat_sn = conn.stat_sn.fetch_add(1, Ordering::SeqCst);
            pdu.bhs[24..28].copy_from_slice(&stat_sn.to_be_bytes());
        }
        pdu.bhs[28..32].copy_from_slice(&sn.exp_cmd_sn.to_be_bytes());
        let max_cmd_sn = sn.exp_cmd_sn.wrapping_add(self.params.max_queued_cmnds);
        pdu.bhs[32..36].copy_from_slice(&max_cmd_sn.to_be_bytes());

        conn.stat_sn.load(Ordering::SeqCst)
    }
}
