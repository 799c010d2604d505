// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{io::AsyncWrite, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cfg::enums::Digest,
    target::{cmnd::Cmnd, session::Session},
};

/// Where a connection stands with respect to the writer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrState {
    /// No queued responses, nobody draining.
    Idle,
    /// Queued on the shared write-ready list for the writer pool.
    InList,
    /// Some thread is draining the write list right now.
    Processing,
}

pub(crate) type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One TCP connection of a session: response sequencing state, the list
/// of in-flight requests, and the queue of responses awaiting
/// transmission.
pub struct Conn {
    session: Arc<Session>,
    pub cid: u16,

    /// Next StatSN to stamp on a status-bearing outgoing PDU.
    pub(crate) stat_sn: AtomicU32,
    /// Highest StatSN the initiator has acknowledged.
    pub(crate) exp_stat_sn: AtomicU32,

    /// All in-flight root requests received on this connection.
    pub(crate) cmd_list: Mutex<Vec<std::sync::Weak<Cmnd>>>,
    /// Responses queued for transmission, in queue order.
    pub(crate) write_list: Mutex<VecDeque<Arc<Cmnd>>>,
    pub(crate) wr_state: Mutex<WrState>,
    pub(crate) wr_tx: mpsc::UnboundedSender<Arc<Conn>>,

    pub(crate) sock_tx: tokio::sync::Mutex<ConnWriter>,

    pub(crate) hdigest: Digest,
    pub(crate) ddigest: Digest,

    closed: CancellationToken,
}

impl Conn {
    pub(crate) fn new(
        session: &Arc<Session>,
        cid: u16,
        writer: ConnWriter,
        wr_tx: mpsc::UnboundedSender<Arc<Conn>>,
    ) -> Arc<Conn> {
        Arc::new(Conn {
            session: Arc::clone(session),
            cid,
            stat_sn: AtomicU32::new(0),
            exp_stat_sn: AtomicU32::new(0),
            cmd_list: Mutex::new(Vec::new()),
            write_list: Mutex::new(VecDeque::new()),
            wr_state: Mutex::new(WrState::Idle),
            wr_tx,
            sock_tx: tokio::sync::Mutex::new(writer),
            hdigest: session.params.header_digest,
            ddigest: session.params.data_digest,
            closed: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Seed StatSN from the login phase.
    pub fn set_stat_sn(&self, sn: u32) {
        self.stat_sn.store(sn, Ordering::SeqCst);
    }

    pub fn stat_sn(&self) -> u32 {
        self.stat_sn.load(Ordering::SeqCst)
    }

    pub fn exp_stat_sn(&self) -> u32 {
        self.exp_stat_sn.load(Ordering::SeqCst)
    }

    /// Mark the connection closed; the reader loop and send paths stop
    /// at their next checkpoint. The surrounding connection manager is
    /// responsible for draining in-flight commands via `conn_abort`.
    pub fn mark_closed(&self) {
        if !self.closed.is_cancelled() {
            debug!(cid = self.cid, "marking conn closed");
            self.closed.cancel();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Append a response to the transmit queue. Caller holds no locks.
    pub(crate) fn add_to_write_list(&self, rsp: Arc<Cmnd>) {
        rsp.on_write_list.store(true, Ordering::SeqCst);
        self.write_list.lock().push_back(rsp);
    }

    /// Pop the next response to transmit, marking it in-progress while
    /// still under the write-list lock so force-cleanup cannot cancel a
    /// transmission that has begun.
    pub(crate) fn next_to_write(&self) -> Option<Arc<Cmnd>> {
        let mut wl = self.write_list.lock();
        let rsp = wl.pop_front()?;
        rsp.on_write_list.store(false, Ordering::SeqCst);
        rsp.write_processing_started.store(true, Ordering::SeqCst);
        Some(rsp)
    }

    pub(crate) fn write_ready(&self) -> bool {
        !self.write_list.lock().is_empty()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("cid", &self.cid)
            .field("stat_sn", &self.stat_sn())
            .field("exp_stat_sn", &self.exp_stat_sn())
            .field("closed", &self.is_closed())
            .finish()
    }
}
