// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The target-side iSCSI protocol engine: per-connection receive /
//! execute / transmit pipelines, the session CmdSN reorder window, R2T
//! write solicitation, and task-management aborts, in front of an
//! abstract SCSI backend executor.

/// SCSI backend trait and engine-side callback entry points.
pub mod backend;
/// Reference-counted command object carrying one PDU.
pub mod cmnd;
/// Per-connection state: StatSN, command list, write list.
pub mod conn;
/// Data digest helpers over command payloads.
pub mod digest;
/// Head-of-order opcode dispatch and R2T issuance.
pub mod exec;
/// Per-PDU receive pipeline.
pub mod rx;
/// Session state: ITT hash, CmdSN window, pending reorder list.
pub mod session;
/// Task-management functions and abort plumbing.
pub mod tm;
/// Response batching, sequence stamping, and the send path.
pub mod tx;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    cfg::config::{Config, SessionParams},
    target::{backend::ScsiBackend, conn::Conn, session::Session},
};

/// One exported iSCSI target: a backend, its sessions, and the shared
/// writer pool feeding ready connections.
pub struct Target {
    pub name: String,
    pub(crate) backend: Arc<dyn ScsiBackend>,
    pub(crate) sessions: Mutex<Vec<Arc<Session>>>,
    wr_tx: mpsc::UnboundedSender<Arc<Conn>>,
}

impl Target {
    /// Bring the target up: remember the backend and start the writer
    /// pool, sized `max(online CPUs, 2)` unless the config overrides it.
    pub fn start(
        name: impl Into<String>,
        cfg: &Config,
        backend: Arc<dyn ScsiBackend>,
    ) -> Arc<Self> {
        let (wr_tx, wr_rx) = mpsc::unbounded_channel::<Arc<Conn>>();
        let target = Arc::new(Target {
            name: name.into(),
            backend,
            sessions: Mutex::new(Vec::new()),
            wr_tx,
        });

        let threads = cfg
            .runtime
            .worker_threads
            .unwrap_or_else(|| num_cpus::get().max(2));
        debug!(threads, target = %target.name, "starting writer pool");
        tx::spawn_writer_pool(wr_rx, threads);

        target
    }

    /// Register a logged-in session with its negotiated parameters.
    pub fn create_session(self: &Arc<Self>, params: SessionParams) -> Arc<Session> {
        let session = Session::new(params, Arc::downgrade(self));
        self.sessions.lock().push(Arc::clone(&session));
        session
    }

    /// Drop a session from the target (logout / connection teardown).
    pub fn remove_session(&self, session: &Arc<Session>) {
        self.sessions
            .lock()
            .retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Attach an established, negotiated connection to a session and
    /// start its reader. The login phase is expected to have happened
    /// elsewhere; the engine takes over at the full-feature phase.
    pub fn add_connection<R, W>(
        self: &Arc<Self>,
        session: &Arc<Session>,
        cid: u16,
        reader: R,
        writer: W,
    ) -> Arc<Conn>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Conn::new(session, cid, Box::new(writer), self.wr_tx.clone());
        session.attach_conn(&conn);

        let rd_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            if let Err(e) = rx::run_read_loop(Arc::clone(&rd_conn), reader).await {
                warn!(cid = rd_conn.cid, "read loop exited: {e}");
            }
            tm::conn_abort(&rd_conn);
            rd_conn.mark_closed();
        });

        conn
    }
}
