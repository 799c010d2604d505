// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared harness for driving the engine over an in-memory duplex
//! stream with a scriptable SCSI backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use iscsi_target_rs::{
    cfg::{
        config::{
            Config, Flow, Identity, Integrity, NegotiationConfig, Queue,
            RuntimeConfig, SessionParams, WriteFlow,
        },
        enums::{Digest, YesNo},
    },
    models::common::HEADER_LEN,
    target::{
        Target,
        backend::{
            self, DataDirection, ExecResult, MgmtStatus, PreprocStatus, ScsiBackend,
            ScsiCmdParams,
        },
        cmnd::Cmnd,
        conn::Conn,
        session::Session,
    },
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    time::timeout,
};

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub fn test_config() -> Config {
    Config {
        negotiation: NegotiationConfig {
            identity: Identity {
                target_name: "iqn.2004-10.com.example:disk0".to_string(),
                target_alias: String::new(),
            },
            integrity: Integrity {
                header_digest: Digest::None,
                data_digest: Digest::None,
            },
            flow: Flow {
                max_recv_data_segment_length: 8192,
                max_xmit_data_segment_length: 8192,
                max_burst_length: 8192,
                first_burst_length: 8192,
            },
            write_flow: WriteFlow {
                initial_r2t: YesNo::Yes,
                immediate_data: YesNo::No,
                max_outstanding_r2t: 2,
            },
            queue: Queue {
                max_queued_cmnds: 32,
            },
        },
        runtime: RuntimeConfig {
            worker_threads: Some(2),
        },
    }
}

struct BackendEntry {
    cmnd: Weak<Cmnd>,
    params: ScsiCmdParams,
}

/// In-memory SCSI executor: completes commands with scripted results,
/// optionally holding them until the test releases them.
#[derive(Default)]
pub struct MemBackend {
    state: Mutex<HashMap<u64, BackendEntry>>,
    /// Responses keyed by the first CDB byte; anything else completes
    /// GOOD with no data.
    pub responses: Mutex<HashMap<u8, ExecResult>>,
    /// When set, restarted commands park in `held` until
    /// `complete_held` runs.
    pub hold: AtomicBool,
    held: Mutex<Vec<u64>>,
    /// Write payloads captured at execution, as (lun, bytes).
    pub writes: Mutex<Vec<(u64, Bytes)>>,
    /// Task-management calls seen, as (function byte, tag-or-lun).
    pub tm_calls: Mutex<Vec<(u8, u64)>>,
}

impl MemBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_to(&self, cdb0: u8, result: ExecResult) {
        self.responses.lock().insert(cdb0, result);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    pub fn complete_held(&self) {
        let held: Vec<u64> = self.held.lock().drain(..).collect();
        for id in held {
            self.finish(id);
        }
    }

    fn finish(&self, id: u64) {
        let entry = self.state.lock().remove(&id);
        let Some(entry) = entry else {
            return;
        };
        let Some(req) = entry.cmnd.upgrade() else {
            return;
        };

        let result = match backend::pre_exec(&req) {
            Err(sense) => ExecResult {
                status: iscsi_target_rs::models::command::common::ScsiStatus::CheckCondition,
                sense: Some(sense.freeze()),
                data: Bytes::new(),
                send_status: true,
                aborted: false,
            },
            Ok(()) => {
                if entry.params.direction == DataDirection::Write {
                    self.writes
                        .lock()
                        .push((entry.params.lun, req.data_buf()));
                }
                self.responses
                    .lock()
                    .get(&entry.params.cdb[0])
                    .cloned()
                    .unwrap_or_else(ExecResult::good)
            },
        };

        tokio::spawn(backend::xmit_response(req, result));
    }
}

impl ScsiBackend for MemBackend {
    fn rx_cmd(&self, req: &Arc<Cmnd>, params: ScsiCmdParams) -> Result<()> {
        self.state.lock().insert(
            req.id(),
            BackendEntry {
                cmnd: Arc::downgrade(req),
                params,
            },
        );
        Ok(())
    }

    fn init_stage1_done(&self, req: &Arc<Cmnd>) {
        backend::preprocessing_done(req);
    }

    fn restart_cmd(&self, req: &Cmnd, status: PreprocStatus) {
        if status != PreprocStatus::Success {
            self.state.lock().remove(&req.id());
            return;
        }
        if self.hold.load(Ordering::SeqCst) {
            self.held.lock().push(req.id());
            return;
        }
        self.finish(req.id());
    }

    fn tgt_cmd_done(&self, req: &Cmnd) {
        self.state.lock().remove(&req.id());
    }

    fn rx_mgmt_fn_tag(
        &self,
        mcmd: &Arc<Cmnd>,
        f: iscsi_target_rs::models::task_mgmt::common::TmFunction,
        tag: u32,
    ) -> Result<()> {
        self.tm_calls.lock().push((f.as_u8(), tag as u64));
        backend::task_mgmt_fn_done(Arc::clone(mcmd), MgmtStatus::Success);
        Ok(())
    }

    fn rx_mgmt_fn_lun(
        &self,
        mcmd: &Arc<Cmnd>,
        f: iscsi_target_rs::models::task_mgmt::common::TmFunction,
        lun: u64,
    ) -> Result<()> {
        self.tm_calls.lock().push((f.as_u8(), lun));
        backend::task_mgmt_fn_done(Arc::clone(mcmd), MgmtStatus::Success);
        Ok(())
    }
}

pub struct Harness {
    pub target: Arc<Target>,
    pub session: Arc<Session>,
    pub conn: Arc<Conn>,
    pub backend: Arc<MemBackend>,
    pub client: DuplexStream,
}

pub async fn setup(cfg: Config, backend: Arc<MemBackend>) -> Harness {
    let target = Target::start("iqn.2004-10.com.example:disk0", &cfg, backend.clone());
    let session = target.create_session(SessionParams::from_config(
        &cfg,
        "iqn.1993-08.org.debian:01:cafebabe",
    ));

    let (client, server) = tokio::io::duplex(1 << 20);
    let (server_rd, server_wr) = tokio::io::split(server);
    let conn = target.add_connection(&session, 0, server_rd, server_wr);

    Harness {
        target,
        session,
        conn,
        backend,
        client,
    }
}

/// Write one PDU frame: the 48-byte BHS followed by the zero-padded
/// data segment (digests are off in these tests).
pub async fn send_frame(client: &mut DuplexStream, bhs: &[u8; HEADER_LEN], data: &[u8]) {
    client.write_all(bhs).await.expect("write BHS");
    if !data.is_empty() {
        client.write_all(data).await.expect("write data");
        let pad = (4 - (data.len() % 4)) % 4;
        if pad != 0 {
            client.write_all(&[0u8; 3][..pad]).await.expect("write pad");
        }
    }
}

/// Read one PDU frame back: returns the BHS and the unpadded data
/// segment.
pub async fn read_pdu(client: &mut DuplexStream) -> ([u8; HEADER_LEN], Vec<u8>) {
    let mut bhs = [0u8; HEADER_LEN];
    timeout(READ_TIMEOUT, client.read_exact(&mut bhs))
        .await
        .expect("timed out reading BHS")
        .expect("read BHS");

    let ahs_len = (bhs[4] as usize) * 4;
    let datasize = u32::from_be_bytes([0, bhs[5], bhs[6], bhs[7]]) as usize;
    let padded = datasize + (4 - (datasize % 4)) % 4;

    let mut rest = vec![0u8; ahs_len + padded];
    if !rest.is_empty() {
        timeout(READ_TIMEOUT, client.read_exact(&mut rest))
            .await
            .expect("timed out reading payload")
            .expect("read payload");
    }
    rest.truncate(ahs_len + datasize);
    (bhs, rest.split_off(ahs_len))
}

/// Assert that nothing further arrives on the connection.
pub async fn expect_silence(client: &mut DuplexStream) {
    let mut byte = [0u8; 1];
    let res = timeout(Duration::from_millis(300), client.read_exact(&mut byte)).await;
    assert!(res.is_err(), "unexpected PDU bytes on the wire");
}
