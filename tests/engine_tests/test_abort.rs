// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ABORT TASK against a write waiting for Data-Out: the task is
//! force-released without a SCSI Response and the TM request completes.

use iscsi_target_rs::models::{
    command::request::ScsiCommandRequestBuilder,
    common::{BasicHeaderSegment, HEADER_LEN},
    ready_2_transfer::response::ReadyToTransfer,
    task_mgmt::{
        common::{TmFunction, TmResponseCode},
        request::TaskMgmtRequestBuilder,
        response::TaskMgmtResponse,
    },
};
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn abort_task_releases_data_waiting_write() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x2a; // WRITE(10)
    let write = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x40)
        .cmd_sn(0)
        .expected_data_transfer_length(8192)
        .scsi_descriptor_block(&cdb)
        .write()
        .final_bit()
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    write.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    // The write is now suspended waiting for its solicited burst.
    let (r2t_bhs, _) = read_pdu(&mut h.client).await;
    let r2t = ReadyToTransfer::ref_from_bytes(&r2t_bhs).expect("R2T");
    assert_eq!(r2t.initiator_task_tag, write.initiator_task_tag);

    // Abort it by referenced task tag.
    let tm = TaskMgmtRequestBuilder::new(TmFunction::AbortTask)
        .initiator_task_tag(0x41)
        .referenced_task_tag(0x40)
        .cmd_sn(1)
        .header;
    let mut tm_bhs = [0u8; HEADER_LEN];
    tm.to_bhs_bytes(&mut tm_bhs).expect("serialize");
    send_frame(&mut h.client, &tm_bhs, &[]).await;

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = TaskMgmtResponse::ref_from_bytes(&rsp_bhs).expect("TM response");
    assert_eq!(rsp.initiator_task_tag, tm.initiator_task_tag);
    assert_eq!(rsp.tm_response(), TmResponseCode::FunctionComplete);

    // The backend was asked to abort the same tag.
    let calls = h.backend.tm_calls.lock().clone();
    assert_eq!(calls, vec![(TmFunction::AbortTask.as_u8(), 0x40u64)]);

    // No SCSI Response ever goes out for the aborted write.
    expect_silence(&mut h.client).await;

    // The backend never executed it either.
    assert!(h.backend.writes.lock().is_empty());
}

#[tokio::test]
async fn abort_of_unknown_task_answers_unknown_task() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let tm = TaskMgmtRequestBuilder::new(TmFunction::AbortTask)
        .initiator_task_tag(0x42)
        .referenced_task_tag(0xdead)
        .cmd_sn(0)
        .header;
    let mut tm_bhs = [0u8; HEADER_LEN];
    tm.to_bhs_bytes(&mut tm_bhs).expect("serialize");
    send_frame(&mut h.client, &tm_bhs, &[]).await;

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = TaskMgmtResponse::ref_from_bytes(&rsp_bhs).expect("TM response");
    assert_eq!(rsp.tm_response(), TmResponseCode::UnknownTask);

    // Nothing reached the backend.
    assert!(h.backend.tm_calls.lock().is_empty());
}

#[tokio::test]
async fn task_reassign_is_unsupported() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let tm = TaskMgmtRequestBuilder::new(TmFunction::TaskReassign)
        .initiator_task_tag(0x43)
        .cmd_sn(0)
        .header;
    let mut tm_bhs = [0u8; HEADER_LEN];
    tm.to_bhs_bytes(&mut tm_bhs).expect("serialize");
    send_frame(&mut h.client, &tm_bhs, &[]).await;

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = TaskMgmtResponse::ref_from_bytes(&rsp_bhs).expect("TM response");
    assert_eq!(rsp.tm_response(), TmResponseCode::FunctionUnsupported);
}
