// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Two commands with the same ITT in flight: the second is rejected as
//! TASK IN PROGRESS while the first completes untouched.

use std::{sync::atomic::Ordering, time::Duration};

use bytes::Bytes;
use iscsi_target_rs::{
    models::{
        command::request::ScsiCommandRequestBuilder,
        common::{BasicHeaderSegment, HEADER_LEN},
        data::response::ScsiDataIn,
        reject::{reject_description::RejectReason, response::RejectPdu},
    },
    target::backend::ExecResult,
};
use tokio::time::sleep;
use zerocopy::FromBytes;

use super::common::{self, MemBackend, read_pdu, send_frame};

#[tokio::test]
async fn duplicate_itt_is_rejected_while_first_in_flight() {
    let backend = MemBackend::new();
    backend.hold.store(true, Ordering::SeqCst);
    backend.respond_to(0x28, ExecResult {
        data: Bytes::from(vec![0x5au8; 512]),
        ..ExecResult::good()
    });

    let mut h = common::setup(common::test_config(), backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x28; // READ(10)
    let first = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x30)
        .cmd_sn(0)
        .expected_data_transfer_length(512)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit()
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    first.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    // Wait until the first command is parked at the backend.
    for _ in 0..50 {
        if h.backend.held_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.backend.held_count(), 1, "first command must be in flight");

    // Same ITT again while the first has not completed.
    let dup = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x30)
        .cmd_sn(1)
        .expected_data_transfer_length(512)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit()
        .header;
    let mut dup_bhs = [0u8; HEADER_LEN];
    dup.to_bhs_bytes(&mut dup_bhs).expect("serialize");
    send_frame(&mut h.client, &dup_bhs, &[]).await;

    let (rej_bhs, rej_data) = read_pdu(&mut h.client).await;
    let rej = RejectPdu::ref_from_bytes(&rej_bhs).expect("Reject");
    assert_eq!(rej.reason.decode(), RejectReason::TaskInProgress);
    assert_eq!(rej_data.len(), HEADER_LEN, "reject carries the offending BHS");
    assert_eq!(rej_data, dup_bhs, "echoed header must match what we sent");

    // The first command still completes normally.
    h.backend.complete_held();
    let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
    let data_in = ScsiDataIn::ref_from_bytes(&rsp_bhs).expect("Data-In");
    assert_eq!(data_in.initiator_task_tag, first.initiator_task_tag);
    assert!(data_in.flags.s());
    assert_eq!(rsp_data.len(), 512);
}
