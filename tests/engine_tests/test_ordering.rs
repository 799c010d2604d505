// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CmdSN reordering: a command that arrives ahead of the window waits
//! in the pending list and executes right after the window catches up.
//! StatSN stamps follow execution order.

use iscsi_target_rs::models::{
    common::{BasicHeaderSegment, HEADER_LEN},
    nop::{request::NopOutRequestBuilder, response::NopInResponse},
};
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn out_of_order_cmd_sn_executes_in_sequence() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    // CmdSN 1 arrives first and must wait for CmdSN 0.
    let ahead = NopOutRequestBuilder::new()
        .initiator_task_tag(0xA1)
        .cmd_sn(1)
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    ahead.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let mut in_order = NopOutRequestBuilder::new()
        .initiator_task_tag(0xA2)
        .cmd_sn(0)
        .header;
    in_order.set_data_length_bytes(4);
    let mut bhs = [0u8; HEADER_LEN];
    in_order.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, b"ping").await;

    // CmdSN 0 answers first, with the echoed payload and StatSN 0.
    let (first_bhs, first_data) = read_pdu(&mut h.client).await;
    let first = NopInResponse::ref_from_bytes(&first_bhs).expect("NOP-In");
    assert_eq!(first.initiator_task_tag, in_order.initiator_task_tag);
    assert_eq!(first.stat_sn.get(), 0);
    assert_eq!(first_data, b"ping");

    // Then the pending CmdSN 1 pops and answers with StatSN 1.
    let (second_bhs, _) = read_pdu(&mut h.client).await;
    let second = NopInResponse::ref_from_bytes(&second_bhs).expect("NOP-In");
    assert_eq!(second.initiator_task_tag, ahead.initiator_task_tag);
    assert_eq!(second.stat_sn.get(), 1);
    assert_eq!(second.exp_cmd_sn.get(), 2, "window advanced past both");

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn immediate_command_bypasses_the_window() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    // CmdSN far ahead, but the I bit skips the reorder window entirely.
    let imm = NopOutRequestBuilder::new()
        .immediate()
        .initiator_task_tag(0xB1)
        .cmd_sn(9)
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    imm.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = NopInResponse::ref_from_bytes(&rsp_bhs).expect("NOP-In");
    assert_eq!(rsp.initiator_task_tag, imm.initiator_task_tag);
    assert_eq!(rsp.exp_cmd_sn.get(), 0, "immediates do not advance the window");
}
