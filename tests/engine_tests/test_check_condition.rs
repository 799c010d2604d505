// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CHECK CONDITION with partial read data: the generated data travels
//! in a Data-In burst without status, followed by a separate SCSI
//! Response carrying sense and the underflow residual.

use bytes::Bytes;
use iscsi_target_rs::{
    models::{
        command::{
            common::ScsiStatus, request::ScsiCommandRequestBuilder,
            response::ScsiCommandResponse,
        },
        common::{BasicHeaderSegment, HEADER_LEN},
        data::{
            response::ScsiDataIn,
            sense_data::{SenseData, keys},
        },
    },
    target::backend::ExecResult,
};
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn check_condition_on_partial_read() {
    let backend = MemBackend::new();
    let sense = SenseData::fixed(keys::HARDWARE_ERROR, 0x44, 0x00);
    backend.respond_to(0x28, ExecResult {
        status: ScsiStatus::CheckCondition,
        sense: Some(Bytes::copy_from_slice(&sense)),
        data: Bytes::from(vec![0x11u8; 4096]),
        send_status: true,
        aborted: false,
    });

    let mut h = common::setup(common::test_config(), backend).await;

    let mut cdb = [0u8; 16];
    cdb[0] = 0x28; // READ(10)
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x50)
        .cmd_sn(0)
        .expected_data_transfer_length(8192)
        .scsi_descriptor_block(&cdb)
        .read()
        .final_bit()
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    // The partial data arrives with FINAL but without STATUS.
    let (din_bhs, din_data) = read_pdu(&mut h.client).await;
    let data_in = ScsiDataIn::ref_from_bytes(&din_bhs).expect("Data-In");
    assert!(data_in.flags.fin());
    assert!(!data_in.flags.s(), "status travels separately");
    assert_eq!(din_data.len(), 4096);

    // Then the status PDU with sense and the residual.
    let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
    let rsp = ScsiCommandResponse::ref_from_bytes(&rsp_bhs).expect("SCSI Response");
    assert_eq!(rsp.status.decode().expect("status"), ScsiStatus::CheckCondition);
    assert!(rsp.flags.u_big(), "underflow expected");
    assert_eq!(rsp.residual_count.get(), 4096);

    let parsed = SenseData::parse(&rsp_data).expect("sense blob");
    assert_eq!(parsed.sense_key, keys::HARDWARE_ERROR);
    assert_eq!(parsed.asc, 0x44);

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn check_condition_without_data_sends_single_response() {
    let backend = MemBackend::new();
    let sense = SenseData::fixed(keys::ABORTED_COMMAND, 0x47, 0x05);
    backend.respond_to(0x00, ExecResult {
        status: ScsiStatus::CheckCondition,
        sense: Some(Bytes::copy_from_slice(&sense)),
        data: Bytes::new(),
        send_status: true,
        aborted: false,
    });

    let mut h = common::setup(common::test_config(), backend).await;

    let cdb = [0u8; 16]; // TEST UNIT READY
    let hdr = ScsiCommandRequestBuilder::new()
        .initiator_task_tag(0x51)
        .cmd_sn(0)
        .scsi_descriptor_block(&cdb)
        .final_bit()
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
    let rsp = ScsiCommandResponse::ref_from_bytes(&rsp_bhs).expect("SCSI Response");
    assert_eq!(rsp.status.decode().expect("status"), ScsiStatus::CheckCondition);
    assert!(!rsp.flags.u_big(), "nothing was expected, nothing is residual");

    let parsed = SenseData::parse(&rsp_data).expect("sense blob");
    assert_eq!(parsed.asc, 0x47);
    assert_eq!(parsed.ascq, 0x05);

    expect_silence(&mut h.client).await;
}
