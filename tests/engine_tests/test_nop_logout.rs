// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Housekeeping PDUs: NOP echo, silent ping-ack, logout, and the
//! unsupported-opcode reject.

use std::time::Duration;

use iscsi_target_rs::models::{
    common::{BasicHeaderSegment, HEADER_LEN, RESERVED_TAG},
    logout::{
        common::{LogoutReason, LogoutResponseCode},
        request::LogoutRequestBuilder,
        response::LogoutResponse,
    },
    nop::{request::NopOutRequestBuilder, response::NopInResponse},
    reject::{reject_description::RejectReason, response::RejectPdu},
};
use tokio::time::sleep;
use zerocopy::FromBytes;

use super::common::{self, MemBackend, expect_silence, read_pdu, send_frame};

#[tokio::test]
async fn nop_out_is_echoed_with_its_payload() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let mut hdr = NopOutRequestBuilder::new()
        .initiator_task_tag(0x60)
        .cmd_sn(0)
        .lun(0x0001_0000_0000_0000)
        .header;
    hdr.set_data_length_bytes(6);
    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, b"hello!").await;

    let (rsp_bhs, rsp_data) = read_pdu(&mut h.client).await;
    let rsp = NopInResponse::ref_from_bytes(&rsp_bhs).expect("NOP-In");
    assert_eq!(rsp.initiator_task_tag, hdr.initiator_task_tag);
    assert_eq!(rsp.target_task_tag.get(), RESERVED_TAG);
    assert_eq!(rsp_data, b"hello!");

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn ping_ack_is_consumed_silently() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let mut hdr = NopOutRequestBuilder::new()
        .immediate()
        .initiator_task_tag(RESERVED_TAG)
        .cmd_sn(0)
        .header;
    hdr.set_data_length_bytes(8);
    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[0u8; 8]).await;

    expect_silence(&mut h.client).await;
}

#[tokio::test]
async fn logout_answers_and_closes_the_connection() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    let hdr = LogoutRequestBuilder::new(LogoutReason::CloseSession, 0x70, 0)
        .cmd_sn(0)
        .header;
    let mut bhs = [0u8; HEADER_LEN];
    hdr.to_bhs_bytes(&mut bhs).expect("serialize");
    send_frame(&mut h.client, &bhs, &[]).await;

    let (rsp_bhs, _) = read_pdu(&mut h.client).await;
    let rsp = LogoutResponse::ref_from_bytes(&rsp_bhs).expect("Logout Response");
    assert_eq!(rsp.initiator_task_tag, hdr.initiator_task_tag);
    assert_eq!(
        rsp.response.decode().expect("code"),
        LogoutResponseCode::Success
    );

    // The connection closes once the response is on the wire.
    for _ in 0..50 {
        if h.conn.is_closed() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(h.conn.is_closed(), "logout must close the connection");
}

#[tokio::test]
async fn unsupported_opcode_is_rejected() {
    let backend = MemBackend::new();
    let mut h = common::setup(common::test_config(), backend).await;

    // A Text request: recognised on the wire, unsupported by this core.
    let mut bhs = [0u8; HEADER_LEN];
    bhs[0] = 0x04;
    bhs[1] = 0x80;
    bhs[16..20].copy_from_slice(&0x71u32.to_be_bytes());
    send_frame(&mut h.client, &bhs, &[]).await;

    let (rej_bhs, rej_data) = read_pdu(&mut h.client).await;
    let rej = RejectPdu::ref_from_bytes(&rej_bhs).expect("Reject");
    assert_eq!(rej.reason.decode(), RejectReason::CommandNotSupported);
    assert_eq!(rej_data, bhs);

    expect_silence(&mut h.client).await;
}
