// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    common::HEADER_LEN,
    task_mgmt::{
        common::{TmFunction, TmResponseCode},
        request::{TaskMgmtRequest, TaskMgmtRequestBuilder},
        response::TaskMgmtResponseBuilder,
    },
};
use zerocopy::IntoBytes;

#[test]
fn tm_request_layout_matches_the_wire() {
    let builder = TaskMgmtRequestBuilder::new(TmFunction::AbortTask)
        .initiator_task_tag(0x55)
        .referenced_task_tag(0x10)
        .cmd_sn(7)
        .exp_stat_sn(2)
        .lun(0x0001_0000_0000_0000);

    let wire = builder.header.as_bytes();
    assert_eq!(wire.len(), HEADER_LEN);
    assert_eq!(wire[0] & 0x3F, 0x02);
    assert_eq!(wire[0] & 0x40, 0x40, "TM requests default to immediate");
    assert_eq!(wire[1], 0x80 | 0x01);
    assert_eq!(u32::from_be_bytes(wire[20..24].try_into().expect("rtt")), 0x10);
    assert_eq!(u32::from_be_bytes(wire[24..28].try_into().expect("cmdsn")), 7);
}

#[test]
fn tm_function_codec_masks_the_final_bit() {
    for f in [
        TmFunction::AbortTask,
        TmFunction::AbortTaskSet,
        TmFunction::ClearAca,
        TmFunction::ClearTaskSet,
        TmFunction::LogicalUnitReset,
        TmFunction::TargetWarmReset,
        TmFunction::TargetColdReset,
        TmFunction::TaskReassign,
    ] {
        assert_eq!(TmFunction::from_u8(0x80 | f.as_u8()), f);
    }
    assert_eq!(TmFunction::from_u8(0x80 | 0x3c), TmFunction::Unknown(0x3c));
}

#[test]
fn tm_request_reparses_its_function() {
    let builder = TaskMgmtRequestBuilder::new(TmFunction::LogicalUnitReset);
    let mut wire = [0u8; HEADER_LEN];
    wire.copy_from_slice(builder.header.as_bytes());

    let parsed = TaskMgmtRequest::from_bhs_bytes(&mut wire).expect("parse");
    assert_eq!(parsed.tm_function(), TmFunction::LogicalUnitReset);
}

#[test]
fn tm_response_carries_code_and_final_flag() {
    let builder = TaskMgmtResponseBuilder::new(0x55, TmResponseCode::UnknownTask);
    let wire = builder.header.as_bytes();
    assert_eq!(wire[0] & 0x3F, 0x22);
    assert_eq!(wire[1], 0x80);
    assert_eq!(wire[2], 0x01);
    assert_eq!(u32::from_ne_bytes(wire[16..20].try_into().expect("itt")), 0x55);
}

#[test]
fn tm_response_code_round_trips() {
    for code in [
        TmResponseCode::FunctionComplete,
        TmResponseCode::UnknownTask,
        TmResponseCode::UnknownLun,
        TmResponseCode::FunctionUnsupported,
        TmResponseCode::FunctionRejected,
    ] {
        assert_eq!(TmResponseCode::from_u8(code.as_u8()), code);
    }
}
