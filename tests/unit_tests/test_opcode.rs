// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use iscsi_target_rs::models::{
    common::BasicHeaderSegment,
    opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    parse::Pdu,
};

#[test]
fn immediate_bit_splits_from_opcode() {
    let byte = 0x40 | 0x01; // I | SCSI Command
    let decoded = BhsOpcode::try_from(byte).expect("valid opcode");
    assert!(decoded.flags);
    assert_eq!(decoded.opcode, Opcode::ScsiCommandReq);
    assert_eq!(u8::from(&decoded), byte);
}

#[test]
fn target_side_opcodes_decode() {
    for (byte, op) in [
        (0x00, Opcode::NopOut),
        (0x02, Opcode::ScsiTaskMgmtReq),
        (0x05, Opcode::ScsiDataOut),
        (0x06, Opcode::LogoutReq),
        (0x10, Opcode::SnackReq),
        (0x22, Opcode::ScsiTaskMgmtResp),
        (0x31, Opcode::ReadyToTransfer),
        (0x32, Opcode::AsyncMsg),
        (0x3F, Opcode::Reject),
    ] {
        assert_eq!(Opcode::from_u6(byte), Some(op), "byte {byte:#04x}");
    }
}

#[test]
fn reserved_opcode_is_rejected() {
    assert!(Opcode::from_u6(0x0B).is_none());
    assert!(BhsOpcode::try_from(0x0Bu8).is_err());
}

#[test]
fn pdu_dispatch_resolves_known_headers() {
    let mut bhs = [0u8; 48];
    bhs[0] = 0x02; // Task Management request
    bhs[1] = 0x81;
    bhs[16..20].copy_from_slice(&0x77u32.to_ne_bytes());

    let pdu = Pdu::from_bhs_bytes(&mut bhs).expect("dispatch");
    assert!(matches!(pdu, Pdu::TaskMgmtRequest(_)));
    assert_eq!(pdu.get_initiator_task_tag(), 0x77);

    let mut unknown = [0u8; 48];
    unknown[0] = 0x0B;
    assert!(Pdu::from_bhs_bytes(&mut unknown).is_err());
}

#[test]
fn raw_opcode_preserves_unknown_bits() {
    let mut raw = RawBhsOpcode::default();
    raw.set_opcode_known(Opcode::ScsiDataIn);
    raw.set_i();
    assert!(raw.i());
    assert_eq!(raw.opcode_known(), Some(Opcode::ScsiDataIn));
    assert_eq!(raw.raw(), 0x40 | 0x25);
}
