// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use enum_dispatch::enum_dispatch;

use crate::models::{
    async_msg::response::AsyncMessage,
    command::{request::ScsiCommandRequest, response::ScsiCommandResponse},
    common::{BasicHeaderSegment, SendingData},
    data::{request::ScsiDataOut, response::ScsiDataIn},
    logout::{request::LogoutRequest, response::LogoutResponse},
    nop::{request::NopOutRequest, response::NopInResponse},
    opcode::{BhsOpcode, Opcode},
    ready_2_transfer::response::ReadyToTransfer,
    reject::response::RejectPdu,
    task_mgmt::{request::TaskMgmtRequest, response::TaskMgmtResponse},
};

#[enum_dispatch(BasicHeaderSegment, SendingData)]
#[derive(Debug)]
pub enum Pdu<'a> {
    NopOutRequest(&'a mut NopOutRequest),
    ScsiCommandRequest(&'a mut ScsiCommandRequest),
    TaskMgmtRequest(&'a mut TaskMgmtRequest),
    ScsiDataOut(&'a mut ScsiDataOut),
    LogoutRequest(&'a mut LogoutRequest),
    NopInResponse(&'a mut NopInResponse),
    ScsiCommandResponse(&'a mut ScsiCommandResponse),
    TaskMgmtResponse(&'a mut TaskMgmtResponse),
    ScsiDataIn(&'a mut ScsiDataIn),
    LogoutResponse(&'a mut LogoutResponse),
    ReadyToTransfer(&'a mut ReadyToTransfer),
    AsyncMessage(&'a mut AsyncMessage),
    RejectPdu(&'a mut RejectPdu),
}

impl<'a> Pdu<'a> {
    pub fn from_bhs_bytes(bytes: &'a mut [u8]) -> Result<Self> {
        let bhs = BhsOpcode::try_from(bytes[0])
            .map_err(|e| anyhow::anyhow!("invalid opcode: {}", e))?;
        match bhs.opcode {
            Opcode::NopOut => {
                let req = NopOutRequest::from_bhs_bytes(bytes)?;
                Ok(Pdu::NopOutRequest(req))
            },
            Opcode::NopIn => {
                let rsp = NopInResponse::from_bhs_bytes(bytes)?;
                Ok(Pdu::NopInResponse(rsp))
            },
            Opcode::ScsiCommandReq => {
                let req = ScsiCommandRequest::from_bhs_bytes(bytes)?;
                Ok(Pdu::ScsiCommandRequest(req))
            },
            Opcode::ScsiCommandResp => {
                let rsp = ScsiCommandResponse::from_bhs_bytes(bytes)?;
                Ok(Pdu::ScsiCommandResponse(rsp))
            },
            Opcode::ScsiTaskMgmtReq => {
                let req = TaskMgmtRequest::from_bhs_bytes(bytes)?;
                Ok(Pdu::TaskMgmtRequest(req))
            },
            Opcode::ScsiTaskMgmtResp => {
                let rsp = TaskMgmtResponse::from_bhs_bytes(bytes)?;
                Ok(Pdu::TaskMgmtResponse(rsp))
            },
            Opcode::ScsiDataOut => {
                let req = ScsiDataOut::from_bhs_bytes(bytes)?;
                Ok(Pdu::ScsiDataOut(req))
            },
            Opcode::ScsiDataIn => {
                let rsp = ScsiDataIn::from_bhs_bytes(bytes)?;
                Ok(Pdu::ScsiDataIn(rsp))
            },
            Opcode::LogoutReq => {
                let req = LogoutRequest::from_bhs_bytes(bytes)?;
                Ok(Pdu::LogoutRequest(req))
            },
            Opcode::LogoutResp => {
                let rsp = LogoutResponse::from_bhs_bytes(bytes)?;
                Ok(Pdu::LogoutResponse(rsp))
            },
            Opcode::ReadyToTransfer => {
                let rsp = ReadyToTransfer::from_bhs_bytes(bytes)?;
                Ok(Pdu::ReadyToTransfer(rsp))
            },
            Opcode::AsyncMsg => {
                let rsp = AsyncMessage::from_bhs_bytes(bytes)?;
                Ok(Pdu::AsyncMessage(rsp))
            },
            Opcode::Reject => {
                let rsp = RejectPdu::from_bhs_bytes(bytes)?;
                Ok(Pdu::RejectPdu(rsp))
            },
            other => bail!("unsupported opcode: {:?}", other),
        }
    }
}
