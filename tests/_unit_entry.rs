// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod unit_tests {
    pub mod test_async_msg;
    pub mod test_config;
    pub mod test_data_models;
    pub mod test_opcode;
    pub mod test_pdu_codec;
    pub mod test_ready_to_transfer;
    pub mod test_reject;
    pub mod test_scsi_models;
    pub mod test_task_mgmt;
}
