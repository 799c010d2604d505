// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// iSCSI Task Management function codes (RFC 7143 §11.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmFunction {
    /// 1 — abort the task identified by the Referenced Task Tag
    AbortTask,
    /// 2 — abort every task of the session issued on the referenced LUN
    AbortTaskSet,
    /// 3 — clear the ACA condition on the referenced LUN
    ClearAca,
    /// 4 — clear every task of the session issued on the referenced LUN
    ClearTaskSet,
    /// 5 — reset the referenced logical unit
    LogicalUnitReset,
    /// 6 — warm-reset the whole target
    TargetWarmReset,
    /// 7 — cold-reset the whole target; the response closes the connection
    TargetColdReset,
    /// 8 — reassign connection allegiance (ERL>0 only)
    TaskReassign,
    /// anything else the initiator may put on the wire
    Unknown(u8),
}

impl TmFunction {
    /// Function codes ride in the low 7 bits of byte 1; bit 7 is always
    /// set on the wire.
    pub const MASK: u8 = 0x7F;

    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v & Self::MASK {
            1 => TmFunction::AbortTask,
            2 => TmFunction::AbortTaskSet,
            3 => TmFunction::ClearAca,
            4 => TmFunction::ClearTaskSet,
            5 => TmFunction::LogicalUnitReset,
            6 => TmFunction::TargetWarmReset,
            7 => TmFunction::TargetColdReset,
            8 => TmFunction::TaskReassign,
            other => TmFunction::Unknown(other),
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        match *self {
            TmFunction::AbortTask => 1,
            TmFunction::AbortTaskSet => 2,
            TmFunction::ClearAca => 3,
            TmFunction::ClearTaskSet => 4,
            TmFunction::LogicalUnitReset => 5,
            TmFunction::TargetWarmReset => 6,
            TmFunction::TargetColdReset => 7,
            TmFunction::TaskReassign => 8,
            TmFunction::Unknown(v) => v & Self::MASK,
        }
    }
}

impl fmt::Display for TmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TmFunction::Unknown(v) => write!(f, "Unknown({v})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Wire view for byte 1 of the TM request: F bit plus 7-bit function.
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTmFunction(u8);

impl Default for RawTmFunction {
    #[inline]
    fn default() -> Self {
        Self(0x80)
    }
}

impl RawTmFunction {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn decode(&self) -> TmFunction {
        TmFunction::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, f: TmFunction) {
        self.0 = 0x80 | f.as_u8();
    }
}

impl From<TmFunction> for RawTmFunction {
    #[inline]
    fn from(f: TmFunction) -> Self {
        Self(0x80 | f.as_u8())
    }
}

impl fmt::Debug for RawTmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTmFunction {{ {} }}", self.decode())
    }
}

/// iSCSI Task Management response codes (RFC 7143 §11.6.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TmResponseCode {
    /// 0 — function complete
    #[default]
    FunctionComplete,
    /// 1 — task does not exist
    UnknownTask,
    /// 2 — LUN does not exist
    UnknownLun,
    /// 3 — task still allegiant to another connection
    TaskAllegiant,
    /// 4 — task allegiance reassignment is not supported
    FailoverNotSupported,
    /// 5 — the function itself is not supported
    FunctionUnsupported,
    /// 6 — function authorization failed
    AuthFailed,
    /// 255 — function rejected
    FunctionRejected,
    /// reserved values
    Other(u8),
}

impl TmResponseCode {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => TmResponseCode::FunctionComplete,
            1 => TmResponseCode::UnknownTask,
            2 => TmResponseCode::UnknownLun,
            3 => TmResponseCode::TaskAllegiant,
            4 => TmResponseCode::FailoverNotSupported,
            5 => TmResponseCode::FunctionUnsupported,
            6 => TmResponseCode::AuthFailed,
            255 => TmResponseCode::FunctionRejected,
            other => TmResponseCode::Other(other),
        }
    }

    #[inline]
    pub fn as_u8(&self) -> u8 {
        match *self {
            TmResponseCode::FunctionComplete => 0,
            TmResponseCode::UnknownTask => 1,
            TmResponseCode::UnknownLun => 2,
            TmResponseCode::TaskAllegiant => 3,
            TmResponseCode::FailoverNotSupported => 4,
            TmResponseCode::FunctionUnsupported => 5,
            TmResponseCode::AuthFailed => 6,
            TmResponseCode::FunctionRejected => 255,
            TmResponseCode::Other(v) => v,
        }
    }
}

/// Wire view for the 1-byte TM response code.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTmResponseCode(u8);

impl RawTmResponseCode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn decode(&self) -> TmResponseCode {
        TmResponseCode::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, c: TmResponseCode) {
        self.0 = c.as_u8();
    }
}

impl From<TmResponseCode> for RawTmResponseCode {
    #[inline]
    fn from(c: TmResponseCode) -> Self {
        Self(c.as_u8())
    }
}

impl fmt::Debug for RawTmResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTmResponseCode {{ {:?} }}", self.decode())
    }
}
