// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::iso::{Cause, IsoRole};
use crate::wifi::cm_if::CmState;

/// Flat numeric status returned through the C ABI.
/// Controller causes are surfaced verbatim and never
/// collide with these values (GAP causes start at 0x100).
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Status {
    Ok = 0x00,
    Fail = 0x01,
    NotReady = 0x02,
    ParamInvalid = 0x03,
    NoResource = 0x04,
    NoMemory = 0x05,
    InvalidState = 0x06,
    RoleConflict = 0x07,
    Busy = 0x08,
    Timeout = 0x09,
    Cancelled = 0x0a,
    Disconnected = 0x0b,
    NotFound = 0x0c,
    UnexpectedResult = 0x0d,
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        status.to_u16().unwrap_or(Status::Fail as u16)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoError {
    #[error("Bluetooth stack is not enabled")]
    NotReady,
    #[error("Invalid parameter")]
    ParamInvalid,
    #[error("No free slot left")]
    NoResource,
    #[error("Out of memory")]
    NoMemory,
    #[error("Lower stack error (cause {0:#06x})")]
    LowerStack(Cause),
    #[error("Operation not allowed in the current channel state")]
    InvalidState,
    #[error("Role {requested:?} conflicts with active role {active:?}")]
    RoleConflict { active: IsoRole, requested: IsoRole },
    #[error("Command already pending")]
    Busy,
    #[error("Command timed out")]
    Timeout,
    #[error("Command cancelled")]
    Cancelled,
    #[error("Link disconnected")]
    Disconnected,
    #[error("Unknown handle or identifier")]
    NotFound,
    #[error("Unexpected command result")]
    UnexpectedResult,
}

impl IsoError {
    /// Numeric status for the C ABI. Lower stack errors
    /// report the controller cause.
    pub fn status(&self) -> u16 {
        let status = match self {
            IsoError::LowerStack(cause) => return *cause,
            IsoError::NotReady => Status::NotReady,
            IsoError::ParamInvalid => Status::ParamInvalid,
            IsoError::NoResource => Status::NoResource,
            IsoError::NoMemory => Status::NoMemory,
            IsoError::InvalidState => Status::InvalidState,
            IsoError::RoleConflict { .. } => Status::RoleConflict,
            IsoError::Busy => Status::Busy,
            IsoError::Timeout => Status::Timeout,
            IsoError::Cancelled => Status::Cancelled,
            IsoError::Disconnected => Status::Disconnected,
            IsoError::NotFound => Status::NotFound,
            IsoError::UnexpectedResult => Status::UnexpectedResult,
        };
        status.into()
    }

    /// Controller cause carried by the error, if any.
    pub fn cause(&self) -> Option<Cause> {
        match self {
            IsoError::LowerStack(cause) => Some(*cause),
            _ => None,
        }
    }
}

/// Collapse a result into the numeric status of the C ABI.
pub fn status_of<T>(result: &Result<T, IsoError>) -> u16 {
    match result {
        Ok(_) => Status::Ok.into(),
        Err(err) => err.status(),
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcqError {
    #[error("Queue capacity {0} does not fit in 24 bits")]
    CapacityOverflow(u32),
    #[error("Unknown peer")]
    UnknownPeer,
    #[error("Peer already exists")]
    PeerExists,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmError {
    #[error("{op} not allowed in state {state:?}")]
    StateMismatch { state: CmState, op: &'static str },
    #[error("Firmware error {0}")]
    Firmware(i32),
    #[error("Service was never probed")]
    NotProbed,
}
