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

//! LE isochronous channels: CIG/CIS for connected streams and
//! BIG/BIS for broadcast streams, on top of a host controller
//! that answers every command with exactly one callback.

pub mod controller;
pub mod event;
pub mod fragment;
pub mod manager;
pub mod pending;
pub mod registry;

pub use manager::{CisRequestDecision, CisRequestHandler, IsoConfig, IsoManager};

/// Controller assigned connection handle of a CIS or BIS.
pub type ConnHandle = u16;

/// Controller cause code, `GAP_SUCCESS` on success.
pub type Cause = u16;

pub const GAP_SUCCESS: Cause = 0;

/// Largest valid CIG_ID and CIS_ID.
pub const ISO_ID_MAX: u8 = 0xef;

/// Isochronous role owning the subsystem. Only one may be active at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IsoRole {
    Initiator,
    Acceptor,
    Broadcaster,
    Receiver,
}

/// Data path direction bits, as in HCI LE Remove ISO Data Path.
pub const DATA_PATH_INPUT: u8 = 0x01;
pub const DATA_PATH_OUTPUT: u8 = 0x02;
