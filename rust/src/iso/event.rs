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

use bytes::Bytes;

use crate::error::IsoError;
use crate::iso::controller::{
    BroadcasterState, CisEstablishedInfo, CisRequestInd, ReceiverSyncState,
};
use crate::iso::{Cause, ConnHandle};

/// Inbound ISO SDU reported by the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsoDataInd {
    pub handle: ConnHandle,
    pub status: u8,
    pub ts_flag: bool,
    pub time_stamp: u32,
    pub seq: u16,
    pub data: Bytes,
}

/// Unsolicited notifications delivered to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IsoEvent {
    CisEstablished(CisEstablishedInfo),
    /// Disconnection nobody was waiting for.
    CisDisconnected { cause: Cause, handle: ConnHandle, cig_id: u8, cis_id: u8 },
    /// CIS request left for the application to accept or reject.
    AcceptorRequestCisInd(CisRequestInd),
    DataReceiveInd(IsoDataInd),
    /// One per SDU, after its last fragment went out or was dropped.
    DataSendDone { handle: ConnHandle, len: usize, result: Result<(), IsoError> },
    BigBroadcasterStateInd {
        cause: Cause,
        big_handle: u8,
        adv_handle: u8,
        state: BroadcasterState,
    },
    BigReceiverSyncStateInd { cause: Cause, big_handle: u8, state: ReceiverSyncState },
}

pub trait IsoEventSink: Send + Sync {
    fn on_event(&self, event: IsoEvent);
}

impl<F> IsoEventSink for F
where
    F: Fn(IsoEvent) + Send + Sync,
{
    fn on_event(&self, event: IsoEvent) {
        self(event)
    }
}
