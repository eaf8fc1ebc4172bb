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

//! Wi-Fi service plumbing: per peer transmit flow control and the
//! lifecycle of the firmware service.

pub mod cm_if;
pub mod fcq;

pub use cm_if::{
    CmIfConfig, CmState, ConnectionManager, ModuleClientReason, SapNotifier, WlanFirmware,
};
pub use fcq::{Admission, FcqConfig, FcqPeerTable, FlowControlQueueSet};
