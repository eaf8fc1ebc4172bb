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

//! Boundary with the GAP CIG/BIG managers of the host controller.
//!
//! Requests are submitted as [`IsoCommand`]s. The controller either
//! rejects a request synchronously with a cause, or accepts it and
//! later reports the outcome through exactly one [`CigMgrEvent`] or
//! [`BigMgrEvent`] delivered to the [`IsoManager`](super::IsoManager).

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::IsoError;
use crate::iso::{Cause, ConnHandle, DATA_PATH_INPUT, DATA_PATH_OUTPUT};

#[allow(non_camel_case_types)]
type microseconds = u32;

/// CIS connection state as reported by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum CisState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    ConnectingCancel = 4,
}

/// BIG broadcaster state. The intermediate states track the periodic
/// and extended advertising sets the BIG is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum BroadcasterState {
    Idle = 0,
    CreatingExtAdvPaAdvIdle = 1,
    WaitExtAdvPaAdvAdvertising = 2,
    CreatingPaAdvIdle = 3,
    WaitPaAdvAdvertising = 4,
    CreatingExtAdvIdle = 5,
    WaitExtAdvAdvertising = 6,
    Creating = 7,
    Broadcasting = 8,
    Terminating = 9,
}

/// BIG receiver synchronization state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ReceiverSyncState {
    Terminated = 0,
    Synchronizing = 1,
    Synchronized = 2,
    Terminating = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum DataPathDirection {
    Input = 0,
    Output = 1,
}

impl DataPathDirection {
    pub fn mask(self) -> u8 {
        match self {
            DataPathDirection::Input => DATA_PATH_INPUT,
            DataPathDirection::Output => DATA_PATH_OUTPUT,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CigParam {
    pub sdu_interval_m_s: microseconds,
    pub sdu_interval_s_m: microseconds,
    pub latency_m_s: u16,
    pub latency_s_m: u16,
    pub sca: u8,
    pub packing: u8,
    pub framing: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CigTestParam {
    pub sdu_interval_m_s: microseconds,
    pub sdu_interval_s_m: microseconds,
    pub iso_interval: u16,
    pub ft_m_s: u8,
    pub ft_s_m: u8,
    pub sca: u8,
    pub packing: u8,
    pub framing: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CisParam {
    pub max_sdu_m_s: u16,
    pub max_sdu_s_m: u16,
    pub phy_m_s: u8,
    pub phy_s_m: u8,
    pub rtn_m_s: u8,
    pub rtn_s_m: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceptorSduConfig {
    pub max_sdu_m_s: u16,
    pub max_sdu_s_m: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPathParam {
    pub direction: DataPathDirection,
    pub path_id: u8,
    pub codec_id: [u8; 5],
    pub controller_delay: microseconds,
    pub codec_config: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BigParam {
    pub num_bis: u8,
    pub sdu_interval: microseconds,
    pub max_sdu: u16,
    pub max_transport_latency: u16,
    pub rtn: u8,
    pub phy: u8,
    pub packing: u8,
    pub framing: u8,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BigSyncParam {
    pub sync_handle: u16,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
    pub mse: u8,
    pub big_sync_timeout: u16,
    pub bis: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsoTestCommand {
    Transmit { payload_type: u8 },
    Receive { payload_type: u8 },
    ReadCounters,
    End,
}

/// Opcode of an [`IsoCommand`], as seen through the C ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum Opcode {
    CigMgrInit = 0x01,
    RegisterCig = 0x02,
    RegisterAcceptor = 0x03,
    AddCis = 0x04,
    SetCigParam = 0x05,
    SetCisParam = 0x06,
    SetCisAclLink = 0x07,
    StartSetting = 0x08,
    StartSettingTest = 0x09,
    CreateCis = 0x0a,
    RemoveCig = 0x0b,
    AcceptCis = 0x0c,
    RejectCis = 0x0d,
    AcceptorConfigSdu = 0x0e,
    SetupDataPath = 0x0f,
    RemoveDataPath = 0x10,
    Disconnect = 0x11,
    ReadIsoTxSync = 0x12,
    ReadLinkQuality = 0x13,
    IsoTest = 0x14,
    BigMgrInit = 0x20,
    CreateBig = 0x21,
    TerminateBig = 0x22,
    BigCreateSync = 0x23,
    BigTerminateSync = 0x24,
}

/// Request submitted to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IsoCommand {
    CigMgrInit { cig_num: u8, cis_num: u8 },
    RegisterCig { cig_id: u8 },
    RegisterAcceptor,
    AddCis { cig_id: u8, cis_id: u8 },
    SetCigParam { cig_id: u8, param: CigParam },
    SetCisParam { cis_id: u8, param: CisParam },
    SetCisAclLink { cis_id: u8, conn_id: u8 },
    StartSetting { cig_id: u8 },
    StartSettingTest { cig_id: u8, param: CigTestParam },
    /// An empty handle list creates every CIS of the CIG.
    CreateCis { cig_id: u8, handles: Vec<ConnHandle> },
    RemoveCig { cig_id: u8 },
    AcceptCis { handle: ConnHandle },
    RejectCis { handle: ConnHandle, reason: u8 },
    AcceptorConfigSdu { handle: ConnHandle, config: AcceptorSduConfig },
    SetupDataPath { handle: ConnHandle, param: DataPathParam },
    RemoveDataPath { handle: ConnHandle, directions: u8 },
    Disconnect { handle: ConnHandle, reason: u8 },
    ReadIsoTxSync { handle: ConnHandle },
    ReadLinkQuality { handle: ConnHandle },
    IsoTest { handle: ConnHandle, command: IsoTestCommand },
    BigMgrInit { big_num: u8, bis_num: u8 },
    CreateBig { big_handle: u8, adv_handle: u8, param: BigParam },
    TerminateBig { big_handle: u8, reason: u8 },
    BigCreateSync { big_handle: u8, param: BigSyncParam },
    BigTerminateSync { big_handle: u8 },
}

impl IsoCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            IsoCommand::CigMgrInit { .. } => Opcode::CigMgrInit,
            IsoCommand::RegisterCig { .. } => Opcode::RegisterCig,
            IsoCommand::RegisterAcceptor => Opcode::RegisterAcceptor,
            IsoCommand::AddCis { .. } => Opcode::AddCis,
            IsoCommand::SetCigParam { .. } => Opcode::SetCigParam,
            IsoCommand::SetCisParam { .. } => Opcode::SetCisParam,
            IsoCommand::SetCisAclLink { .. } => Opcode::SetCisAclLink,
            IsoCommand::StartSetting { .. } => Opcode::StartSetting,
            IsoCommand::StartSettingTest { .. } => Opcode::StartSettingTest,
            IsoCommand::CreateCis { .. } => Opcode::CreateCis,
            IsoCommand::RemoveCig { .. } => Opcode::RemoveCig,
            IsoCommand::AcceptCis { .. } => Opcode::AcceptCis,
            IsoCommand::RejectCis { .. } => Opcode::RejectCis,
            IsoCommand::AcceptorConfigSdu { .. } => Opcode::AcceptorConfigSdu,
            IsoCommand::SetupDataPath { .. } => Opcode::SetupDataPath,
            IsoCommand::RemoveDataPath { .. } => Opcode::RemoveDataPath,
            IsoCommand::Disconnect { .. } => Opcode::Disconnect,
            IsoCommand::ReadIsoTxSync { .. } => Opcode::ReadIsoTxSync,
            IsoCommand::ReadLinkQuality { .. } => Opcode::ReadLinkQuality,
            IsoCommand::IsoTest { .. } => Opcode::IsoTest,
            IsoCommand::BigMgrInit { .. } => Opcode::BigMgrInit,
            IsoCommand::CreateBig { .. } => Opcode::CreateBig,
            IsoCommand::TerminateBig { .. } => Opcode::TerminateBig,
            IsoCommand::BigCreateSync { .. } => Opcode::BigCreateSync,
            IsoCommand::BigTerminateSync { .. } => Opcode::BigTerminateSync,
        }
    }

    /// Serialize the command parameters, little endian, in declaration order.
    /// Fails with `ParamInvalid` when a list does not fit its count field.
    pub fn encode(&self) -> Result<Bytes, IsoError> {
        let mut buf = BytesMut::with_capacity(32);
        match self {
            IsoCommand::CigMgrInit { cig_num, cis_num } => {
                buf.put_u8(*cig_num);
                buf.put_u8(*cis_num);
            }
            IsoCommand::RegisterCig { cig_id } | IsoCommand::RemoveCig { cig_id } => {
                buf.put_u8(*cig_id)
            }
            IsoCommand::StartSetting { cig_id } => buf.put_u8(*cig_id),
            IsoCommand::RegisterAcceptor => (),
            IsoCommand::AddCis { cig_id, cis_id } => {
                buf.put_u8(*cig_id);
                buf.put_u8(*cis_id);
            }
            IsoCommand::SetCigParam { cig_id, param } => {
                buf.put_u8(*cig_id);
                buf.put_u32_le(param.sdu_interval_m_s);
                buf.put_u32_le(param.sdu_interval_s_m);
                buf.put_u16_le(param.latency_m_s);
                buf.put_u16_le(param.latency_s_m);
                buf.put_u8(param.sca);
                buf.put_u8(param.packing);
                buf.put_u8(param.framing);
            }
            IsoCommand::SetCisParam { cis_id, param } => {
                buf.put_u8(*cis_id);
                buf.put_u16_le(param.max_sdu_m_s);
                buf.put_u16_le(param.max_sdu_s_m);
                buf.put_u8(param.phy_m_s);
                buf.put_u8(param.phy_s_m);
                buf.put_u8(param.rtn_m_s);
                buf.put_u8(param.rtn_s_m);
            }
            IsoCommand::SetCisAclLink { cis_id, conn_id } => {
                buf.put_u8(*cis_id);
                buf.put_u8(*conn_id);
            }
            IsoCommand::StartSettingTest { cig_id, param } => {
                buf.put_u8(*cig_id);
                buf.put_u32_le(param.sdu_interval_m_s);
                buf.put_u32_le(param.sdu_interval_s_m);
                buf.put_u16_le(param.iso_interval);
                buf.put_u8(param.ft_m_s);
                buf.put_u8(param.ft_s_m);
                buf.put_u8(param.sca);
                buf.put_u8(param.packing);
                buf.put_u8(param.framing);
            }
            IsoCommand::CreateCis { cig_id, handles } => {
                buf.put_u8(*cig_id);
                buf.put_u8(count(handles.len())?);
                handles.iter().for_each(|handle| buf.put_u16_le(*handle));
            }
            IsoCommand::AcceptCis { handle }
            | IsoCommand::ReadIsoTxSync { handle }
            | IsoCommand::ReadLinkQuality { handle } => buf.put_u16_le(*handle),
            IsoCommand::RejectCis { handle, reason }
            | IsoCommand::Disconnect { handle, reason } => {
                buf.put_u16_le(*handle);
                buf.put_u8(*reason);
            }
            IsoCommand::AcceptorConfigSdu { handle, config } => {
                buf.put_u16_le(*handle);
                buf.put_u16_le(config.max_sdu_m_s);
                buf.put_u16_le(config.max_sdu_s_m);
            }
            IsoCommand::SetupDataPath { handle, param } => {
                buf.put_u16_le(*handle);
                buf.put_u8(param.direction as u8);
                buf.put_u8(param.path_id);
                buf.put_slice(&param.codec_id);
                // Controller delay is a 24 bit field.
                buf.put_uint_le(u64::from(param.controller_delay & 0xff_ffff), 3);
                buf.put_u8(count(param.codec_config.len())?);
                buf.put_slice(&param.codec_config);
            }
            IsoCommand::RemoveDataPath { handle, directions } => {
                buf.put_u16_le(*handle);
                buf.put_u8(*directions);
            }
            IsoCommand::IsoTest { handle, command } => {
                buf.put_u16_le(*handle);
                match command {
                    IsoTestCommand::Transmit { payload_type } => {
                        buf.put_u8(0);
                        buf.put_u8(*payload_type);
                    }
                    IsoTestCommand::Receive { payload_type } => {
                        buf.put_u8(1);
                        buf.put_u8(*payload_type);
                    }
                    IsoTestCommand::ReadCounters => buf.put_u8(2),
                    IsoTestCommand::End => buf.put_u8(3),
                }
            }
            IsoCommand::BigMgrInit { big_num, bis_num } => {
                buf.put_u8(*big_num);
                buf.put_u8(*bis_num);
            }
            IsoCommand::CreateBig { big_handle, adv_handle, param } => {
                buf.put_u8(*big_handle);
                buf.put_u8(*adv_handle);
                buf.put_u8(param.num_bis);
                buf.put_uint_le(u64::from(param.sdu_interval & 0xff_ffff), 3);
                buf.put_u16_le(param.max_sdu);
                buf.put_u16_le(param.max_transport_latency);
                buf.put_u8(param.rtn);
                buf.put_u8(param.phy);
                buf.put_u8(param.packing);
                buf.put_u8(param.framing);
                buf.put_u8(param.encryption as u8);
                buf.put_slice(&param.broadcast_code);
            }
            IsoCommand::TerminateBig { big_handle, reason } => {
                buf.put_u8(*big_handle);
                buf.put_u8(*reason);
            }
            IsoCommand::BigCreateSync { big_handle, param } => {
                buf.put_u8(*big_handle);
                buf.put_u16_le(param.sync_handle);
                buf.put_u8(param.encryption as u8);
                buf.put_slice(&param.broadcast_code);
                buf.put_u8(param.mse);
                buf.put_u16_le(param.big_sync_timeout);
                buf.put_u8(count(param.bis.len())?);
                buf.put_slice(&param.bis);
            }
            IsoCommand::BigTerminateSync { big_handle } => buf.put_u8(*big_handle),
        }
        Ok(buf.freeze())
    }
}

fn count(len: usize) -> Result<u8, IsoError> {
    u8::try_from(len).map_err(|_| IsoError::ParamInvalid)
}

/// ISO data SDU (or fragment) handed to the controller.
#[derive(Clone, Copy, Debug)]
pub struct IsoDataPacket<'a> {
    pub handle: ConnHandle,
    pub data: &'a [u8],
    pub ts_flag: bool,
    pub time_stamp: u32,
    pub seq: u16,
}

/// Host controller GAP interface consumed by the ISO manager.
pub trait IsoController: Send + Sync {
    /// True once the Bluetooth stack is up.
    fn is_enabled(&self) -> bool;

    /// Submit a command. A synchronous reject is reported as
    /// `LowerStack` with its cause, in which case no callback follows.
    fn submit(&self, command: &IsoCommand) -> Result<(), IsoError>;

    fn send_iso_data(&self, packet: &IsoDataPacket<'_>) -> Cause;
}

/// Timing parameters of an established CIS.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsochInfo {
    pub cig_sync_delay: microseconds,
    pub cis_sync_delay: microseconds,
    pub transport_latency_m_s: microseconds,
    pub transport_latency_s_m: microseconds,
    pub max_pdu_m_s: u16,
    pub max_pdu_s_m: u16,
    pub max_sdu_m_s: u16,
    pub max_sdu_s_m: u16,
    pub iso_interval: u16,
    pub phy_m_s: u8,
    pub phy_s_m: u8,
    pub nse: u8,
    pub bn_m_s: u8,
    pub bn_s_m: u8,
    pub ft_m_s: u8,
    pub ft_s_m: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CisEstablishedInfo {
    pub cause: Cause,
    pub conn_handle: u16,
    pub cis_conn_handle: ConnHandle,
    pub cig_id: u8,
    pub cis_id: u8,
    pub info: IsochInfo,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CisRequestInd {
    pub conn_handle: u16,
    pub cis_conn_handle: ConnHandle,
    pub cig_id: u8,
    pub cis_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CisHandleInfo {
    pub cis_id: u8,
    pub cis_conn_handle: ConnHandle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CisConnectState {
    pub cis_id: u8,
    pub cis_conn_handle: ConnHandle,
    pub state: CisState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BisHandleInfo {
    pub bis_index: u8,
    pub bis_conn_handle: ConnHandle,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxSyncInfo {
    pub packet_sequence_number: u16,
    pub time_stamp: u32,
    pub time_offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkQuality {
    pub tx_unacked_packets: u32,
    pub tx_flushed_packets: u32,
    pub tx_last_subevent_packets: u32,
    pub retransmitted_packets: u32,
    pub crc_error_packets: u32,
    pub rx_unreceived_packets: u32,
    pub duplicate_packets: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TestCounters {
    pub received_sdu_count: u32,
    pub missed_sdu_count: u32,
    pub failed_sdu_count: u32,
}

/// Notifications of the CIG manager, one variant per callback type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CigMgrEvent {
    StartSetting { cause: Cause, cig_id: u8, cis: Vec<CisHandleInfo> },
    CreateCis { cause: Cause, cig_id: u8, cis: Vec<CisConnectState> },
    RemoveCig { cause: Cause, cig_id: u8 },
    SetupDataPath { cause: Cause, handle: ConnHandle },
    RemoveDataPath { cause: Cause, handle: ConnHandle },
    DisconnectInfo { cause: Cause, handle: ConnHandle, cig_id: u8, cis_id: u8 },
    CisEstablished(CisEstablishedInfo),
    /// Only callback whose answer matters, see [`CisRequestAction`].
    CisRequestInd(CisRequestInd),
    AcceptCis { cause: Cause, handle: ConnHandle },
    RejectCis { cause: Cause, handle: ConnHandle },
    ReadIsoTxSync { cause: Cause, handle: ConnHandle, info: TxSyncInfo },
    ReadLinkQuality { cause: Cause, handle: ConnHandle, info: LinkQuality },
    IsoTest { cause: Cause, handle: ConnHandle, counters: Option<TestCounters> },
}

/// Notifications of the BIG manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BigMgrEvent {
    BroadcasterState {
        cause: Cause,
        big_handle: u8,
        adv_handle: u8,
        state: BroadcasterState,
        bis: Vec<BisHandleInfo>,
    },
    ReceiverSyncState {
        cause: Cause,
        big_handle: u8,
        sync_handle: u16,
        state: ReceiverSyncState,
        bis: Vec<BisHandleInfo>,
    },
    SetupDataPath { cause: Cause, handle: ConnHandle },
    RemoveDataPath { cause: Cause, handle: ConnHandle },
    ReadIsoTxSync { cause: Cause, handle: ConnHandle, info: TxSyncInfo },
    ReadLinkQuality { cause: Cause, handle: ConnHandle, info: LinkQuality },
}

/// Answer to a CIS request indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CisRequestAction {
    Accept,
    Reject(u8),
    /// The application answers later with accept_cis or reject_cis.
    Pending,
}

impl CisRequestAction {
    /// App result code of the CIG manager callback.
    pub fn code(self) -> u16 {
        match self {
            CisRequestAction::Accept => 0x0000,
            CisRequestAction::Pending => 0x0001,
            CisRequestAction::Reject(reason) => 0x0400 | u16::from(reason),
        }
    }
}
