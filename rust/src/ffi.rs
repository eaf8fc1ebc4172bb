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

#![allow(clippy::undocumented_unsafe_blocks)]

use std::convert::TryFrom;
use std::mem::ManuallyDrop;
use std::slice;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{status_of, IsoError, Status};
use crate::iso::controller::{
    CigMgrEvent, CigParam, CisConnectState, CisEstablishedInfo, CisHandleInfo, CisParam,
    CisRequestAction, CisRequestInd, CisState, DataPathDirection, DataPathParam, IsoCommand,
    IsoController, IsoDataPacket, Opcode,
};
use crate::iso::event::{IsoDataInd, IsoEvent, IsoEventSink};
use crate::iso::{Cause, ConnHandle, IsoConfig, IsoManager, GAP_SUCCESS};

/// Event codes of `IsoControllerOps::send_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum EventCode {
    CisEstablished = 0x01,
    CisDisconnected = 0x02,
    AcceptorRequestCisInd = 0x03,
    DataReceiveInd = 0x04,
    DataSendDone = 0x05,
    BigBroadcasterStateInd = 0x06,
    BigReceiverSyncStateInd = 0x07,
}

/// Host controller and application callbacks
#[repr(C)]
#[derive(Clone)]
pub struct IsoControllerOps {
    user_pointer: *mut (),
    is_enabled: unsafe extern "C" fn(user: *mut ()) -> bool,
    submit_command:
        unsafe extern "C" fn(user: *mut (), opcode: u8, data: *const u8, len: usize) -> u16,
    send_iso_data: unsafe extern "C" fn(
        user: *mut (),
        handle: u16,
        data: *const u8,
        len: usize,
        ts_flag: bool,
        time_stamp: u32,
        seq: u16,
    ) -> u16,
    send_event: unsafe extern "C" fn(
        user: *mut (),
        event: u8,
        handle: u16,
        cause: u16,
        data: *const u8,
        len: usize,
    ),
}

// The callbacks are required to be callable from any thread.
unsafe impl Send for IsoControllerOps {}
unsafe impl Sync for IsoControllerOps {}

impl IsoController for IsoControllerOps {
    fn is_enabled(&self) -> bool {
        unsafe { (self.is_enabled)(self.user_pointer) }
    }

    fn submit(&self, command: &IsoCommand) -> Result<(), IsoError> {
        let opcode = command.opcode().to_u8().unwrap_or_default();
        let data = command.encode()?;
        let cause = unsafe {
            (self.submit_command)(self.user_pointer, opcode, data.as_ptr(), data.len())
        };
        match cause {
            GAP_SUCCESS => Ok(()),
            cause => Err(IsoError::LowerStack(cause)),
        }
    }

    fn send_iso_data(&self, packet: &IsoDataPacket<'_>) -> Cause {
        unsafe {
            (self.send_iso_data)(
                self.user_pointer,
                packet.handle,
                packet.data.as_ptr(),
                packet.data.len(),
                packet.ts_flag,
                packet.time_stamp,
                packet.seq,
            )
        }
    }
}

impl IsoEventSink for IsoControllerOps {
    fn on_event(&self, event: IsoEvent) {
        let mut buf = BytesMut::with_capacity(16);
        let (code, handle, cause) = match &event {
            IsoEvent::CisEstablished(info) => {
                buf.put_u8(info.cig_id);
                buf.put_u8(info.cis_id);
                buf.put_u16_le(info.conn_handle);
                buf.put_u16_le(info.info.max_sdu_m_s);
                buf.put_u16_le(info.info.max_sdu_s_m);
                buf.put_u16_le(info.info.iso_interval);
                (EventCode::CisEstablished, info.cis_conn_handle, info.cause)
            }
            IsoEvent::CisDisconnected { cause, handle, cig_id, cis_id } => {
                buf.put_u8(*cig_id);
                buf.put_u8(*cis_id);
                (EventCode::CisDisconnected, *handle, *cause)
            }
            IsoEvent::AcceptorRequestCisInd(ind) => {
                buf.put_u8(ind.cig_id);
                buf.put_u8(ind.cis_id);
                buf.put_u16_le(ind.conn_handle);
                (EventCode::AcceptorRequestCisInd, ind.cis_conn_handle, GAP_SUCCESS)
            }
            IsoEvent::DataReceiveInd(ind) => {
                buf.put_u8(ind.status);
                buf.put_u8(ind.ts_flag as u8);
                buf.put_u32_le(ind.time_stamp);
                buf.put_u16_le(ind.seq);
                buf.put_slice(&ind.data);
                (EventCode::DataReceiveInd, ind.handle, GAP_SUCCESS)
            }
            IsoEvent::DataSendDone { handle, len, result } => {
                buf.put_u32_le(u32::try_from(*len).unwrap_or(u32::MAX));
                (EventCode::DataSendDone, *handle, status_of(result))
            }
            IsoEvent::BigBroadcasterStateInd { cause, big_handle, adv_handle, state } => {
                buf.put_u8(*adv_handle);
                buf.put_u8(state.to_u8().unwrap_or_default());
                (EventCode::BigBroadcasterStateInd, u16::from(*big_handle), *cause)
            }
            IsoEvent::BigReceiverSyncStateInd { cause, big_handle, state } => {
                buf.put_u8(state.to_u8().unwrap_or_default());
                (EventCode::BigReceiverSyncStateInd, u16::from(*big_handle), *cause)
            }
        };
        unsafe {
            (self.send_event)(
                self.user_pointer,
                code.to_u8().unwrap_or_default(),
                handle,
                cause,
                buf.as_ptr(),
                buf.len(),
            )
        }
    }
}

/// ISO manager driven through the C ABI. Events are delivered
/// through the `send_event` callback of its ops.
pub struct IsoStack {
    manager: IsoManager,
    ops: Arc<IsoControllerOps>,
}

fn status(result: Result<(), IsoError>) -> u16 {
    status_of(&result)
}

/// Create a new ISO manager instance
/// # Arguments
/// * `ops` - Function callbacks required by the ISO manager
#[no_mangle]
pub extern "C" fn iso_manager_create(ops: IsoControllerOps) -> *const IsoStack {
    let ops = Arc::new(ops);
    let manager = IsoManager::with_thread_timer(IsoConfig::default(), ops.clone());
    Arc::into_raw(Arc::new(IsoStack { manager, ops }))
}

/// Deallocate the ISO manager instance, cancelling every pending operation
/// # Arguments
/// * `iso` - ISO manager pointer
/// # Safety
/// - `iso` must be a valid pointer and must not be reused afterwards
#[no_mangle]
pub unsafe extern "C" fn iso_manager_destroy(iso: *const IsoStack) {
    let iso = unsafe { Arc::from_raw(iso) };
    iso.manager.deinit();
}

/// Allocate the CIG and CIS tables
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_init(iso: *const IsoStack, cig_num: u8, cis_num: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status(iso.manager.cig_init(cig_num, cis_num))
}

/// Register a CIG as initiator
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_register(iso: *const IsoStack, cig_id: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status(iso.manager.register_cig(cig_id, iso.ops.clone()))
}

/// Register as acceptor. CIS requests are answered with the action
/// configured with `iso_cig_config_cis_req_action`.
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_register_acceptor(iso: *const IsoStack) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status(iso.manager.register_acceptor(iso.ops.clone(), None))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_add_cis(iso: *const IsoStack, cig_id: u8, cis_id: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status(iso.manager.add_cis(cig_id, cis_id))
}

/// # Safety
/// - `iso` must be a valid pointer
/// - `param` must be null or valid for reads
#[no_mangle]
pub unsafe extern "C" fn iso_cig_set_cig_param(
    iso: *const IsoStack,
    cig_id: u8,
    param: *const CigParam,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    match unsafe { param.as_ref() } {
        Some(param) => status(iso.manager.set_cig_param(cig_id, *param)),
        None => Status::ParamInvalid.into(),
    }
}

/// # Safety
/// - `iso` must be a valid pointer
/// - `param` must be null or valid for reads
#[no_mangle]
pub unsafe extern "C" fn iso_cig_set_cis_param(
    iso: *const IsoStack,
    cis_id: u8,
    param: *const CisParam,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    match unsafe { param.as_ref() } {
        Some(param) => status(iso.manager.set_cis_param(cis_id, *param)),
        None => Status::ParamInvalid.into(),
    }
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_set_cis_acl_link(
    iso: *const IsoStack,
    cis_id: u8,
    conn_id: u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status(iso.manager.set_cis_acl_link(cis_id, conn_id))
}

/// Configure the answer to CIS requests
/// # Arguments
/// * `action` - 0 accept, 1 let the application answer, 2 reject
/// * `reason` - HCI reason of the reject
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_config_cis_req_action(
    iso: *const IsoStack,
    action: u8,
    reason: u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let action = match action {
        0 => CisRequestAction::Accept,
        1 => CisRequestAction::Pending,
        2 => CisRequestAction::Reject(reason),
        _ => return Status::ParamInvalid.into(),
    };
    status(iso.manager.config_cis_req_action(action))
}

/// Create the CIG in the controller, blocking until it completes
/// # Arguments
/// * `cis_ids`, `handles` - Returns the handles of the CISes of the CIG
/// * `capacity` - Length of `cis_ids` and `handles`
/// * `count` - Returns the number of CISes
/// # Safety
/// - `iso` must be a valid pointer
/// - `cis_ids` and `handles` must be valid for writes of `capacity` elements
/// - `count` must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn iso_cig_start_setting(
    iso: *const IsoStack,
    cig_id: u8,
    cis_ids: *mut u8,
    handles: *mut u16,
    capacity: u8,
    count: *mut u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    if cis_ids.is_null() || handles.is_null() || count.is_null() {
        return Status::ParamInvalid.into();
    }
    let result = iso.manager.block_on(iso.manager.start_setting(cig_id));
    if let Ok(cis) = &result {
        let cis_ids = unsafe { slice::from_raw_parts_mut(cis_ids, usize::from(capacity)) };
        let handles = unsafe { slice::from_raw_parts_mut(handles, usize::from(capacity)) };
        let mut written = 0;
        for (entry, (id, handle)) in cis.iter().zip(cis_ids.iter_mut().zip(handles.iter_mut())) {
            *id = entry.cis_id;
            *handle = entry.cis_conn_handle;
            written += 1;
        }
        unsafe { *count = written };
    }
    status_of(&result)
}

/// Establish every CIS of a CIG, blocking until the controller answers
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_create_cis_by_cig_id(iso: *const IsoStack, cig_id: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.create_cis_by_cig_id(cig_id)))
}

/// Establish some CISes of a CIG, blocking until the controller answers
/// # Safety
/// - `iso` must be a valid pointer
/// - `handles` must be valid for reads of `count` elements
#[no_mangle]
pub unsafe extern "C" fn iso_cig_create_cis_by_handles(
    iso: *const IsoStack,
    cig_id: u8,
    handles: *const u16,
    count: u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    if handles.is_null() {
        return Status::ParamInvalid.into();
    }
    let handles = unsafe { slice::from_raw_parts(handles, usize::from(count)) };
    status_of(&iso.manager.block_on(iso.manager.create_cis_by_handles(cig_id, handles)))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_remove(iso: *const IsoStack, cig_id: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.remove_cig(cig_id)))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_disconnect(iso: *const IsoStack, handle: u16, reason: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.disconnect(handle, reason)))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_accept_cis(iso: *const IsoStack, handle: u16) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.accept_cis(handle)))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_cig_reject_cis(iso: *const IsoStack, handle: u16, reason: u8) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.reject_cis(handle, reason)))
}

/// Set up the data path of a CIS or BIS
/// # Arguments
/// * `direction` - 0 input (host to controller), 1 output
/// # Safety
/// - `iso` must be a valid pointer
/// - `codec_config` must be valid for reads of `codec_config_len` bytes
#[no_mangle]
pub unsafe extern "C" fn iso_setup_data_path(
    iso: *const IsoStack,
    handle: u16,
    direction: u8,
    path_id: u8,
    codec_id: *const [u8; 5],
    controller_delay: u32,
    codec_config: *const u8,
    codec_config_len: u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let codec_id = unsafe { codec_id.as_ref() };
    let (direction, codec_id) = match (DataPathDirection::from_u8(direction), codec_id) {
        (Some(direction), Some(codec_id)) => (direction, *codec_id),
        _ => return Status::ParamInvalid.into(),
    };
    let codec_config = if codec_config.is_null() {
        Bytes::new()
    } else {
        let codec_config =
            unsafe { slice::from_raw_parts(codec_config, usize::from(codec_config_len)) };
        Bytes::copy_from_slice(codec_config)
    };
    let param = DataPathParam { direction, path_id, codec_id, controller_delay, codec_config };
    status_of(&iso.manager.block_on(iso.manager.setup_data_path(handle, param)))
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_remove_data_path(
    iso: *const IsoStack,
    handle: u16,
    directions: u8,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    status_of(&iso.manager.block_on(iso.manager.remove_data_path(handle, directions)))
}

/// Query the connection handle of a CIS
/// Returns true if successful
/// # Safety
/// - `iso` must be a valid pointer
/// - `handle` must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn iso_get_cis_conn_handle(
    iso: *const IsoStack,
    cig_id: u8,
    cis_id: u8,
    handle: *mut u16,
) -> bool {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    iso.manager
        .get_cis_conn_handle(cig_id, cis_id)
        .map(|cis_conn_handle| unsafe {
            *handle = cis_conn_handle;
        })
        .is_ok()
}

/// Query the identifiers of a CIS. `conn_id` is 0xff when the CIS
/// is not bound to an ACL link.
/// Returns true if successful
/// # Safety
/// - `iso` must be a valid pointer
/// - `cig_id`, `cis_id` and `conn_id` must be valid for writes
#[no_mangle]
pub unsafe extern "C" fn iso_get_cis_information(
    iso: *const IsoStack,
    handle: u16,
    cig_id: *mut u8,
    cis_id: *mut u8,
    conn_id: *mut u8,
) -> bool {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    iso.manager
        .get_cis_info(handle)
        .map(|info| unsafe {
            *cig_id = info.cig_id;
            *cis_id = info.cis_id;
            *conn_id = info.conn_id.unwrap_or(0xff);
        })
        .is_some()
}

/// Queue an SDU for transmission. The data is copied, completion is
/// reported with a `DataSendDone` event.
/// # Arguments
/// * `sdu_interval` - SDU interval in milliseconds
/// # Safety
/// - `iso` must be a valid pointer
/// - `data` must be valid for reads of len `len`
#[no_mangle]
pub unsafe extern "C" fn iso_send(
    iso: *const IsoStack,
    handle: u16,
    data: *const u8,
    len: usize,
    ts_flag: bool,
    time_stamp: u32,
    seq: u16,
    sdu_interval: u32,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    if data.is_null() {
        return Status::ParamInvalid.into();
    }
    let data = Bytes::copy_from_slice(unsafe { slice::from_raw_parts(data, len) });
    status(iso.manager.send(handle, data, ts_flag, time_stamp, seq, sdu_interval))
}

/// Release the active role, cancelling every pending operation
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_deinit(iso: *const IsoStack) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    iso.manager.deinit();
}

/// Completion of a CIG setting
/// # Safety
/// - `iso` must be a valid pointer
/// - `cis_ids` and `handles` must be valid for reads of `count` elements
#[no_mangle]
pub unsafe extern "C" fn iso_on_start_setting(
    iso: *const IsoStack,
    cause: u16,
    cig_id: u8,
    cis_ids: *const u8,
    handles: *const u16,
    count: u8,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let cis = if count == 0 {
        Vec::new()
    } else {
        let cis_ids = unsafe { slice::from_raw_parts(cis_ids, usize::from(count)) };
        let handles = unsafe { slice::from_raw_parts(handles, usize::from(count)) };
        cis_ids
            .iter()
            .zip(handles)
            .map(|(cis_id, handle)| CisHandleInfo { cis_id: *cis_id, cis_conn_handle: *handle })
            .collect()
    };
    iso.manager.on_cig_event(CigMgrEvent::StartSetting { cause, cig_id, cis });
}

/// Completion of a CIS creation
/// # Safety
/// - `iso` must be a valid pointer
/// - `cis_ids`, `handles` and `states` must be valid for reads of `count` elements
#[no_mangle]
pub unsafe extern "C" fn iso_on_create_cis(
    iso: *const IsoStack,
    cause: u16,
    cig_id: u8,
    cis_ids: *const u8,
    handles: *const u16,
    states: *const u8,
    count: u8,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let cis = if count == 0 {
        Vec::new()
    } else {
        let cis_ids = unsafe { slice::from_raw_parts(cis_ids, usize::from(count)) };
        let handles = unsafe { slice::from_raw_parts(handles, usize::from(count)) };
        let states = unsafe { slice::from_raw_parts(states, usize::from(count)) };
        (0..usize::from(count))
            .map(|index| CisConnectState {
                cis_id: cis_ids[index],
                cis_conn_handle: handles[index],
                state: CisState::from_u8(states[index]).unwrap_or(CisState::Idle),
            })
            .collect()
    };
    iso.manager.on_cig_event(CigMgrEvent::CreateCis { cause, cig_id, cis });
}

/// # Safety
/// - `iso` must be a valid pointer
/// - `info` must be valid for reads
#[no_mangle]
pub unsafe extern "C" fn iso_on_cis_established(
    iso: *const IsoStack,
    info: *const CisEstablishedInfo,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    if let Some(info) = unsafe { info.as_ref() } {
        iso.manager.on_cig_event(CigMgrEvent::CisEstablished(*info));
    }
}

/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_on_disconnect_info(
    iso: *const IsoStack,
    cause: u16,
    handle: u16,
    cig_id: u8,
    cis_id: u8,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    iso.manager.on_cig_event(CigMgrEvent::DisconnectInfo { cause, handle, cig_id, cis_id });
}

/// CIS request from a peer. Returns the app result code answering it.
/// # Safety
/// - `iso` must be a valid pointer
/// - `ind` must be valid for reads
#[no_mangle]
pub unsafe extern "C" fn iso_on_cis_request_ind(
    iso: *const IsoStack,
    ind: *const CisRequestInd,
) -> u16 {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    match unsafe { ind.as_ref() } {
        Some(ind) => iso.manager.on_cig_event(CigMgrEvent::CisRequestInd(*ind)).code(),
        None => CisRequestAction::Reject(crate::iso::manager::REJECT_LIMITED_RESOURCES).code(),
    }
}

/// Completion of a command carrying no result payload
/// # Arguments
/// * `opcode` - Opcode of the completed command
/// * `target` - CIG identifier or connection handle the command applies to
/// # Safety
/// - `iso` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn iso_on_command_complete(
    iso: *const IsoStack,
    opcode: u8,
    cause: u16,
    target: u16,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let handle: ConnHandle = target;
    let event = match Opcode::from_u8(opcode) {
        Some(Opcode::RemoveCig) => CigMgrEvent::RemoveCig { cause, cig_id: target as u8 },
        Some(Opcode::SetupDataPath) => CigMgrEvent::SetupDataPath { cause, handle },
        Some(Opcode::RemoveDataPath) => CigMgrEvent::RemoveDataPath { cause, handle },
        Some(Opcode::AcceptCis) => CigMgrEvent::AcceptCis { cause, handle },
        Some(Opcode::RejectCis) => CigMgrEvent::RejectCis { cause, handle },
        Some(Opcode::IsoTest) => CigMgrEvent::IsoTest { cause, handle, counters: None },
        other => {
            warn!("unexpected completion of opcode {:#04x} ({:?})", opcode, other);
            return;
        }
    };
    iso.manager.on_cig_event(event);
}

/// Inbound SDU
/// # Safety
/// - `iso` must be a valid pointer
/// - `data` must be valid for reads of len `len`
#[no_mangle]
pub unsafe extern "C" fn iso_on_data_ind(
    iso: *const IsoStack,
    handle: u16,
    status: u8,
    ts_flag: bool,
    time_stamp: u32,
    seq: u16,
    data: *const u8,
    len: usize,
) {
    let iso = ManuallyDrop::new(unsafe { Arc::from_raw(iso) });
    let data = if data.is_null() {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(unsafe { slice::from_raw_parts(data, len) })
    };
    iso.manager.on_iso_data_ind(IsoDataInd { handle, status, ts_flag, time_stamp, seq, data });
}
