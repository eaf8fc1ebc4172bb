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

//! Lifecycle of the CIGs, CISes and BIGs.
//!
//! Application requests are validated locally, registered in the
//! pending table and forwarded to the controller. Controller callbacks
//! either resolve the matching pending command or, when nobody waits
//! for them, are reported to the application as [`IsoEvent`]s.
//!
//! No lock is held while calling into the controller or the
//! application.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};

use crate::error::IsoError;
use crate::iso::controller::{
    AcceptorSduConfig, BigMgrEvent, BigParam, BigSyncParam, BisHandleInfo, BroadcasterState,
    CigMgrEvent, CigParam, CigTestParam, CisConnectState, CisEstablishedInfo, CisHandleInfo,
    CisParam, CisRequestAction, CisRequestInd, CisState, DataPathParam, IsoCommand, IsoController,
    IsoDataPacket, IsoTestCommand, IsochInfo, LinkQuality, ReceiverSyncState, TestCounters,
    TxSyncInfo,
};
use crate::iso::event::{IsoDataInd, IsoEvent, IsoEventSink};
use crate::iso::fragment::{IsoDataFragmenter, IsoSdu, SduOutcome};
use crate::iso::pending::{
    BigInfo, CommandPendingTable, CommandResult, CommandTag, Completion, PendingScope,
};
use crate::iso::registry::{
    check_id, BigState, DataPath, IsochChannelRegistry, MAX_BIG_NUMBER, MAX_BIS_NUMBER,
    MAX_CIG_NUMBER, MAX_CIS_NUMBER,
};
use crate::iso::{Cause, ConnHandle, IsoRole, DATA_PATH_INPUT, DATA_PATH_OUTPUT, GAP_SUCCESS};
use crate::timer::{PeriodicTimer, ThreadTimer};

/// Max SDU used when neither the CIS nor the BIS negotiated one.
pub const DEFAULT_MAX_SDU: u16 = 128;

/// Bound of the blocking waits of the C ABI.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection Rejected due to Limited Resources.
pub const REJECT_LIMITED_RESOURCES: u8 = 0x0d;

#[derive(Clone, Debug)]
pub struct IsoConfig {
    pub max_cig: usize,
    pub max_cis: usize,
    pub max_big: usize,
    pub max_bis: usize,
    pub default_max_sdu: u16,
    pub command_timeout: Duration,
    /// Answer to CIS requests when no handler is registered.
    pub cis_request_action: CisRequestAction,
}

impl Default for IsoConfig {
    fn default() -> Self {
        IsoConfig {
            max_cig: MAX_CIG_NUMBER,
            max_cis: MAX_CIS_NUMBER,
            max_big: MAX_BIG_NUMBER,
            max_bis: MAX_BIS_NUMBER,
            default_max_sdu: DEFAULT_MAX_SDU,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            cis_request_action: CisRequestAction::Pending,
        }
    }
}

impl IsoConfig {
    pub fn with_cig_capacity(mut self, max_cig: usize, max_cis: usize) -> Self {
        self.max_cig = max_cig;
        self.max_cis = max_cis;
        self
    }

    pub fn with_big_capacity(mut self, max_big: usize, max_bis: usize) -> Self {
        self.max_big = max_big;
        self.max_bis = max_bis;
        self
    }

    pub fn with_default_max_sdu(mut self, max_sdu: u16) -> Self {
        self.default_max_sdu = max_sdu;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_cis_request_action(mut self, action: CisRequestAction) -> Self {
        self.cis_request_action = action;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CisRequestDecision {
    Accept,
    Reject(u8),
    /// Answer later with [`IsoManager::accept_cis`] or [`IsoManager::reject_cis`].
    Defer,
}

/// Application decision point for incoming CIS requests. Called from
/// the controller callback context, the answer is expected immediately.
pub trait CisRequestHandler: Send + Sync {
    fn decide(&self, request: &CisRequestInd) -> CisRequestDecision;
}

/// Identity of a CIS record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CisInfo {
    pub cig_id: u8,
    pub cis_id: u8,
    pub role: IsoRole,
    pub state: CisState,
    pub conn_id: Option<u8>,
    pub data_path: u8,
}

struct State {
    role: Option<IsoRole>,
    sink: Option<Arc<dyn IsoEventSink>>,
    request_handler: Option<Arc<dyn CisRequestHandler>>,
    cis_request_action: CisRequestAction,
    registry: IsochChannelRegistry,
    cig_initialized: bool,
    big_initialized: bool,
}

impl State {
    fn require_role(&self, role: IsoRole) -> Result<(), IsoError> {
        match self.role {
            Some(active) if active == role => Ok(()),
            Some(active) => Err(IsoError::RoleConflict { active, requested: role }),
            None => Err(IsoError::InvalidState),
        }
    }

    // Returns true if the role was not active before.
    fn claim_role(&mut self, role: IsoRole) -> Result<bool, IsoError> {
        match self.role {
            Some(active) if active == role => Ok(false),
            Some(active) => {
                warn!("cannot register {:?}, {:?} is active", role, active);
                Err(IsoError::RoleConflict { active, requested: role })
            }
            None => {
                self.role = Some(role);
                Ok(true)
            }
        }
    }

    fn release_role(&mut self) {
        self.role = None;
        self.sink = None;
        self.request_handler = None;
    }
}

struct Inner {
    config: IsoConfig,
    controller: Arc<dyn IsoController>,
    timer: Arc<dyn PeriodicTimer>,
    pending: CommandPendingTable,
    state: Mutex<State>,
    send_queue: Mutex<IsoDataFragmenter>,
}

/// ISO subsystem. Cloning yields another handle on the same subsystem.
#[derive(Clone)]
pub struct IsoManager {
    inner: Arc<Inner>,
}

fn cause_to_result(cause: Cause, result: CommandResult) -> Result<CommandResult, IsoError> {
    if cause == GAP_SUCCESS {
        Ok(result)
    } else {
        Err(IsoError::LowerStack(cause))
    }
}

impl IsoManager {
    pub fn new(
        config: IsoConfig,
        controller: Arc<dyn IsoController>,
        timer: Arc<dyn PeriodicTimer>,
    ) -> Self {
        let state = State {
            role: None,
            sink: None,
            request_handler: None,
            cis_request_action: config.cis_request_action,
            registry: IsochChannelRegistry::default(),
            cig_initialized: false,
            big_initialized: false,
        };
        IsoManager {
            inner: Arc::new(Inner {
                config,
                controller,
                timer,
                pending: CommandPendingTable::new(),
                state: Mutex::new(state),
                send_queue: Mutex::new(IsoDataFragmenter::new()),
            }),
        }
    }

    /// Manager pacing its fragments with a dedicated timer thread.
    pub fn with_thread_timer(config: IsoConfig, controller: Arc<dyn IsoController>) -> Self {
        Self::new(config, controller, Arc::new(ThreadTimer::new("iso-send")))
    }

    pub fn config(&self) -> &IsoConfig {
        &self.inner.config
    }

    pub fn active_role(&self) -> Option<IsoRole> {
        self.state().role
    }

    /// Block until a command completes, bounded by the configured timeout.
    pub fn block_on<T>(&self, completion: Result<Completion<T>, IsoError>) -> Result<T, IsoError>
    where
        T: std::convert::TryFrom<CommandResult, Error = IsoError>,
    {
        completion?.wait_timeout(self.inner.config.command_timeout)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, IsoDataFragmenter> {
        self.inner.send_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_ready(&self) -> Result<(), IsoError> {
        if self.inner.controller.is_enabled() {
            Ok(())
        } else {
            Err(IsoError::NotReady)
        }
    }

    fn submit(&self, command: IsoCommand) -> Result<(), IsoError> {
        let opcode = command.opcode();
        debug!("submit {:?}", opcode);
        self.inner.controller.submit(&command).map_err(|err| {
            error!("{:?} rejected: {}", opcode, err);
            err
        })
    }

    // Register a pending command then submit its request. A synchronous
    // reject resolves the caller immediately.
    fn request<T>(
        &self,
        tag: CommandTag,
        scope: PendingScope,
        command: IsoCommand,
    ) -> Result<Completion<T>, IsoError> {
        let completion = self.inner.pending.insert(tag, scope)?;
        if let Err(err) = self.submit(command) {
            self.inner.pending.delete(tag, scope);
            return Err(err);
        }
        Ok(completion)
    }

    fn complete(&self, tag: CommandTag, scope: PendingScope, cause: Cause, result: CommandResult) {
        if !self.inner.pending.resolve(tag, scope, cause_to_result(cause, result)) {
            error!("no pending {:?} command for {:?}", tag, scope);
        }
    }

    fn emit(&self, event: IsoEvent) {
        let sink = self.state().sink.clone();
        match sink {
            Some(sink) => sink.on_event(event),
            None => warn!("no event callback registered, dropping {:?}", event),
        }
    }

    // Validate a data path request: the handle must carry data.
    fn check_established(&self, handle: ConnHandle) -> Result<(), IsoError> {
        match self.state().registry.is_established(handle) {
            Some(true) => Ok(()),
            Some(false) => Err(IsoError::InvalidState),
            None => Err(IsoError::NotFound),
        }
    }

    pub fn cig_init(&self, cig_num: u8, cis_num: u8) -> Result<(), IsoError> {
        self.check_ready()?;
        if cig_num == 0 || cis_num == 0 {
            return Err(IsoError::ParamInvalid);
        }
        if usize::from(cig_num) > self.inner.config.max_cig
            || usize::from(cis_num) > self.inner.config.max_cis
        {
            return Err(IsoError::NoResource);
        }
        self.submit(IsoCommand::CigMgrInit { cig_num, cis_num })?;

        let mut state = self.state();
        state.registry.init_cig(usize::from(cig_num), usize::from(cis_num));
        state.cig_initialized = true;
        info!("CIG manager initialized for {} CIG(s), {} CIS(es)", cig_num, cis_num);
        Ok(())
    }

    /// Register a CIG as initiator. Events of the initiator role are
    /// delivered to `sink`.
    pub fn register_cig(&self, cig_id: u8, sink: Arc<dyn IsoEventSink>) -> Result<(), IsoError> {
        self.check_ready()?;
        check_id(cig_id)?;
        let claimed = {
            let mut state = self.state();
            if !state.cig_initialized {
                return Err(IsoError::InvalidState);
            }
            let claimed = state.claim_role(IsoRole::Initiator)?;
            let added = state.registry.add_cig(cig_id).map(|_| ());
            if let Err(err) = added {
                if claimed {
                    state.release_role();
                }
                return Err(err);
            }
            state.sink = Some(sink);
            claimed
        };

        if let Err(err) = self.submit(IsoCommand::RegisterCig { cig_id }) {
            let mut state = self.state();
            state.registry.remove_cig(cig_id);
            if claimed {
                state.release_role();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Register the acceptor role. Without `handler`, CIS requests are
    /// answered with the configured default action.
    pub fn register_acceptor(
        &self,
        sink: Arc<dyn IsoEventSink>,
        handler: Option<Arc<dyn CisRequestHandler>>,
    ) -> Result<(), IsoError> {
        self.check_ready()?;
        let claimed = {
            let mut state = self.state();
            if !state.cig_initialized {
                return Err(IsoError::InvalidState);
            }
            let claimed = state.claim_role(IsoRole::Acceptor)?;
            state.sink = Some(sink);
            state.request_handler = handler;
            claimed
        };

        if let Err(err) = self.submit(IsoCommand::RegisterAcceptor) {
            if claimed {
                self.state().release_role();
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn add_cis(&self, cig_id: u8, cis_id: u8) -> Result<(), IsoError> {
        self.check_ready()?;
        check_id(cig_id)?;
        check_id(cis_id)?;
        let created = {
            let mut state = self.state();
            state.require_role(IsoRole::Initiator)?;
            let created = state.registry.cis(cig_id, cis_id).is_none();
            state.registry.add_cis(cig_id, cis_id, IsoRole::Initiator)?;
            created
        };

        if let Err(err) = self.submit(IsoCommand::AddCis { cig_id, cis_id }) {
            if created {
                self.state().registry.remove_cis(cig_id, cis_id);
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn set_cig_param(&self, cig_id: u8, param: CigParam) -> Result<(), IsoError> {
        self.check_ready()?;
        check_id(cig_id)?;
        {
            let mut state = self.state();
            state.require_role(IsoRole::Initiator)?;
            state.registry.cig_mut(cig_id).ok_or(IsoError::ParamInvalid)?.param = Some(param);
        }
        self.submit(IsoCommand::SetCigParam { cig_id, param })
    }

    pub fn set_cis_param(&self, cis_id: u8, param: CisParam) -> Result<(), IsoError> {
        self.check_ready()?;
        check_id(cis_id)?;
        {
            let mut state = self.state();
            state.require_role(IsoRole::Initiator)?;
            state.registry.cis_by_id_mut(cis_id).ok_or(IsoError::ParamInvalid)?.param = Some(param);
        }
        self.submit(IsoCommand::SetCisParam { cis_id, param })
    }

    /// Bind a CIS to the ACL link `conn_id`.
    pub fn set_cis_acl_link(&self, cis_id: u8, conn_id: u8) -> Result<(), IsoError> {
        self.check_ready()?;
        check_id(cis_id)?;
        {
            let mut state = self.state();
            state.require_role(IsoRole::Initiator)?;
            let cis = state.registry.cis_by_id_mut(cis_id).ok_or(IsoError::ParamInvalid)?;
            cis.conn_id = Some(conn_id);
        }
        self.submit(IsoCommand::SetCisAclLink { cis_id, conn_id })
    }

    /// Default answer to CIS requests when no handler is registered.
    pub fn config_cis_req_action(&self, action: CisRequestAction) -> Result<(), IsoError> {
        self.check_ready()?;
        self.state().cis_request_action = action;
        Ok(())
    }

    fn check_cig(&self, cig_id: u8) -> Result<(), IsoError> {
        check_id(cig_id)?;
        let state = self.state();
        state.require_role(IsoRole::Initiator)?;
        state.registry.cig(cig_id).map(|_| ()).ok_or(IsoError::ParamInvalid)
    }

    /// Create the CIG in the controller. Completes with the handles
    /// assigned to its CISes.
    pub fn start_setting(&self, cig_id: u8) -> Result<Completion<Vec<CisHandleInfo>>, IsoError> {
        self.check_ready()?;
        self.check_cig(cig_id)?;
        self.request(
            CommandTag::StartSetting,
            PendingScope::Cig(cig_id),
            IsoCommand::StartSetting { cig_id },
        )
    }

    pub fn start_setting_test(
        &self,
        cig_id: u8,
        param: CigTestParam,
    ) -> Result<Completion<Vec<CisHandleInfo>>, IsoError> {
        self.check_ready()?;
        self.check_cig(cig_id)?;
        self.request(
            CommandTag::StartSetting,
            PendingScope::Cig(cig_id),
            IsoCommand::StartSettingTest { cig_id, param },
        )
    }

    /// Establish every CIS of a CIG.
    pub fn create_cis_by_cig_id(
        &self,
        cig_id: u8,
    ) -> Result<Completion<Vec<CisConnectState>>, IsoError> {
        self.create_cis(cig_id, Vec::new())
    }

    /// Establish a subset of the CISes of a CIG.
    pub fn create_cis_by_handles(
        &self,
        cig_id: u8,
        handles: &[ConnHandle],
    ) -> Result<Completion<Vec<CisConnectState>>, IsoError> {
        if handles.is_empty() {
            return Err(IsoError::ParamInvalid);
        }
        self.create_cis(cig_id, handles.to_vec())
    }

    fn create_cis(
        &self,
        cig_id: u8,
        handles: Vec<ConnHandle>,
    ) -> Result<Completion<Vec<CisConnectState>>, IsoError> {
        self.check_ready()?;
        self.check_cig(cig_id)?;
        let selected = |handle: Option<ConnHandle>| {
            handles.is_empty() || handle.map_or(false, |handle| handles.contains(&handle))
        };

        {
            let mut state = self.state();
            let unknown = handles.iter().any(|handle| {
                state.registry.cis_by_handle(*handle).map_or(true, |cis| cis.cig_id != cig_id)
            });
            if unknown {
                return Err(IsoError::ParamInvalid);
            }
            for cis in state.registry.cises_in_cig_mut(cig_id) {
                if selected(cis.cis_conn_handle) && cis.state == CisState::Idle {
                    cis.state = CisState::Connecting;
                }
            }
        }

        let result = self.request(
            CommandTag::CreateCis,
            PendingScope::Cig(cig_id),
            IsoCommand::CreateCis { cig_id, handles: handles.clone() },
        );
        if result.is_err() {
            let mut state = self.state();
            for cis in state.registry.cises_in_cig_mut(cig_id) {
                if selected(cis.cis_conn_handle) && cis.state == CisState::Connecting {
                    cis.state = CisState::Idle;
                }
            }
        }
        result
    }

    /// Remove a CIG whose CISes are all idle.
    pub fn remove_cig(&self, cig_id: u8) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_cig(cig_id)?;
        let busy = self
            .state()
            .registry
            .cises()
            .any(|cis| cis.cig_id == cig_id && cis.state != CisState::Idle);
        if busy {
            return Err(IsoError::InvalidState);
        }
        self.request(
            CommandTag::RemoveCig,
            PendingScope::Cig(cig_id),
            IsoCommand::RemoveCig { cig_id },
        )
    }

    fn check_acceptor_cis(&self, handle: ConnHandle) -> Result<(), IsoError> {
        let state = self.state();
        state.require_role(IsoRole::Acceptor)?;
        state.registry.cis_by_handle(handle).map(|_| ()).ok_or(IsoError::NotFound)
    }

    /// Accept a deferred CIS request.
    pub fn accept_cis(&self, handle: ConnHandle) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_acceptor_cis(handle)?;
        self.request(
            CommandTag::AcceptCis,
            PendingScope::Handle(handle),
            IsoCommand::AcceptCis { handle },
        )
    }

    /// Reject a deferred CIS request.
    pub fn reject_cis(&self, handle: ConnHandle, reason: u8) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_acceptor_cis(handle)?;
        self.request(
            CommandTag::RejectCis,
            PendingScope::Handle(handle),
            IsoCommand::RejectCis { handle, reason },
        )
    }

    pub fn acceptor_config_sdu(
        &self,
        handle: ConnHandle,
        config: AcceptorSduConfig,
    ) -> Result<(), IsoError> {
        self.check_ready()?;
        self.check_acceptor_cis(handle)?;
        self.submit(IsoCommand::AcceptorConfigSdu { handle, config })?;
        if let Some(cis) = self.state().registry.cis_by_handle_mut(handle) {
            cis.acceptor_max_sdu = Some(config.max_sdu_s_m);
        }
        Ok(())
    }

    pub fn setup_data_path(
        &self,
        handle: ConnHandle,
        param: DataPathParam,
    ) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_established(handle)?;
        let direction = param.direction.mask();
        self.set_data_path_request(handle, |path| path.adding = direction);

        let result = self.request(
            CommandTag::SetupDataPath,
            PendingScope::Handle(handle),
            IsoCommand::SetupDataPath { handle, param },
        );
        if result.is_err() {
            self.set_data_path_request(handle, |path| path.adding = 0);
        }
        result
    }

    /// Remove the data path of the given direction bits.
    pub fn remove_data_path(
        &self,
        handle: ConnHandle,
        directions: u8,
    ) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        if directions == 0 || directions & !(DATA_PATH_INPUT | DATA_PATH_OUTPUT) != 0 {
            return Err(IsoError::ParamInvalid);
        }
        self.check_established(handle)?;
        self.set_data_path_request(handle, |path| path.removing = directions);

        let result = self.request(
            CommandTag::RemoveDataPath,
            PendingScope::Handle(handle),
            IsoCommand::RemoveDataPath { handle, directions },
        );
        if result.is_err() {
            self.set_data_path_request(handle, |path| path.removing = 0);
        }
        result
    }

    fn set_data_path_request(&self, handle: ConnHandle, update: impl FnOnce(&mut DataPath)) {
        if let Some(path) = self.state().registry.data_path_mut(handle) {
            update(path);
        }
    }

    /// Disconnect a CIS. Completes when the controller reports the
    /// disconnection.
    pub fn disconnect(&self, handle: ConnHandle, reason: u8) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        let previous = {
            let mut state = self.state();
            let cis = state.registry.cis_by_handle_mut(handle).ok_or(IsoError::NotFound)?;
            let previous = cis.state;
            cis.state = match previous {
                CisState::Connecting => CisState::ConnectingCancel,
                CisState::Connected => CisState::Disconnecting,
                _ => return Err(IsoError::InvalidState),
            };
            previous
        };

        let result = self.request(
            CommandTag::DisconnectInfo,
            PendingScope::Handle(handle),
            IsoCommand::Disconnect { handle, reason },
        );
        if result.is_err() {
            if let Some(cis) = self.state().registry.cis_by_handle_mut(handle) {
                cis.state = previous;
            }
        }
        result
    }

    pub fn read_iso_tx_sync(&self, handle: ConnHandle) -> Result<Completion<TxSyncInfo>, IsoError> {
        self.check_ready()?;
        self.check_established(handle)?;
        self.request(
            CommandTag::ReadIsoTxSync,
            PendingScope::Handle(handle),
            IsoCommand::ReadIsoTxSync { handle },
        )
    }

    pub fn read_link_quality(
        &self,
        handle: ConnHandle,
    ) -> Result<Completion<LinkQuality>, IsoError> {
        self.check_ready()?;
        self.check_established(handle)?;
        self.request(
            CommandTag::ReadLinkQuality,
            PendingScope::Handle(handle),
            IsoCommand::ReadLinkQuality { handle },
        )
    }

    fn iso_test<T>(
        &self,
        handle: ConnHandle,
        command: IsoTestCommand,
    ) -> Result<Completion<T>, IsoError> {
        self.check_ready()?;
        self.check_established(handle)?;
        self.request(
            CommandTag::IsoTest,
            PendingScope::Handle(handle),
            IsoCommand::IsoTest { handle, command },
        )
    }

    pub fn transmit_test(
        &self,
        handle: ConnHandle,
        payload_type: u8,
    ) -> Result<Completion<()>, IsoError> {
        self.iso_test(handle, IsoTestCommand::Transmit { payload_type })
    }

    pub fn receive_test(
        &self,
        handle: ConnHandle,
        payload_type: u8,
    ) -> Result<Completion<()>, IsoError> {
        self.iso_test(handle, IsoTestCommand::Receive { payload_type })
    }

    pub fn read_test_counters(
        &self,
        handle: ConnHandle,
    ) -> Result<Completion<TestCounters>, IsoError> {
        self.iso_test(handle, IsoTestCommand::ReadCounters)
    }

    /// Stop a test mode and collect its final counters.
    pub fn iso_test_end(&self, handle: ConnHandle) -> Result<Completion<TestCounters>, IsoError> {
        self.iso_test(handle, IsoTestCommand::End)
    }

    pub fn get_cis_info(&self, handle: ConnHandle) -> Option<CisInfo> {
        self.state().registry.cis_by_handle(handle).map(|cis| CisInfo {
            cig_id: cis.cig_id,
            cis_id: cis.cis_id,
            role: cis.role,
            state: cis.state,
            conn_id: cis.conn_id,
            data_path: cis.data_path.established,
        })
    }

    /// Timing parameters of an established CIS.
    pub fn get_isoch_info(&self, handle: ConnHandle) -> Option<IsochInfo> {
        self.state().registry.cis_by_handle(handle).and_then(|cis| cis.info)
    }

    pub fn get_cis_conn_handle(&self, cig_id: u8, cis_id: u8) -> Result<ConnHandle, IsoError> {
        check_id(cig_id)?;
        check_id(cis_id)?;
        self.state()
            .registry
            .cis(cig_id, cis_id)
            .and_then(|cis| cis.cis_conn_handle)
            .ok_or(IsoError::NotFound)
    }

    pub fn get_conn_id(&self, handle: ConnHandle) -> Option<u8> {
        self.state().registry.cis_by_handle(handle).and_then(|cis| cis.conn_id)
    }

    /// Link quality counters of the last successful read.
    pub fn get_link_quality(&self, handle: ConnHandle) -> Option<LinkQuality> {
        self.state().registry.link_quality_mut(handle).map(|quality| *quality)
    }

    pub fn big_init(&self, big_num: u8, bis_num: u8) -> Result<(), IsoError> {
        self.check_ready()?;
        if big_num == 0 || bis_num == 0 {
            return Err(IsoError::ParamInvalid);
        }
        if usize::from(big_num) > self.inner.config.max_big
            || usize::from(bis_num) > self.inner.config.max_bis
        {
            return Err(IsoError::NoResource);
        }
        self.submit(IsoCommand::BigMgrInit { big_num, bis_num })?;

        let mut state = self.state();
        state.registry.init_big(usize::from(big_num), usize::from(bis_num));
        state.big_initialized = true;
        info!("BIG manager initialized for {} BIG(s), {} BIS(es)", big_num, bis_num);
        Ok(())
    }

    fn register_big_role(
        &self,
        role: IsoRole,
        sink: Arc<dyn IsoEventSink>,
    ) -> Result<(), IsoError> {
        self.check_ready()?;
        let mut state = self.state();
        if !state.big_initialized {
            return Err(IsoError::InvalidState);
        }
        state.claim_role(role)?;
        state.sink = Some(sink);
        Ok(())
    }

    pub fn register_broadcaster(&self, sink: Arc<dyn IsoEventSink>) -> Result<(), IsoError> {
        self.register_big_role(IsoRole::Broadcaster, sink)
    }

    pub fn register_receiver(&self, sink: Arc<dyn IsoEventSink>) -> Result<(), IsoError> {
        self.register_big_role(IsoRole::Receiver, sink)
    }

    fn new_big(
        &self,
        role: IsoRole,
        source_handle: u16,
        state: BigState,
        max_sdu: u16,
    ) -> Result<u8, IsoError> {
        let mut manager_state = self.state();
        manager_state.require_role(role)?;
        let big_handle = manager_state.registry.new_big_handle().ok_or(IsoError::NoResource)?;
        manager_state.registry.add_big(big_handle, source_handle, state)?.max_sdu = max_sdu;
        Ok(big_handle)
    }

    /// Create a BIG on an advertising set. Completes once broadcasting.
    pub fn big_broadcaster_create(
        &self,
        adv_handle: u8,
        param: BigParam,
    ) -> Result<Completion<BigInfo>, IsoError> {
        self.check_ready()?;
        if param.num_bis == 0 {
            return Err(IsoError::ParamInvalid);
        }
        let big_handle = self.new_big(
            IsoRole::Broadcaster,
            u16::from(adv_handle),
            BigState::Broadcaster(BroadcasterState::Idle),
            param.max_sdu,
        )?;

        let result = self.request(
            CommandTag::BroadcastStateChange,
            PendingScope::Big(big_handle),
            IsoCommand::CreateBig { big_handle, adv_handle, param },
        );
        if result.is_err() {
            self.state().registry.remove_big(big_handle);
        }
        result
    }

    /// Terminate a BIG. Completes once the broadcaster is idle.
    pub fn big_broadcaster_terminate(
        &self,
        big_handle: u8,
        reason: u8,
    ) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_big(big_handle, IsoRole::Broadcaster)?;
        self.request(
            CommandTag::BroadcastStateChange,
            PendingScope::Big(big_handle),
            IsoCommand::TerminateBig { big_handle, reason },
        )
    }

    /// Synchronize to a BIG. Completes once synchronized.
    pub fn big_receiver_create_sync(
        &self,
        param: BigSyncParam,
    ) -> Result<Completion<BigInfo>, IsoError> {
        self.check_ready()?;
        if param.bis.is_empty() {
            return Err(IsoError::ParamInvalid);
        }
        let big_handle = self.new_big(
            IsoRole::Receiver,
            param.sync_handle,
            BigState::Receiver(ReceiverSyncState::Terminated),
            0,
        )?;

        let result = self.request(
            CommandTag::ReceiverSyncStateChange,
            PendingScope::Big(big_handle),
            IsoCommand::BigCreateSync { big_handle, param },
        );
        if result.is_err() {
            self.state().registry.remove_big(big_handle);
        }
        result
    }

    pub fn big_receiver_terminate_sync(&self, big_handle: u8) -> Result<Completion<()>, IsoError> {
        self.check_ready()?;
        self.check_big(big_handle, IsoRole::Receiver)?;
        self.request(
            CommandTag::ReceiverSyncStateChange,
            PendingScope::Big(big_handle),
            IsoCommand::BigTerminateSync { big_handle },
        )
    }

    fn check_big(&self, big_handle: u8, role: IsoRole) -> Result<(), IsoError> {
        let state = self.state();
        state.require_role(role)?;
        match state.registry.big(big_handle) {
            Some(big) if big.role() == role => Ok(()),
            _ => Err(IsoError::NotFound),
        }
    }

    // Max SDU of the transmit direction of a handle.
    fn max_sdu(&self, handle: ConnHandle) -> Result<u16, IsoError> {
        let state = self.state();
        let cis = state.registry.cis_by_handle(handle);
        let bis = state.registry.bis_max_sdu(handle);
        if let Some(cis) = cis {
            if cis.state != CisState::Connected {
                return Err(IsoError::InvalidState);
            }
        } else if bis.is_none() {
            return Err(IsoError::NotFound);
        }

        let cis = cis.map(|cis| cis.max_sdu_tx()).filter(|max_sdu| *max_sdu > 0);
        let bis = bis.filter(|max_sdu| *max_sdu > 0);
        Ok(match (cis, bis) {
            (Some(cis), Some(bis)) => cis.min(bis),
            (Some(max_sdu), None) | (None, Some(max_sdu)) => max_sdu,
            (None, None) => self.inner.config.default_max_sdu,
        })
    }

    /// Queue an SDU for transmission, fragmented to the max SDU of the
    /// handle and paced at `sdu_interval` milliseconds. Completion is
    /// reported with an [`IsoEvent::DataSendDone`].
    pub fn send(
        &self,
        handle: ConnHandle,
        data: Bytes,
        ts_flag: bool,
        time_stamp: u32,
        seq: u16,
        sdu_interval: u32,
    ) -> Result<(), IsoError> {
        let sdu = IsoSdu { handle, data, ts_flag, time_stamp, seq, sdu_interval };
        self.enqueue(sdu, false).map(|_| ())
    }

    /// Same as [`IsoManager::send`], completing with the SDU length
    /// instead of reporting an event.
    pub fn send_with_completion(
        &self,
        handle: ConnHandle,
        data: Bytes,
        ts_flag: bool,
        time_stamp: u32,
        seq: u16,
        sdu_interval: u32,
    ) -> Result<Completion<usize>, IsoError> {
        self.check_ready()?;
        let completion =
            self.inner.pending.insert(CommandTag::DataSend, PendingScope::Handle(handle))?;
        let sdu = IsoSdu { handle, data, ts_flag, time_stamp, seq, sdu_interval };
        if let Err(err) = self.enqueue(sdu, true) {
            self.inner.pending.delete(CommandTag::DataSend, PendingScope::Handle(handle));
            return Err(err);
        }
        Ok(completion)
    }

    fn enqueue(&self, sdu: IsoSdu, awaited: bool) -> Result<usize, IsoError> {
        self.check_ready()?;
        if sdu.data.is_empty() || sdu.sdu_interval == 0 {
            return Err(IsoError::ParamInvalid);
        }
        let max_sdu = self.max_sdu(sdu.handle)?;
        let period = Duration::from_millis(u64::from(sdu.sdu_interval));

        // Timer state only changes with the queue locked.
        let mut queue = self.queue();
        if !self.inner.timer.is_running() {
            let inner = Arc::downgrade(&self.inner);
            let tick = Arc::new(move || {
                if let Some(inner) = inner.upgrade() {
                    IsoManager { inner }.on_send_timer();
                }
            });
            if !self.inner.timer.start(period, tick) {
                return Err(IsoError::NoMemory);
            }
        }

        let result = queue.enqueue(sdu, max_sdu, awaited);
        if queue.is_empty() {
            self.inner.timer.stop();
        }
        result
    }

    /// Send one fragment. Runs on every tick of the send timer.
    pub fn on_send_timer(&self) {
        let fragment = {
            let mut queue = self.queue();
            match queue.pop() {
                Some(fragment) => fragment,
                None => {
                    self.inner.timer.stop();
                    return;
                }
            }
        };

        let cause = self.inner.controller.send_iso_data(&IsoDataPacket {
            handle: fragment.handle,
            data: &fragment.data,
            ts_flag: fragment.ts_flag,
            time_stamp: fragment.tx_time_stamp(),
            seq: fragment.seq,
        });
        if cause != GAP_SUCCESS {
            debug!(
                "fragment {} on handle {:#x} failed with {:#06x}",
                fragment.seq, fragment.handle, cause
            );
        }

        let outcome = {
            let mut queue = self.queue();
            let outcome = queue.complete(&fragment, cause);
            if queue.is_empty() {
                self.inner.timer.stop();
            }
            outcome
        };
        if let Some(outcome) = outcome {
            self.report_send(outcome);
        }
    }

    fn report_send(&self, outcome: SduOutcome) {
        if outcome.awaited {
            let result = outcome.result.map(|_| CommandResult::Sent(outcome.len));
            let scope = PendingScope::Handle(outcome.handle);
            if !self.inner.pending.resolve(CommandTag::DataSend, scope, result) {
                debug!("nobody waits for the SDU sent on handle {:#x}", outcome.handle);
            }
        } else {
            self.emit(IsoEvent::DataSendDone {
                handle: outcome.handle,
                len: outcome.len,
                result: outcome.result,
            });
        }
    }

    /// Send an SDU right away, without fragmentation.
    pub fn send_direct(
        &self,
        handle: ConnHandle,
        data: &[u8],
        ts_flag: bool,
        time_stamp: u32,
        seq: u16,
    ) -> Result<(), IsoError> {
        self.check_ready()?;
        let max_sdu = self.max_sdu(handle)?;
        if data.is_empty() || data.len() > usize::from(max_sdu) {
            return Err(IsoError::ParamInvalid);
        }
        let packet = IsoDataPacket { handle, data, ts_flag, time_stamp, seq };
        match self.inner.controller.send_iso_data(&packet) {
            GAP_SUCCESS => Ok(()),
            cause => Err(IsoError::LowerStack(cause)),
        }
    }

    /// Inbound SDU from the controller.
    pub fn on_iso_data_ind(&self, ind: IsoDataInd) {
        debug!("received {} byte(s) on handle {:#x}", ind.data.len(), ind.handle);
        self.emit(IsoEvent::DataReceiveInd(ind));
    }

    /// Entry point of the CIG manager callbacks. The returned action is
    /// only meaningful for [`CigMgrEvent::CisRequestInd`].
    pub fn on_cig_event(&self, event: CigMgrEvent) -> CisRequestAction {
        match event {
            CigMgrEvent::StartSetting { cause, cig_id, cis } => {
                info!("CIG {} setting done, cause {:#06x}", cig_id, cause);
                if cause == GAP_SUCCESS {
                    let mut state = self.state();
                    for entry in &cis {
                        if let Some(record) = state.registry.cis_mut(cig_id, entry.cis_id) {
                            record.cis_conn_handle = Some(entry.cis_conn_handle);
                        }
                    }
                }
                self.complete(
                    CommandTag::StartSetting,
                    PendingScope::Cig(cig_id),
                    cause,
                    CommandResult::CisHandles(cis),
                );
            }
            CigMgrEvent::CreateCis { cause, cig_id, cis } => {
                info!("CIG {} create CIS done, cause {:#06x}", cig_id, cause);
                {
                    let mut state = self.state();
                    for entry in &cis {
                        if let Some(record) = state.registry.cis_mut(cig_id, entry.cis_id) {
                            record.cis_conn_handle = Some(entry.cis_conn_handle);
                            record.state = entry.state;
                        }
                    }
                    if cause != GAP_SUCCESS {
                        for record in state.registry.cises_in_cig_mut(cig_id) {
                            if record.state == CisState::Connecting {
                                record.state = CisState::Idle;
                            }
                        }
                    }
                }
                self.complete(
                    CommandTag::CreateCis,
                    PendingScope::Cig(cig_id),
                    cause,
                    CommandResult::CisStates(cis),
                );
            }
            CigMgrEvent::RemoveCig { cause, cig_id } => {
                if cause == GAP_SUCCESS {
                    self.state().registry.remove_cig(cig_id);
                }
                let scope = PendingScope::Cig(cig_id);
                self.complete(CommandTag::RemoveCig, scope, cause, CommandResult::Done);
            }
            CigMgrEvent::SetupDataPath { cause, handle } => self.on_setup_data_path(cause, handle),
            CigMgrEvent::RemoveDataPath { cause, handle } => {
                self.on_remove_data_path(cause, handle)
            }
            CigMgrEvent::DisconnectInfo { cause, handle, cig_id, cis_id } => {
                self.on_disconnect_info(cause, handle, cig_id, cis_id)
            }
            CigMgrEvent::CisEstablished(info) => self.on_cis_established(info),
            CigMgrEvent::CisRequestInd(ind) => return self.on_cis_request_ind(ind),
            CigMgrEvent::AcceptCis { cause, handle } => {
                let scope = PendingScope::Handle(handle);
                self.complete(CommandTag::AcceptCis, scope, cause, CommandResult::Done);
            }
            CigMgrEvent::RejectCis { cause, handle } => {
                if cause == GAP_SUCCESS {
                    self.state().registry.release_cis(handle);
                }
                let scope = PendingScope::Handle(handle);
                self.complete(CommandTag::RejectCis, scope, cause, CommandResult::Done);
            }
            CigMgrEvent::ReadIsoTxSync { cause, handle, info } => {
                self.on_read_iso_tx_sync(cause, handle, info)
            }
            CigMgrEvent::ReadLinkQuality { cause, handle, info } => {
                self.on_read_link_quality(cause, handle, info)
            }
            CigMgrEvent::IsoTest { cause, handle, counters } => {
                let result = counters.map_or(CommandResult::Done, CommandResult::TestCounters);
                self.complete(CommandTag::IsoTest, PendingScope::Handle(handle), cause, result);
            }
        }
        CisRequestAction::Accept
    }

    /// Entry point of the BIG manager callbacks.
    pub fn on_big_event(&self, event: BigMgrEvent) {
        match event {
            BigMgrEvent::BroadcasterState { cause, big_handle, adv_handle, state, bis } => {
                self.on_broadcaster_state(cause, big_handle, adv_handle, state, bis)
            }
            BigMgrEvent::ReceiverSyncState { cause, big_handle, sync_handle: _, state, bis } => {
                self.on_receiver_sync_state(cause, big_handle, state, bis)
            }
            BigMgrEvent::SetupDataPath { cause, handle } => self.on_setup_data_path(cause, handle),
            BigMgrEvent::RemoveDataPath { cause, handle } => {
                self.on_remove_data_path(cause, handle)
            }
            BigMgrEvent::ReadIsoTxSync { cause, handle, info } => {
                self.on_read_iso_tx_sync(cause, handle, info)
            }
            BigMgrEvent::ReadLinkQuality { cause, handle, info } => {
                self.on_read_link_quality(cause, handle, info)
            }
        }
    }

    fn on_setup_data_path(&self, cause: Cause, handle: ConnHandle) {
        self.set_data_path_request(handle, |path| path.complete_setup(cause == GAP_SUCCESS));
        let scope = PendingScope::Handle(handle);
        self.complete(CommandTag::SetupDataPath, scope, cause, CommandResult::Done);
    }

    fn on_remove_data_path(&self, cause: Cause, handle: ConnHandle) {
        self.set_data_path_request(handle, |path| path.complete_remove(cause == GAP_SUCCESS));
        let scope = PendingScope::Handle(handle);
        self.complete(CommandTag::RemoveDataPath, scope, cause, CommandResult::Done);
    }

    fn on_read_iso_tx_sync(&self, cause: Cause, handle: ConnHandle, info: TxSyncInfo) {
        let scope = PendingScope::Handle(handle);
        self.complete(CommandTag::ReadIsoTxSync, scope, cause, CommandResult::TxSync(info));
    }

    fn on_read_link_quality(&self, cause: Cause, handle: ConnHandle, info: LinkQuality) {
        if cause == GAP_SUCCESS {
            if let Some(quality) = self.state().registry.link_quality_mut(handle) {
                *quality = info;
            }
        }
        self.complete(
            CommandTag::ReadLinkQuality,
            PendingScope::Handle(handle),
            cause,
            CommandResult::LinkQuality(info),
        );
    }

    fn on_cis_established(&self, info: CisEstablishedInfo) {
        info!(
            "CIS {}/{} established on handle {:#x}, cause {:#06x}",
            info.cig_id, info.cis_id, info.cis_conn_handle, info.cause
        );
        {
            let mut state = self.state();
            let role = state.registry.cis(info.cig_id, info.cis_id).map(|cis| cis.role);
            match role {
                Some(IsoRole::Acceptor) if info.cause != GAP_SUCCESS => {
                    state.registry.remove_cis(info.cig_id, info.cis_id);
                }
                Some(_) => {
                    if let Some(cis) = state.registry.cis_mut(info.cig_id, info.cis_id) {
                        if info.cause == GAP_SUCCESS {
                            // A cancelled CIS stays cancelled until its disconnect info.
                            if cis.state != CisState::ConnectingCancel {
                                cis.state = CisState::Connected;
                            }
                            cis.cis_conn_handle = Some(info.cis_conn_handle);
                            cis.info = Some(info.info);
                        } else {
                            cis.state = CisState::Idle;
                        }
                    }
                }
                None => warn!("CIS {}/{} established but not registered", info.cig_id, info.cis_id),
            }
        }
        self.emit(IsoEvent::CisEstablished(info));
    }

    fn on_cis_request_ind(&self, ind: CisRequestInd) -> CisRequestAction {
        let (handler, default_action) = {
            let mut state = self.state();
            if state.role != Some(IsoRole::Acceptor) {
                warn!(
                    "CIS request on handle {:#x} without acceptor, rejecting",
                    ind.cis_conn_handle
                );
                return CisRequestAction::Reject(REJECT_LIMITED_RESOURCES);
            }
            match state.registry.add_cis(ind.cig_id, ind.cis_id, IsoRole::Acceptor) {
                Ok(cis) => {
                    cis.cis_conn_handle = Some(ind.cis_conn_handle);
                    cis.state = CisState::Connecting;
                }
                Err(err) => {
                    warn!("CIS request {}/{} cannot be recorded: {}", ind.cig_id, ind.cis_id, err);
                    return CisRequestAction::Reject(REJECT_LIMITED_RESOURCES);
                }
            }
            (state.request_handler.clone(), state.cis_request_action)
        };

        let action = match handler.map(|handler| handler.decide(&ind)) {
            Some(CisRequestDecision::Accept) => CisRequestAction::Accept,
            Some(CisRequestDecision::Reject(reason)) => CisRequestAction::Reject(reason),
            Some(CisRequestDecision::Defer) => CisRequestAction::Pending,
            None => default_action,
        };
        info!("CIS request {}/{} answered {:?}", ind.cig_id, ind.cis_id, action);

        match action {
            CisRequestAction::Pending => self.emit(IsoEvent::AcceptorRequestCisInd(ind)),
            CisRequestAction::Reject(_) => {
                self.state().registry.remove_cis(ind.cig_id, ind.cis_id);
            }
            CisRequestAction::Accept => (),
        }
        action
    }

    fn on_disconnect_info(&self, cause: Cause, handle: ConnHandle, cig_id: u8, cis_id: u8) {
        info!(
            "CIS {}/{} on handle {:#x} disconnected, cause {:#06x}",
            cig_id, cis_id, handle, cause
        );
        {
            let mut state = self.state();
            let role = state.registry.cis_by_handle(handle).map(|cis| cis.role);
            match role {
                // Acceptor records do not outlive their link.
                Some(IsoRole::Acceptor) => {
                    state.registry.release_cis(handle);
                }
                Some(_) => {
                    if let Some(cis) = state.registry.cis_by_handle_mut(handle) {
                        cis.state = CisState::Idle;
                        cis.data_path = DataPath::default();
                        cis.info = None;
                    }
                }
                None => warn!("disconnect info for unknown handle {:#x}", handle),
            }
        }

        // The cause is why the link dropped, an awaited disconnect succeeded.
        let resolved = self.inner.pending.resolve(
            CommandTag::DisconnectInfo,
            PendingScope::Handle(handle),
            Ok(CommandResult::Done),
        );
        let failed =
            self.inner.pending.fail_scope(PendingScope::Handle(handle), IsoError::Disconnected);
        if failed > 0 {
            warn!("{} command(s) on handle {:#x} aborted by the disconnection", failed, handle);
        }

        let outcomes = self.queue().flush(handle, IsoError::Disconnected);
        outcomes.into_iter().for_each(|outcome| self.report_send(outcome));

        if !resolved {
            self.emit(IsoEvent::CisDisconnected { cause, handle, cig_id, cis_id });
        }
    }

    fn on_broadcaster_state(
        &self,
        cause: Cause,
        big_handle: u8,
        adv_handle: u8,
        broadcaster_state: BroadcasterState,
        bis: Vec<BisHandleInfo>,
    ) {
        info!("BIG {} broadcaster state {:?}, cause {:#06x}", big_handle, broadcaster_state, cause);
        {
            let mut state = self.state();
            if let Some(big) = state.registry.big_mut(big_handle) {
                big.state = BigState::Broadcaster(broadcaster_state);
            }
            match broadcaster_state {
                BroadcasterState::Broadcasting if cause == GAP_SUCCESS => {
                    for entry in &bis {
                        if let Err(err) = state.registry.add_bis(
                            big_handle,
                            entry.bis_index,
                            entry.bis_conn_handle,
                        ) {
                            warn!(
                                "BIS {} of BIG {} not recorded: {}",
                                entry.bis_index, big_handle, err
                            );
                        }
                    }
                }
                BroadcasterState::Idle => {
                    state.registry.remove_big(big_handle);
                }
                _ => (),
            }
        }

        let result = match broadcaster_state {
            BroadcasterState::Broadcasting => {
                Some(cause_to_result(cause, CommandResult::Big(BigInfo { big_handle, bis })))
            }
            BroadcasterState::Idle => Some(cause_to_result(cause, CommandResult::Done)),
            _ => None,
        };
        if let Some(result) = result {
            self.inner.pending.resolve(
                CommandTag::BroadcastStateChange,
                PendingScope::Big(big_handle),
                result,
            );
        }

        self.emit(IsoEvent::BigBroadcasterStateInd {
            cause,
            big_handle,
            adv_handle,
            state: broadcaster_state,
        });
    }

    fn on_receiver_sync_state(
        &self,
        cause: Cause,
        big_handle: u8,
        sync_state: ReceiverSyncState,
        bis: Vec<BisHandleInfo>,
    ) {
        info!("BIG {} receiver state {:?}, cause {:#06x}", big_handle, sync_state, cause);
        {
            let mut state = self.state();
            if let Some(big) = state.registry.big_mut(big_handle) {
                big.state = BigState::Receiver(sync_state);
            }
            match sync_state {
                ReceiverSyncState::Synchronized if cause == GAP_SUCCESS => {
                    for entry in &bis {
                        if let Err(err) = state.registry.add_bis(
                            big_handle,
                            entry.bis_index,
                            entry.bis_conn_handle,
                        ) {
                            warn!(
                                "BIS {} of BIG {} not recorded: {}",
                                entry.bis_index, big_handle, err
                            );
                        }
                    }
                }
                ReceiverSyncState::Terminated => {
                    state.registry.remove_big(big_handle);
                }
                _ => (),
            }
        }

        let result = match sync_state {
            ReceiverSyncState::Synchronized => {
                Some(cause_to_result(cause, CommandResult::Big(BigInfo { big_handle, bis })))
            }
            ReceiverSyncState::Terminated => Some(cause_to_result(cause, CommandResult::Done)),
            _ => None,
        };
        if let Some(result) = result {
            self.inner.pending.resolve(
                CommandTag::ReceiverSyncStateChange,
                PendingScope::Big(big_handle),
                result,
            );
        }

        self.emit(IsoEvent::BigReceiverSyncStateInd { cause, big_handle, state: sync_state });
    }

    /// Shut the subsystem down. Queued fragments are dropped, waiting
    /// callers are released with `Cancelled` and the active role is
    /// released.
    pub fn deinit(&self) {
        self.inner.timer.stop();
        let outcomes = self.queue().drain(IsoError::Cancelled);
        if !outcomes.is_empty() {
            warn!("{} SDU(s) not sent, dropped", outcomes.len());
        }
        outcomes.into_iter().for_each(|outcome| self.report_send(outcome));

        let cancelled = self.inner.pending.drain(IsoError::Cancelled);
        if cancelled > 0 {
            warn!("{} pending command(s) cancelled", cancelled);
        }

        let mut state = self.state();
        state.release_role();
        state.registry.clear();
        state.cig_initialized = false;
        state.big_initialized = false;
        info!("ISO subsystem deinitialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::pin;
    use crate::iso::controller::{DataPathDirection, Opcode};
    use crate::iso::ISO_ID_MAX;
    use crate::test::{poll, TestContext, TestController, TestSink, UnreachableController};
    use std::task::Poll;

    const HANDLE: ConnHandle = 0x40;

    // Initiator with CIG 0 holding CIS 0, set up on HANDLE.
    fn initiator() -> TestContext {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 4).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        ctx.manager.add_cis(0, 0).unwrap();
        let param = CigParam { sdu_interval_m_s: 10_000, ..Default::default() };
        ctx.manager.set_cig_param(0, param).unwrap();
        ctx.manager.set_cis_param(0, CisParam { max_sdu_m_s: 128, ..Default::default() }).unwrap();
        ctx.manager.set_cis_acl_link(0, 1).unwrap();
        let setting = ctx.manager.start_setting(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::StartSetting {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisHandleInfo { cis_id: 0, cis_conn_handle: HANDLE }],
        });
        setting.wait().unwrap();
        ctx
    }

    fn established(cig_id: u8, cis_id: u8, handle: ConnHandle, max_sdu: u16) -> CisEstablishedInfo {
        CisEstablishedInfo {
            cause: GAP_SUCCESS,
            conn_handle: 1,
            cis_conn_handle: handle,
            cig_id,
            cis_id,
            info: IsochInfo {
                max_sdu_m_s: max_sdu,
                max_sdu_s_m: max_sdu,
                iso_interval: 8,
                ..Default::default()
            },
        }
    }

    fn connected_initiator(max_sdu: u16) -> TestContext {
        let ctx = initiator();
        let create = ctx.manager.create_cis_by_cig_id(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CreateCis {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisConnectState {
                cis_id: 0,
                cis_conn_handle: HANDLE,
                state: CisState::Connecting,
            }],
        });
        create.wait().unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(0, 0, HANDLE, max_sdu)));
        ctx
    }

    fn data_path_param() -> DataPathParam {
        DataPathParam {
            direction: DataPathDirection::Input,
            path_id: 0,
            codec_id: [3, 0, 0, 0, 0],
            controller_delay: 0,
            codec_config: Bytes::new(),
        }
    }

    #[test]
    fn start_setting_resolves_waiter_without_event() {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 4).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        ctx.manager.add_cis(0, 0).unwrap();
        ctx.manager.set_cig_param(0, CigParam::default()).unwrap();
        ctx.manager.set_cis_param(0, CisParam::default()).unwrap();

        let setting = ctx.manager.start_setting(0).unwrap();
        pin!(setting);
        assert!(poll(setting.as_mut()).is_pending());

        ctx.manager.on_cig_event(CigMgrEvent::StartSetting {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisHandleInfo { cis_id: 0, cis_conn_handle: 0x40 }],
        });
        assert_eq!(
            poll(setting.as_mut()),
            Poll::Ready(Ok(vec![CisHandleInfo { cis_id: 0, cis_conn_handle: 0x40 }]))
        );
        assert!(ctx.events().is_empty());
        assert_eq!(ctx.manager.get_cis_conn_handle(0, 0), Ok(0x40));
        assert_eq!(
            ctx.controller.opcodes(),
            vec![
                Opcode::CigMgrInit,
                Opcode::RegisterCig,
                Opcode::AddCis,
                Opcode::SetCigParam,
                Opcode::SetCisParam,
                Opcode::StartSetting
            ]
        );
    }

    #[test]
    fn out_of_range_ids_never_reach_controller() {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 1).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        let before = ctx.controller.commands().len();

        for id in (ISO_ID_MAX as u16 + 1)..=0xff {
            let id = id as u8;
            assert_eq!(ctx.manager.register_cig(id, ctx.sink.clone()), Err(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.add_cis(id, 0), Err(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.add_cis(0, id), Err(IsoError::ParamInvalid));
            assert_eq!(
                ctx.manager.set_cig_param(id, CigParam::default()),
                Err(IsoError::ParamInvalid)
            );
            assert_eq!(
                ctx.manager.set_cis_param(id, CisParam::default()),
                Err(IsoError::ParamInvalid)
            );
            assert_eq!(ctx.manager.set_cis_acl_link(id, 0), Err(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.start_setting(id).err(), Some(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.create_cis_by_cig_id(id).err(), Some(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.remove_cig(id).err(), Some(IsoError::ParamInvalid));
            assert_eq!(ctx.manager.get_cis_conn_handle(id, 0), Err(IsoError::ParamInvalid));
        }
        assert_eq!(ctx.controller.commands().len(), before);
    }

    #[test]
    fn out_of_range_ids_with_unreachable_controller() {
        let manager = IsoManager::new(
            IsoConfig::default(),
            Arc::new(UnreachableController),
            Arc::new(crate::test::ManualTimer::default()),
        );
        let sink = Arc::new(TestSink::default());
        assert_eq!(manager.register_cig(0xf0, sink), Err(IsoError::ParamInvalid));
        assert_eq!(manager.add_cis(0xff, 0), Err(IsoError::ParamInvalid));
        assert_eq!(manager.start_setting(0xf0).err(), Some(IsoError::ParamInvalid));
    }

    #[test]
    fn not_ready_before_enable() {
        let ctx = TestContext::with_controller(TestController::new().with_enabled(false));
        assert_eq!(ctx.manager.cig_init(1, 1), Err(IsoError::NotReady));
        assert_eq!(ctx.manager.big_init(1, 1), Err(IsoError::NotReady));
        assert!(ctx.controller.commands().is_empty());
    }

    #[test]
    fn init_counts_are_bounded() {
        let ctx = TestContext::new();
        assert_eq!(ctx.manager.cig_init(5, 1), Err(IsoError::NoResource));
        assert_eq!(ctx.manager.cig_init(1, 5), Err(IsoError::NoResource));
        assert_eq!(ctx.manager.big_init(5, 1), Err(IsoError::NoResource));
        assert!(ctx.controller.commands().is_empty());
        assert_eq!(ctx.manager.cig_init(4, 4), Ok(()));
    }

    #[test]
    fn single_active_role() {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 4).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();

        assert_eq!(
            ctx.manager.register_acceptor(ctx.sink.clone(), None),
            Err(IsoError::RoleConflict { active: IsoRole::Initiator, requested: IsoRole::Acceptor })
        );
        assert_eq!(ctx.manager.active_role(), Some(IsoRole::Initiator));

        // CIS requests are not serviced by the initiator.
        let action = ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(CisRequestInd {
            conn_handle: 1,
            cis_conn_handle: 0x50,
            cig_id: 1,
            cis_id: 1,
        }));
        assert_eq!(action, CisRequestAction::Reject(REJECT_LIMITED_RESOURCES));
        assert!(ctx.events().is_empty());
        assert!(!ctx.controller.opcodes().contains(&Opcode::RegisterAcceptor));
    }

    #[test]
    fn synchronous_reject_resolves_immediately() {
        let controller = TestController::new().with_reject(Opcode::StartSetting, 0x0212);
        let ctx = TestContext::with_controller(controller);
        ctx.manager.cig_init(1, 1).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        ctx.manager.add_cis(0, 0).unwrap();
        assert_eq!(ctx.manager.start_setting(0).err(), Some(IsoError::LowerStack(0x0212)));
        // Nothing left pending, the command can be retried.
        assert_eq!(ctx.manager.start_setting(0).err(), Some(IsoError::LowerStack(0x0212)));
    }

    #[test]
    fn asynchronous_failure_surfaces_cause() {
        let ctx = initiator();
        let create = ctx.manager.create_cis_by_cig_id(0).unwrap();
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Connecting);
        ctx.manager.on_cig_event(CigMgrEvent::CreateCis { cause: 0x023e, cig_id: 0, cis: vec![] });
        assert_eq!(create.wait(), Err(IsoError::LowerStack(0x023e)));
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Idle);
    }

    #[test]
    fn create_cis_then_established() {
        let ctx = connected_initiator(100);
        let info = ctx.manager.get_cis_info(HANDLE).unwrap();
        assert_eq!(info.state, CisState::Connected);
        assert_eq!(info.conn_id, Some(1));
        assert_eq!(ctx.manager.get_conn_id(HANDLE), Some(1));
        assert_eq!(ctx.manager.get_isoch_info(HANDLE).unwrap().max_sdu_m_s, 100);
        assert_eq!(ctx.events(), vec![IsoEvent::CisEstablished(established(0, 0, HANDLE, 100))]);
    }

    #[test]
    fn create_cis_by_unknown_handle() {
        let ctx = initiator();
        assert_eq!(
            ctx.manager.create_cis_by_handles(0, &[0x99]).err(),
            Some(IsoError::ParamInvalid)
        );
        assert_eq!(ctx.manager.create_cis_by_handles(0, &[]).err(), Some(IsoError::ParamInvalid));
        let create = ctx.manager.create_cis_by_handles(0, &[HANDLE]).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CreateCis {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisConnectState {
                cis_id: 0,
                cis_conn_handle: HANDLE,
                state: CisState::Connecting,
            }],
        });
        assert_eq!(create.wait().unwrap()[0].state, CisState::Connecting);
    }

    #[test]
    fn data_path_requires_connected() {
        let ctx = initiator();
        assert_eq!(
            ctx.manager.setup_data_path(HANDLE, data_path_param()).err(),
            Some(IsoError::InvalidState)
        );
        assert_eq!(
            ctx.manager.remove_data_path(HANDLE, DATA_PATH_INPUT).err(),
            Some(IsoError::InvalidState)
        );
        assert_eq!(
            ctx.manager.setup_data_path(0x99, data_path_param()).err(),
            Some(IsoError::NotFound)
        );
        assert!(!ctx.controller.opcodes().contains(&Opcode::SetupDataPath));
    }

    #[test]
    fn data_path_setup_and_remove() {
        let ctx = connected_initiator(128);
        let setup = ctx.manager.setup_data_path(HANDLE, data_path_param()).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::SetupDataPath { cause: GAP_SUCCESS, handle: HANDLE });
        setup.wait().unwrap();
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().data_path, DATA_PATH_INPUT);

        assert_eq!(ctx.manager.remove_data_path(HANDLE, 0x04).err(), Some(IsoError::ParamInvalid));
        let remove = ctx.manager.remove_data_path(HANDLE, DATA_PATH_INPUT).unwrap();
        ctx.manager
            .on_cig_event(CigMgrEvent::RemoveDataPath { cause: GAP_SUCCESS, handle: HANDLE });
        remove.wait().unwrap();
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().data_path, 0);
    }

    #[test]
    fn same_command_on_two_handles_does_not_collide() {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 2).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        ctx.manager.add_cis(0, 0).unwrap();
        ctx.manager.add_cis(0, 1).unwrap();
        let setting = ctx.manager.start_setting(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::StartSetting {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![
                CisHandleInfo { cis_id: 0, cis_conn_handle: 0x40 },
                CisHandleInfo { cis_id: 1, cis_conn_handle: 0x41 },
            ],
        });
        setting.wait().unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(0, 0, 0x40, 128)));
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(0, 1, 0x41, 128)));

        let first = ctx.manager.setup_data_path(0x40, data_path_param()).unwrap();
        let second = ctx.manager.setup_data_path(0x41, data_path_param()).unwrap();
        assert_eq!(
            ctx.manager.setup_data_path(0x40, data_path_param()).err(),
            Some(IsoError::Busy)
        );

        ctx.manager.on_cig_event(CigMgrEvent::SetupDataPath { cause: 0x0212, handle: 0x41 });
        ctx.manager.on_cig_event(CigMgrEvent::SetupDataPath { cause: GAP_SUCCESS, handle: 0x40 });
        assert_eq!(first.wait(), Ok(()));
        assert_eq!(second.wait(), Err(IsoError::LowerStack(0x0212)));
    }

    #[test]
    fn unsolicited_disconnect_emits_event() {
        let ctx = connected_initiator(128);
        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: 0x0113,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        assert_eq!(
            ctx.events().last(),
            Some(&IsoEvent::CisDisconnected { cause: 0x0113, handle: HANDLE, cig_id: 0, cis_id: 0 })
        );
        // The initiator keeps its record.
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Idle);
    }

    #[test]
    fn awaited_disconnect_resolves_without_event() {
        let ctx = connected_initiator(128);
        let disconnect = ctx.manager.disconnect(HANDLE, 0x13).unwrap();
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Disconnecting);
        let events = ctx.events().len();

        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        assert_eq!(disconnect.wait(), Ok(()));
        assert_eq!(ctx.events().len(), events);
        assert_eq!(ctx.manager.disconnect(HANDLE, 0x13).err(), Some(IsoError::InvalidState));
    }

    #[test]
    fn disconnect_while_connecting_cancels() {
        let ctx = initiator();
        let _create = ctx.manager.create_cis_by_cig_id(0).unwrap();
        let _disconnect = ctx.manager.disconnect(HANDLE, 0x13).unwrap();
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::ConnectingCancel);
    }

    #[test]
    fn awaited_disconnect_ignores_link_cause() {
        let ctx = connected_initiator(128);
        let disconnect = ctx.manager.disconnect(HANDLE, 0x13).unwrap();
        let events = ctx.events().len();

        // Terminated by local host.
        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: 0x0116,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        assert_eq!(disconnect.wait(), Ok(()));
        assert_eq!(ctx.events().len(), events);
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Idle);
    }

    #[test]
    fn dropped_disconnect_reports_event() {
        let ctx = connected_initiator(128);
        drop(ctx.manager.disconnect(HANDLE, 0x13).unwrap());

        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        let event =
            IsoEvent::CisDisconnected { cause: GAP_SUCCESS, handle: HANDLE, cig_id: 0, cis_id: 0 };
        assert_eq!(ctx.events().last(), Some(&event));
    }

    #[test]
    fn dropped_request_does_not_block_retry() {
        let ctx = connected_initiator(128);
        drop(ctx.manager.read_iso_tx_sync(HANDLE).unwrap());

        let tx_sync = ctx.manager.read_iso_tx_sync(HANDLE).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::ReadIsoTxSync {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            info: TxSyncInfo { packet_sequence_number: 9, ..Default::default() },
        });
        assert_eq!(tx_sync.wait().unwrap().packet_sequence_number, 9);
    }

    #[test]
    fn established_after_cancel_stays_cancelled() {
        let ctx = initiator();
        let create = ctx.manager.create_cis_by_cig_id(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CreateCis {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisConnectState {
                cis_id: 0,
                cis_conn_handle: HANDLE,
                state: CisState::Connecting,
            }],
        });
        create.wait().unwrap();
        let disconnect = ctx.manager.disconnect(HANDLE, 0x13).unwrap();

        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(0, 0, HANDLE, 100)));
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::ConnectingCancel);
        assert_eq!(
            ctx.manager.setup_data_path(HANDLE, data_path_param()).err(),
            Some(IsoError::InvalidState)
        );

        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: 0x0116,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        assert_eq!(disconnect.wait(), Ok(()));
        assert_eq!(ctx.manager.get_cis_info(HANDLE).unwrap().state, CisState::Idle);
    }

    #[test]
    fn oversized_codec_config_is_rejected() {
        let ctx = connected_initiator(128);
        let param =
            DataPathParam { codec_config: Bytes::from(vec![0u8; 256]), ..data_path_param() };
        assert_eq!(ctx.manager.setup_data_path(HANDLE, param).err(), Some(IsoError::ParamInvalid));
        assert!(!ctx.controller.opcodes().contains(&Opcode::SetupDataPath));

        let setup = ctx.manager.setup_data_path(HANDLE, data_path_param()).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::SetupDataPath { cause: GAP_SUCCESS, handle: HANDLE });
        assert_eq!(setup.wait(), Ok(()));
    }

    #[test]
    fn disconnect_releases_pending_commands_and_fragments() {
        let ctx = connected_initiator(128);
        let tx_sync = ctx.manager.read_iso_tx_sync(HANDLE).unwrap();
        ctx.manager.send(HANDLE, Bytes::from(vec![0u8; 300]), true, 0, 0, 10).unwrap();
        ctx.timer.fire();

        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: 0x0113,
            handle: HANDLE,
            cig_id: 0,
            cis_id: 0,
        });
        assert_eq!(tx_sync.wait(), Err(IsoError::Disconnected));
        assert!(ctx.events().contains(&IsoEvent::DataSendDone {
            handle: HANDLE,
            len: 300,
            result: Err(IsoError::Disconnected)
        }));
        ctx.timer.run();
        assert_eq!(ctx.controller.sent().len(), 1);
    }

    #[test]
    fn tx_sync_and_link_quality() {
        let ctx = connected_initiator(128);
        let tx_sync = ctx.manager.read_iso_tx_sync(HANDLE).unwrap();
        let quality = ctx.manager.read_link_quality(HANDLE).unwrap();
        let info = TxSyncInfo { packet_sequence_number: 7, time_stamp: 100, time_offset: 2 };
        let counters = LinkQuality { crc_error_packets: 3, ..Default::default() };

        ctx.manager
            .on_cig_event(CigMgrEvent::ReadIsoTxSync { cause: GAP_SUCCESS, handle: HANDLE, info });
        ctx.manager.on_cig_event(CigMgrEvent::ReadLinkQuality {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            info: counters,
        });
        assert_eq!(tx_sync.wait(), Ok(info));
        assert_eq!(quality.wait(), Ok(counters));
        assert_eq!(ctx.manager.get_link_quality(HANDLE), Some(counters));
    }

    #[test]
    fn iso_test_mode_counters() {
        let ctx = connected_initiator(128);
        let transmit = ctx.manager.transmit_test(HANDLE, 0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::IsoTest {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            counters: None,
        });
        transmit.wait().unwrap();

        let end = ctx.manager.iso_test_end(HANDLE).unwrap();
        let counters =
            TestCounters { received_sdu_count: 10, missed_sdu_count: 1, failed_sdu_count: 0 };
        ctx.manager.on_cig_event(CigMgrEvent::IsoTest {
            cause: GAP_SUCCESS,
            handle: HANDLE,
            counters: Some(counters),
        });
        assert_eq!(end.wait(), Ok(counters));
    }

    #[test]
    fn remove_cig_frees_slots() {
        let ctx = initiator();
        let remove = ctx.manager.remove_cig(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::RemoveCig { cause: GAP_SUCCESS, cig_id: 0 });
        remove.wait().unwrap();
        assert_eq!(ctx.manager.get_cis_conn_handle(0, 0), Err(IsoError::NotFound));
        assert_eq!(ctx.manager.start_setting(0).err(), Some(IsoError::ParamInvalid));
    }

    #[test]
    fn remove_cig_with_connected_cis() {
        let ctx = connected_initiator(128);
        assert_eq!(ctx.manager.remove_cig(0).err(), Some(IsoError::InvalidState));
    }

    struct Decide(CisRequestDecision);

    impl CisRequestHandler for Decide {
        fn decide(&self, _request: &CisRequestInd) -> CisRequestDecision {
            self.0
        }
    }

    fn acceptor(handler: Option<Arc<dyn CisRequestHandler>>) -> TestContext {
        let ctx = TestContext::new();
        ctx.manager.cig_init(1, 2).unwrap();
        ctx.manager.register_acceptor(ctx.sink.clone(), handler).unwrap();
        ctx
    }

    fn request(cis_id: u8, handle: ConnHandle) -> CisRequestInd {
        CisRequestInd { conn_handle: 1, cis_conn_handle: handle, cig_id: 1, cis_id }
    }

    #[test]
    fn acceptor_default_action_defers() {
        let ctx = acceptor(None);
        let action = ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50)));
        assert_eq!(action, CisRequestAction::Pending);
        assert_eq!(ctx.events(), vec![IsoEvent::AcceptorRequestCisInd(request(0, 0x50))]);

        let accept = ctx.manager.accept_cis(0x50).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::AcceptCis { cause: GAP_SUCCESS, handle: 0x50 });
        accept.wait().unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(1, 0, 0x50, 60)));
        assert_eq!(ctx.manager.get_cis_info(0x50).unwrap().state, CisState::Connected);
    }

    #[test]
    fn acceptor_configured_action() {
        let ctx = acceptor(None);
        ctx.manager.config_cis_req_action(CisRequestAction::Accept).unwrap();
        assert_eq!(
            ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50))),
            CisRequestAction::Accept
        );
        assert!(ctx.events().is_empty());
    }

    #[test]
    fn acceptor_handler_decides() {
        let ctx = acceptor(Some(Arc::new(Decide(CisRequestDecision::Reject(0x0f)))));
        assert_eq!(
            ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50))),
            CisRequestAction::Reject(0x0f)
        );
        assert!(ctx.manager.get_cis_info(0x50).is_none());

        let ctx = acceptor(Some(Arc::new(Decide(CisRequestDecision::Accept))));
        assert_eq!(
            ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50))),
            CisRequestAction::Accept
        );
        assert_eq!(ctx.manager.get_cis_info(0x50).unwrap().state, CisState::Connecting);
    }

    #[test]
    fn acceptor_without_free_slot_rejects() {
        let ctx = acceptor(Some(Arc::new(Decide(CisRequestDecision::Accept))));
        ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50)));
        ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(1, 0x51)));
        assert_eq!(
            ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(2, 0x52))),
            CisRequestAction::Reject(REJECT_LIMITED_RESOURCES)
        );
    }

    #[test]
    fn acceptor_record_freed_on_disconnect() {
        let ctx = acceptor(Some(Arc::new(Decide(CisRequestDecision::Accept))));
        ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50)));
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(1, 0, 0x50, 60)));
        ctx.manager.on_cig_event(CigMgrEvent::DisconnectInfo {
            cause: 0x0113,
            handle: 0x50,
            cig_id: 1,
            cis_id: 0,
        });
        assert!(ctx.manager.get_cis_info(0x50).is_none());
    }

    #[test]
    fn acceptor_sdu_config_bounds_fragments() {
        let ctx = acceptor(Some(Arc::new(Decide(CisRequestDecision::Accept))));
        ctx.manager.on_cig_event(CigMgrEvent::CisRequestInd(request(0, 0x50)));
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(1, 0, 0x50, 60)));
        let config = AcceptorSduConfig { max_sdu_m_s: 60, max_sdu_s_m: 50 };
        ctx.manager.acceptor_config_sdu(0x50, config).unwrap();
        ctx.manager.send(0x50, Bytes::from(vec![1u8; 120]), false, 0, 0, 10).unwrap();
        ctx.timer.run();
        let sizes: Vec<usize> = ctx.controller.sent().iter().map(|sent| sent.data.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[test]
    fn send_fragments_and_reports_once() {
        let ctx = connected_initiator(128);
        let data: Vec<u8> = (0..2000).map(|i| i as u8).collect();
        ctx.manager.send(HANDLE, Bytes::from(data.clone()), true, 1, 0, 10).unwrap();
        assert_eq!(ctx.timer.period(), Some(Duration::from_millis(10)));

        assert_eq!(ctx.timer.run(), 16);
        let sent = ctx.controller.sent();
        assert_eq!(sent.len(), 16);
        assert_eq!(sent[15].data.len(), 80);
        let joined: Vec<u8> = sent.iter().flat_map(|sent| sent.data.clone()).collect();
        assert_eq!(joined, data);
        assert_eq!(sent[1].time_stamp, (1 + 1) * 10_000);

        let done: Vec<IsoEvent> = ctx
            .events()
            .into_iter()
            .filter(|event| matches!(event, IsoEvent::DataSendDone { .. }))
            .collect();
        assert_eq!(
            done,
            vec![IsoEvent::DataSendDone { handle: HANDLE, len: 2000, result: Ok(()) }]
        );
        assert!(!ctx.timer.is_running());
    }

    #[test]
    fn send_failures_stick_per_sdu() {
        let controller = TestController::new().with_send_causes(&[GAP_SUCCESS, 0x0101, 0x0202]);
        let ctx = TestContext::with_controller(controller);
        ctx.manager.cig_init(1, 1).unwrap();
        ctx.manager.register_cig(0, ctx.sink.clone()).unwrap();
        ctx.manager.add_cis(0, 0).unwrap();
        let setting = ctx.manager.start_setting(0).unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::StartSetting {
            cause: GAP_SUCCESS,
            cig_id: 0,
            cis: vec![CisHandleInfo { cis_id: 0, cis_conn_handle: HANDLE }],
        });
        setting.wait().unwrap();
        ctx.manager.on_cig_event(CigMgrEvent::CisEstablished(established(0, 0, HANDLE, 100)));

        ctx.manager.send(HANDLE, Bytes::from(vec![0u8; 300]), false, 0, 0, 10).unwrap();
        ctx.manager.send(HANDLE, Bytes::from(vec![0u8; 100]), false, 0, 3, 10).unwrap();
        ctx.timer.run();

        let done: Vec<IsoEvent> = ctx
            .events()
            .into_iter()
            .filter(|event| matches!(event, IsoEvent::DataSendDone { .. }))
            .collect();
        assert_eq!(
            done,
            vec![
                IsoEvent::DataSendDone {
                    handle: HANDLE,
                    len: 300,
                    result: Err(IsoError::LowerStack(0x0101)),
                },
                IsoEvent::DataSendDone { handle: HANDLE, len: 100, result: Ok(()) },
            ]
        );
    }

    #[test]
    fn send_keeps_fifo_across_calls() {
        let ctx = connected_initiator(128);
        ctx.manager.send(HANDLE, Bytes::from(vec![1u8; 200]), false, 0, 0, 10).unwrap();
        ctx.manager.send(HANDLE, Bytes::from(vec![2u8; 200]), false, 0, 2, 10).unwrap();
        assert_eq!(ctx.timer.starts(), 1);
        ctx.timer.run();
        let first_bytes: Vec<u8> = ctx.controller.sent().iter().map(|sent| sent.data[0]).collect();
        assert_eq!(first_bytes, vec![1, 1, 2, 2]);
        let seqs: Vec<u16> = ctx.controller.sent().iter().map(|sent| sent.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn send_with_completion_resolves_waiter() {
        let ctx = connected_initiator(128);
        let data = Bytes::from(vec![0u8; 150]);
        let completion = ctx.manager.send_with_completion(HANDLE, data, false, 0, 0, 10).unwrap();
        assert_eq!(
            ctx.manager
                .send_with_completion(HANDLE, Bytes::from_static(b"x"), false, 0, 0, 10)
                .err(),
            Some(IsoError::Busy)
        );
        ctx.timer.run();
        assert_eq!(completion.wait(), Ok(150));
        assert!(ctx.events().iter().all(|event| !matches!(event, IsoEvent::DataSendDone { .. })));
    }

    #[test]
    fn send_guards() {
        let ctx = initiator();
        assert_eq!(
            ctx.manager.send(HANDLE, Bytes::from_static(b"abc"), false, 0, 0, 10),
            Err(IsoError::InvalidState)
        );
        assert_eq!(
            ctx.manager.send(0x99, Bytes::from_static(b"abc"), false, 0, 0, 10),
            Err(IsoError::NotFound)
        );

        let ctx = connected_initiator(128);
        assert_eq!(
            ctx.manager.send(HANDLE, Bytes::new(), false, 0, 0, 10),
            Err(IsoError::ParamInvalid)
        );
        assert_eq!(
            ctx.manager.send(HANDLE, Bytes::from_static(b"abc"), false, 0, 0, 0),
            Err(IsoError::ParamInvalid)
        );
        assert!(!ctx.timer.is_running());
    }

    #[test]
    fn direct_send_does_not_fragment() {
        let ctx = connected_initiator(128);
        assert_eq!(
            ctx.manager.send_direct(HANDLE, &[0u8; 129], false, 0, 0),
            Err(IsoError::ParamInvalid)
        );
        assert_eq!(ctx.manager.send_direct(HANDLE, &[0u8; 128], false, 0, 0), Ok(()));
        assert_eq!(ctx.controller.sent().len(), 1);
    }

    #[test]
    fn default_max_sdu_applies() {
        let ctx = connected_initiator(0);
        // A zero max SDU falls back to the configured default.
        assert_eq!(ctx.manager.send_direct(HANDLE, &[0u8; 128], false, 0, 0), Ok(()));

        let config = IsoConfig::default().with_default_max_sdu(64);
        let ctx = TestContext::with_config(config, TestController::new());
        ctx.manager.big_init(1, 1).unwrap();
        ctx.manager.register_receiver(ctx.sink.clone()).unwrap();
        let param = BigSyncParam { bis: vec![1], ..Default::default() };
        let sync = ctx.manager.big_receiver_create_sync(param).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::ReceiverSyncState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            sync_handle: 0,
            state: ReceiverSyncState::Synchronized,
            bis: vec![BisHandleInfo { bis_index: 1, bis_conn_handle: 0x70 }],
        });
        sync.wait().unwrap();
        assert_eq!(
            ctx.manager.send_direct(0x70, &[0u8; 65], false, 0, 0),
            Err(IsoError::ParamInvalid)
        );
        assert_eq!(ctx.manager.send_direct(0x70, &[0u8; 64], false, 0, 0), Ok(()));
    }

    #[test]
    fn received_data_is_reported() {
        let ctx = connected_initiator(128);
        let ind = IsoDataInd {
            handle: HANDLE,
            status: 0,
            ts_flag: true,
            time_stamp: 5,
            seq: 1,
            data: Bytes::from_static(b"audio"),
        };
        ctx.manager.on_iso_data_ind(ind.clone());
        assert_eq!(ctx.events().last(), Some(&IsoEvent::DataReceiveInd(ind)));
    }

    fn broadcaster() -> TestContext {
        let ctx = TestContext::new();
        ctx.manager.big_init(1, 2).unwrap();
        ctx.manager.register_broadcaster(ctx.sink.clone()).unwrap();
        ctx
    }

    #[test]
    fn broadcaster_create_and_terminate() {
        let ctx = broadcaster();
        let param =
            BigParam { num_bis: 2, max_sdu: 100, sdu_interval: 10_000, ..Default::default() };
        let create = ctx.manager.big_broadcaster_create(1, param).unwrap();
        let bis = vec![
            BisHandleInfo { bis_index: 1, bis_conn_handle: 0x20 },
            BisHandleInfo { bis_index: 2, bis_conn_handle: 0x21 },
        ];

        ctx.manager.on_big_event(BigMgrEvent::BroadcasterState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            adv_handle: 1,
            state: BroadcasterState::Creating,
            bis: vec![],
        });
        ctx.manager.on_big_event(BigMgrEvent::BroadcasterState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            adv_handle: 1,
            state: BroadcasterState::Broadcasting,
            bis: bis.clone(),
        });
        assert_eq!(create.wait(), Ok(BigInfo { big_handle: 0, bis }));
        assert_eq!(ctx.events().len(), 2);

        // BIS max SDU bounds the fragments.
        ctx.manager.send(0x20, Bytes::from(vec![0u8; 250]), false, 0, 0, 10).unwrap();
        ctx.timer.run();
        let sizes: Vec<usize> = ctx.controller.sent().iter().map(|sent| sent.data.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let terminate = ctx.manager.big_broadcaster_terminate(0, 0x13).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::BroadcasterState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            adv_handle: 1,
            state: BroadcasterState::Idle,
            bis: vec![],
        });
        assert_eq!(terminate.wait(), Ok(()));
        assert_eq!(ctx.manager.big_broadcaster_terminate(0, 0x13).err(), Some(IsoError::NotFound));
    }

    #[test]
    fn broadcaster_bis_data_path() {
        let ctx = broadcaster();
        let param = BigParam { num_bis: 1, ..Default::default() };
        let create = ctx.manager.big_broadcaster_create(1, param).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::BroadcasterState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            adv_handle: 1,
            state: BroadcasterState::Broadcasting,
            bis: vec![BisHandleInfo { bis_index: 1, bis_conn_handle: 0x20 }],
        });
        create.wait().unwrap();

        let setup = ctx.manager.setup_data_path(0x20, data_path_param()).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::SetupDataPath { cause: GAP_SUCCESS, handle: 0x20 });
        setup.wait().unwrap();

        let tx_sync = ctx.manager.read_iso_tx_sync(0x20).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::ReadIsoTxSync {
            cause: GAP_SUCCESS,
            handle: 0x20,
            info: TxSyncInfo::default(),
        });
        assert_eq!(tx_sync.wait(), Ok(TxSyncInfo::default()));
    }

    #[test]
    fn broadcaster_creation_failure() {
        let ctx = broadcaster();
        let param = BigParam { num_bis: 1, ..Default::default() };
        let create = ctx.manager.big_broadcaster_create(1, param).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::BroadcasterState {
            cause: 0x0107,
            big_handle: 0,
            adv_handle: 1,
            state: BroadcasterState::Idle,
            bis: vec![],
        });
        assert_eq!(create.wait(), Err(IsoError::LowerStack(0x0107)));
        assert_eq!(
            ctx.manager.big_broadcaster_create(1, BigParam::default()).err(),
            Some(IsoError::ParamInvalid)
        );
    }

    #[test]
    fn receiver_sync_and_terminate() {
        let ctx = TestContext::new();
        ctx.manager.big_init(2, 2).unwrap();
        ctx.manager.register_receiver(ctx.sink.clone()).unwrap();
        assert_eq!(
            ctx.manager.register_broadcaster(ctx.sink.clone()),
            Err(IsoError::RoleConflict {
                active: IsoRole::Receiver,
                requested: IsoRole::Broadcaster,
            })
        );

        let param = BigSyncParam { bis: vec![1], ..Default::default() };
        let sync = ctx.manager.big_receiver_create_sync(param).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::ReceiverSyncState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            sync_handle: 0,
            state: ReceiverSyncState::Synchronized,
            bis: vec![BisHandleInfo { bis_index: 1, bis_conn_handle: 0x30 }],
        });
        assert_eq!(sync.wait().unwrap().bis.len(), 1);

        let terminate = ctx.manager.big_receiver_terminate_sync(0).unwrap();
        ctx.manager.on_big_event(BigMgrEvent::ReceiverSyncState {
            cause: GAP_SUCCESS,
            big_handle: 0,
            sync_handle: 0,
            state: ReceiverSyncState::Terminated,
            bis: vec![],
        });
        assert_eq!(terminate.wait(), Ok(()));
        assert_eq!(
            ctx.events().last(),
            Some(&IsoEvent::BigReceiverSyncStateInd {
                cause: GAP_SUCCESS,
                big_handle: 0,
                state: ReceiverSyncState::Terminated
            })
        );
    }

    #[test]
    fn deinit_cancels_everything() {
        let ctx = connected_initiator(128);
        let tx_sync = ctx.manager.read_iso_tx_sync(HANDLE).unwrap();
        let data = Bytes::from(vec![0u8; 300]);
        let completion = ctx.manager.send_with_completion(HANDLE, data, false, 0, 0, 10).unwrap();
        ctx.manager.send(HANDLE, Bytes::from(vec![0u8; 10]), false, 0, 0, 10).unwrap();

        ctx.manager.deinit();
        assert_eq!(tx_sync.wait(), Err(IsoError::Cancelled));
        assert_eq!(completion.wait(), Err(IsoError::Cancelled));
        assert!(!ctx.timer.is_running());
        assert!(ctx.events().contains(&IsoEvent::DataSendDone {
            handle: HANDLE,
            len: 10,
            result: Err(IsoError::Cancelled)
        }));
        assert_eq!(ctx.manager.active_role(), None);
        assert_eq!(ctx.manager.get_cis_info(HANDLE), None);

        // Any role may be registered again.
        ctx.manager.cig_init(1, 1).unwrap();
        ctx.manager.register_acceptor(ctx.sink.clone(), None).unwrap();
    }
}
