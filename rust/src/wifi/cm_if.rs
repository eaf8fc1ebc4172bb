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

//! Lifecycle of the Wi-Fi firmware service.
//!
//! Service requests are serialized and validated against the current
//! state before reaching the firmware. A firmware failure blocks the
//! service until the platform recovers it through a remove and probe
//! cycle with the `Recovery` reason.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{error, info, warn};

use crate::error::CmError;

pub const RECOVERY_STOP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmState {
    Stopped,
    Probing,
    Probed,
    Starting,
    Started,
    Stopping,
    Removing,
    Removed,
    Blocked,
}

/// Why the platform probes or removes the module client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleClientReason {
    Normal,
    Recovery,
}

/// Firmware service primitives of the platform.
pub trait WlanFirmware: Send + Sync {
    fn open(&self) -> Result<(), i32>;
    fn start(&self) -> Result<(), i32>;
    fn stop(&self) -> Result<(), i32>;
    fn close(&self) -> Result<(), i32>;
    /// Report a fatal service failure to the platform.
    fn service_failed(&self, reason: u16);
    /// Stop all host interface activity.
    fn block_hip(&self);
}

/// Service access point told about firmware failures.
pub trait SapNotifier: Send + Sync {
    fn notify_failure(&self);
}

#[derive(Clone, Debug)]
pub struct CmIfConfig {
    /// Bound of the wait for the service stop during a recovery.
    pub recovery_stop_timeout: Duration,
}

impl Default for CmIfConfig {
    fn default() -> Self {
        CmIfConfig { recovery_stop_timeout: RECOVERY_STOP_TIMEOUT }
    }
}

impl CmIfConfig {
    pub fn with_recovery_stop_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_stop_timeout = timeout;
        self
    }
}

struct CmInner {
    state: CmState,
    /// Latched by the first failure of an episode, cleared by the
    /// recovery probe.
    fail_reported: bool,
    probed: bool,
    saps: Vec<Arc<dyn SapNotifier>>,
}

pub struct ConnectionManager {
    config: CmIfConfig,
    firmware: Arc<dyn WlanFirmware>,
    // Serializes the service requests.
    start_mutex: Mutex<()>,
    inner: Mutex<CmInner>,
    stop_done: Mutex<bool>,
    stop_cond: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(config: CmIfConfig, firmware: Arc<dyn WlanFirmware>) -> Self {
        ConnectionManager {
            config,
            firmware,
            start_mutex: Mutex::new(()),
            inner: Mutex::new(CmInner {
                state: CmState::Stopped,
                fail_reported: false,
                probed: false,
                saps: Vec::new(),
            }),
            stop_done: Mutex::new(false),
            stop_cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> CmState {
        lock(&self.inner).state
    }

    pub fn is_failure_reported(&self) -> bool {
        lock(&self.inner).fail_reported
    }

    pub fn register_sap(&self, sap: Arc<dyn SapNotifier>) {
        lock(&self.inner).saps.push(sap);
    }

    fn check_state(
        &self,
        op: &'static str,
        allowed: &[CmState],
    ) -> Result<MutexGuard<'_, CmInner>, CmError> {
        let inner = lock(&self.inner);
        if !allowed.contains(&inner.state) {
            warn!("{} not allowed in state {:?}", op, inner.state);
            return Err(CmError::StateMismatch { state: inner.state, op });
        }
        if !inner.probed {
            return Err(CmError::NotProbed);
        }
        Ok(inner)
    }

    fn set_state(&self, state: CmState) {
        let mut inner = lock(&self.inner);
        info!("{:?} -> {:?}", inner.state, state);
        inner.state = state;
    }

    fn signal_stopped(&self) {
        *lock(&self.stop_done) = true;
        self.stop_cond.notify_all();
    }

    pub fn probe(&self, reason: ModuleClientReason) -> Result<(), CmError> {
        let _start = lock(&self.start_mutex);
        let mut inner = lock(&self.inner);
        match reason {
            ModuleClientReason::Recovery => {
                if !inner.fail_reported {
                    info!("recovery probe without failure, ignored");
                    return Ok(());
                }
                inner.state = CmState::Probed;
                inner.probed = true;
                inner.fail_reported = false;
                info!("service recovered");
                Ok(())
            }
            ModuleClientReason::Normal => {
                if !matches!(inner.state, CmState::Stopped | CmState::Removed) {
                    return Err(CmError::StateMismatch { state: inner.state, op: "probe" });
                }
                inner.state = CmState::Probing;
                inner.probed = true;
                inner.fail_reported = false;
                inner.state = CmState::Probed;
                info!("service probed");
                Ok(())
            }
        }
    }

    /// Detach the service. On recovery, the service access points are
    /// told about the failure and given a bounded time to stop the
    /// service; the removal proceeds once stopped or on timeout.
    pub fn remove(&self, reason: ModuleClientReason) -> Result<(), CmError> {
        if reason == ModuleClientReason::Recovery {
            let saps = {
                let inner = lock(&self.inner);
                *lock(&self.stop_done) = inner.state == CmState::Stopped;
                inner.saps.clone()
            };
            // The access points stop the service from their notification.
            saps.iter().for_each(|sap| sap.notify_failure());

            let stopped = lock(&self.stop_done);
            let (stopped, _) = self
                .stop_cond
                .wait_timeout_while(stopped, self.config.recovery_stop_timeout, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if !*stopped {
                warn!(
                    "service not stopped after {:?}, removing anyway",
                    self.config.recovery_stop_timeout
                );
            }
        }

        let _start = lock(&self.start_mutex);
        self.set_state(CmState::Removing);
        let mut inner = lock(&self.inner);
        if reason == ModuleClientReason::Normal {
            inner.probed = false;
        }
        inner.state = CmState::Removed;
        Ok(())
    }

    pub fn service_open(&self) -> Result<(), CmError> {
        let _start = lock(&self.start_mutex);
        drop(self.check_state("open", &[CmState::Probed, CmState::Stopped])?);
        self.firmware.open().map_err(|err| {
            error!("service open failed: {}", err);
            CmError::Firmware(err)
        })
    }

    pub fn service_start(&self) -> Result<(), CmError> {
        let _start = lock(&self.start_mutex);
        let mut inner = self.check_state("start", &[CmState::Probed, CmState::Stopped])?;
        inner.state = CmState::Starting;
        drop(inner);

        let result = self.firmware.start();
        let mut inner = lock(&self.inner);
        // A failure reported meanwhile keeps the service blocked.
        if inner.state != CmState::Starting {
            warn!("service start completed in state {:?}", inner.state);
            return result.map_err(CmError::Firmware);
        }
        match result {
            Ok(()) => {
                inner.state = CmState::Started;
                info!("service started");
                Ok(())
            }
            Err(err) => {
                inner.state = CmState::Stopped;
                error!("service start failed: {}", err);
                Err(CmError::Firmware(err))
            }
        }
    }

    /// Stop the service. A blocked service is always stopped, to let
    /// the recovery tear it down.
    pub fn service_stop(&self) -> Result<(), CmError> {
        let _start = lock(&self.start_mutex);
        let state = self.state();
        if state == CmState::Blocked {
            warn!("stopping blocked service");
            if let Err(err) = self.firmware.stop() {
                warn!("best effort stop failed: {}", err);
            }
            self.set_state(CmState::Stopped);
            self.signal_stopped();
            return Ok(());
        }

        let inner =
            self.check_state("stop", &[CmState::Started, CmState::Removed, CmState::Probed])?;
        let result = match inner.state {
            CmState::Started => {
                drop(inner);
                self.set_state(CmState::Stopping);
                let result = self.firmware.stop().map_err(|err| {
                    error!("service stop failed: {}", err);
                    CmError::Firmware(err)
                });
                self.set_state(CmState::Stopped);
                result
            }
            CmState::Probed => {
                drop(inner);
                self.set_state(CmState::Stopped);
                Ok(())
            }
            _ => Ok(()),
        };
        self.signal_stopped();
        result
    }

    pub fn service_close(&self) -> Result<(), CmError> {
        let _start = lock(&self.start_mutex);
        drop(self.check_state("close", &[CmState::Stopped, CmState::Probed, CmState::Removed])?);
        self.firmware.close().map_err(CmError::Firmware)
    }

    /// Firmware failure notification, possibly raised from any context
    /// and repeatedly for one failure. Returns true if the failure was
    /// reported to the platform.
    pub fn service_failed(&self, reason: u16) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.fail_reported {
                warn!("failure {:#x} already reported, suppressed", reason);
                return false;
            }
            if matches!(inner.state, CmState::Stopped | CmState::Removed) {
                info!("failure {:#x} in state {:?}, ignored", reason, inner.state);
                return false;
            }
            inner.fail_reported = true;
            info!("{:?} -> {:?}", inner.state, CmState::Blocked);
            inner.state = CmState::Blocked;
        }

        error!("service failed, reason {:#x}", reason);
        self.firmware.block_hip();
        self.firmware.service_failed(reason);
        true
    }
}
