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

//! Transmit flow control queues.
//!
//! A queue set bounds the frames in flight towards one peer (or one
//! multicast group): `qcod` frames out of `qmod` per access category,
//! and `scod` frames out of `smod` across the whole set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info};

use crate::error::FcqError;
use crate::timer::PeriodicTimer;

/// Capacities are carried in 24 bit fields of the frame descriptors.
pub const FCQ_MOD_LIMIT: u32 = 1 << 24;

pub const SMOD_UNICAST: u32 = 400;
pub const SMOD_UNICAST_PS: u32 = 4;
pub const SMOD_MULTICAST: u32 = 100;
pub const SMOD_MULTICAST_PS: u32 = 4;
pub const QMOD_UNICAST: u32 = 400;
pub const QMOD_MULTICAST: u32 = 100;
/// Capacity left to an idle access category by the redistribution.
pub const MIN_QMOD: u32 = 10;
pub const REDISTRIBUTION_PERIOD: Duration = Duration::from_secs(5);

const AC_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessCategory {
    Be = 0,
    Bk = 1,
    Vi = 2,
    Vo = 3,
}

impl AccessCategory {
    pub const ALL: [AccessCategory; AC_COUNT] =
        [AccessCategory::Be, AccessCategory::Bk, AccessCategory::Vi, AccessCategory::Vo];

    /// Access category of an 802.1D user priority.
    pub fn from_priority(priority: u8) -> Self {
        match priority & 0x07 {
            1 | 2 => AccessCategory::Bk,
            4 | 5 => AccessCategory::Vi,
            6 | 7 => AccessCategory::Vo,
            _ => AccessCategory::Be,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Capacity exhausted, retry after some frames completed.
    Busy,
    /// 802.1X controlled port closed.
    PortBlocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Blocked,
    Open,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Active,
    PowerSave,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueSetKind {
    Unicast,
    Multicast,
}

#[derive(Clone, Debug)]
pub struct FcqConfig {
    pub smod_unicast: u32,
    pub smod_unicast_ps: u32,
    pub smod_multicast: u32,
    pub smod_multicast_ps: u32,
    pub qmod_unicast: u32,
    pub qmod_multicast: u32,
    /// Periodically move the capacity of idle access categories to
    /// the active ones.
    pub dynamic_qmod: bool,
    pub min_qmod: u32,
    pub redistribution_period: Duration,
}

impl Default for FcqConfig {
    fn default() -> Self {
        FcqConfig {
            smod_unicast: SMOD_UNICAST,
            smod_unicast_ps: SMOD_UNICAST_PS,
            smod_multicast: SMOD_MULTICAST,
            smod_multicast_ps: SMOD_MULTICAST_PS,
            qmod_unicast: QMOD_UNICAST,
            qmod_multicast: QMOD_MULTICAST,
            dynamic_qmod: false,
            min_qmod: MIN_QMOD,
            redistribution_period: REDISTRIBUTION_PERIOD,
        }
    }
}

impl FcqConfig {
    pub fn with_unicast_smod(mut self, active: u32, power_save: u32) -> Self {
        self.smod_unicast = active;
        self.smod_unicast_ps = power_save;
        self
    }

    pub fn with_multicast_smod(mut self, active: u32, power_save: u32) -> Self {
        self.smod_multicast = active;
        self.smod_multicast_ps = power_save;
        self
    }

    pub fn with_qmod(mut self, unicast: u32, multicast: u32) -> Self {
        self.qmod_unicast = unicast;
        self.qmod_multicast = multicast;
        self
    }

    pub fn with_dynamic_qmod(mut self, min_qmod: u32, period: Duration) -> Self {
        self.dynamic_qmod = true;
        self.min_qmod = min_qmod;
        self.redistribution_period = period;
        self
    }

    fn check(&self) -> Result<(), FcqError> {
        let capacities = [
            self.smod_unicast,
            self.smod_unicast_ps,
            self.smod_multicast,
            self.smod_multicast_ps,
            self.qmod_unicast,
            self.qmod_multicast,
            self.min_qmod,
        ];
        match capacities.iter().find(|capacity| **capacity >= FCQ_MOD_LIMIT) {
            Some(capacity) => Err(FcqError::CapacityOverflow(*capacity)),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct AcQueue {
    qmod: u32,
    nominal_qmod: u32,
    qcod: u32,
    /// Traffic was admitted since the last redistribution.
    active: bool,
}

#[derive(Debug)]
struct QueueSet {
    kind: QueueSetKind,
    ac: [AcQueue; AC_COUNT],
    smod: u32,
    smod_active: u32,
    smod_ps: u32,
    scod: u32,
    port: PortState,
    power: PowerState,
    ps_transitions: u32,
    dynamic_qmod: bool,
    min_qmod: u32,
}

impl QueueSet {
    fn redistribute(&mut self) {
        let total: u32 = self.ac.iter().map(|queue| queue.nominal_qmod).sum();
        let active = self.ac.iter().filter(|queue| queue.active).count() as u32;
        let min_qmod = self.min_qmod;

        if active == 0 {
            self.ac.iter_mut().for_each(|queue| queue.qmod = queue.nominal_qmod);
            return;
        }

        let idle = AC_COUNT as u32 - active;
        let share = (total.saturating_sub(min_qmod.saturating_mul(idle)) / active).max(min_qmod);
        for queue in self.ac.iter_mut() {
            let target = if queue.active { share } else { min_qmod };
            // Never below the frames already in flight.
            queue.qmod = target.max(queue.qcod);
        }
    }
}

/// Snapshot of the counters of a queue set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FcqStats {
    pub smod: u32,
    pub scod: u32,
    pub qmod: [u32; AC_COUNT],
    pub qcod: [u32; AC_COUNT],
    pub port: PortState,
    pub power: PowerState,
    pub ps_transitions: u32,
}

/// Flow control of one peer or of the multicast group of an interface.
#[derive(Debug)]
pub struct FlowControlQueueSet {
    qs: Mutex<QueueSet>,
}

impl FlowControlQueueSet {
    pub fn new(kind: QueueSetKind, config: &FcqConfig) -> Result<Self, FcqError> {
        config.check()?;
        let (smod_active, smod_ps, qmod) = match kind {
            QueueSetKind::Unicast => {
                (config.smod_unicast, config.smod_unicast_ps, config.qmod_unicast)
            }
            QueueSetKind::Multicast => {
                (config.smod_multicast, config.smod_multicast_ps, config.qmod_multicast)
            }
        };
        let queue = AcQueue { qmod, nominal_qmod: qmod, qcod: 0, active: false };
        Ok(FlowControlQueueSet {
            qs: Mutex::new(QueueSet {
                kind,
                ac: [queue; AC_COUNT],
                smod: smod_active,
                smod_active,
                smod_ps,
                scod: 0,
                // Unicast traffic waits for the 802.1X authorization.
                port: match kind {
                    QueueSetKind::Unicast => PortState::Blocked,
                    QueueSetKind::Multicast => PortState::Open,
                },
                power: PowerState::Active,
                ps_transitions: 0,
                dynamic_qmod: config.dynamic_qmod,
                min_qmod: config.min_qmod,
            }),
        })
    }

    pub fn unicast(config: &FcqConfig) -> Result<Self, FcqError> {
        Self::new(QueueSetKind::Unicast, config)
    }

    pub fn multicast(config: &FcqConfig) -> Result<Self, FcqError> {
        Self::new(QueueSetKind::Multicast, config)
    }

    fn lock(&self) -> MutexGuard<'_, QueueSet> {
        self.qs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for one frame about to be handed to the firmware.
    pub fn transmit_admit(&self, ac: AccessCategory) -> Admission {
        let mut guard = self.lock();
        let qs = &mut *guard;
        if qs.port == PortState::Blocked {
            return Admission::PortBlocked;
        }

        qs.scod += 1;
        if qs.scod > qs.smod {
            qs.scod -= 1;
            debug!("{:?} queue set full, scod {} smod {}", qs.kind, qs.scod, qs.smod);
            return Admission::Busy;
        }

        let queue = &mut qs.ac[ac.index()];
        if queue.qcod >= queue.qmod {
            qs.scod -= 1;
            debug!("{:?} queue full, qcod {} qmod {}", ac, queue.qcod, queue.qmod);
            return Admission::Busy;
        }
        queue.qcod += 1;

        let newly_active = !queue.active;
        queue.active = true;
        if newly_active && qs.dynamic_qmod {
            qs.redistribute();
        }
        Admission::Admitted
    }

    /// Account for one frame acknowledged by the firmware.
    pub fn receive_complete(&self, ac: AccessCategory) {
        let mut guard = self.lock();
        let qs = &mut *guard;
        let queue = &mut qs.ac[ac.index()];
        if queue.qcod == 0 || qs.scod == 0 {
            debug!("{:?} completion without frame in flight", ac);
        }
        queue.qcod = queue.qcod.saturating_sub(1);
        qs.scod = qs.scod.saturating_sub(1);
    }

    pub fn update_peer_power_state(&self, power: PowerState) {
        let mut qs = self.lock();
        if qs.power == power {
            return;
        }
        qs.power = power;
        qs.smod = match power {
            PowerState::Active => qs.smod_active,
            PowerState::PowerSave => qs.smod_ps,
        };
        qs.ps_transitions += 1;
        info!("{:?} queue set now {:?}, smod {}", qs.kind, power, qs.smod);
    }

    /// Frames already in flight are not affected.
    pub fn set_port_state(&self, port: PortState) {
        let mut qs = self.lock();
        if qs.port != port {
            info!("{:?} controlled port {:?}", qs.kind, port);
            qs.port = port;
        }
    }

    /// Recompute the per access category capacities from the activity
    /// seen since the previous call, then start a new observation period.
    pub fn redistribute(&self) {
        let mut qs = self.lock();
        if !qs.dynamic_qmod {
            return;
        }
        qs.redistribute();
        for queue in qs.ac.iter_mut() {
            queue.active = queue.qcod > 0;
        }
    }

    pub fn stats(&self) -> FcqStats {
        let qs = self.lock();
        let mut stats = FcqStats {
            smod: qs.smod,
            scod: qs.scod,
            qmod: [0; AC_COUNT],
            qcod: [0; AC_COUNT],
            port: qs.port,
            power: qs.power,
            ps_transitions: qs.ps_transitions,
        };
        for (index, queue) in qs.ac.iter().enumerate() {
            stats.qmod[index] = queue.qmod;
            stats.qcod[index] = queue.qcod;
        }
        stats
    }
}

/// Queue sets of the peers of an interface, indexed by association id,
/// plus its multicast queue set.
pub struct FcqPeerTable {
    config: FcqConfig,
    peers: Mutex<HashMap<u16, Arc<FlowControlQueueSet>>>,
    multicast: Arc<FlowControlQueueSet>,
}

impl FcqPeerTable {
    pub fn new(config: FcqConfig) -> Result<Self, FcqError> {
        let multicast = Arc::new(FlowControlQueueSet::multicast(&config)?);
        Ok(FcqPeerTable { config, peers: Mutex::new(HashMap::new()), multicast })
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<u16, Arc<FlowControlQueueSet>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peer(&self, aid: u16) -> Result<Arc<FlowControlQueueSet>, FcqError> {
        let mut peers = self.peers();
        if peers.contains_key(&aid) {
            return Err(FcqError::PeerExists);
        }
        let qs = Arc::new(FlowControlQueueSet::unicast(&self.config)?);
        peers.insert(aid, qs.clone());
        info!("queue set created for peer {}", aid);
        Ok(qs)
    }

    pub fn remove_peer(&self, aid: u16) -> Result<(), FcqError> {
        self.peers().remove(&aid).ok_or(FcqError::UnknownPeer)?;
        info!("queue set removed for peer {}", aid);
        Ok(())
    }

    pub fn peer(&self, aid: u16) -> Result<Arc<FlowControlQueueSet>, FcqError> {
        self.peers().get(&aid).cloned().ok_or(FcqError::UnknownPeer)
    }

    pub fn multicast(&self) -> &Arc<FlowControlQueueSet> {
        &self.multicast
    }

    pub fn redistribute_all(&self) {
        let peers: Vec<_> = self.peers().values().cloned().collect();
        peers.iter().for_each(|qs| qs.redistribute());
        self.multicast.redistribute();
    }

    /// Run the redistribution periodically on `timer`. Does nothing
    /// unless dynamic capacities are enabled.
    pub fn start_redistribution(self: &Arc<Self>, timer: &dyn PeriodicTimer) -> bool {
        if !self.config.dynamic_qmod {
            return false;
        }
        let table = Arc::downgrade(self);
        timer.start(
            self.config.redistribution_period,
            Arc::new(move || {
                if let Some(table) = table.upgrade() {
                    table.redistribute_all();
                }
            }),
        )
    }
}
