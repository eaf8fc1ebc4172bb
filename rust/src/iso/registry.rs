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

//! Fixed capacity tables of the CIG, CIS, BIG and BIS records.
//!
//! Capacities are decided at init time and never grow; a record keeps
//! its slot index for its whole lifetime.

use crate::error::IsoError;
use crate::iso::controller::{
    BroadcasterState, CigParam, CisParam, CisState, IsochInfo, LinkQuality, ReceiverSyncState,
};
use crate::iso::{ConnHandle, IsoRole, ISO_ID_MAX};

/// Max number of CIGs
pub const MAX_CIG_NUMBER: usize = 4;
/// Max number of CISes, across all CIGs
pub const MAX_CIS_NUMBER: usize = 4;
/// Max number of BIGs
pub const MAX_BIG_NUMBER: usize = 4;
/// Max number of BISes, across all BIGs
pub const MAX_BIS_NUMBER: usize = 4;

struct Slots<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Slots { slots: Vec::new() }
    }
}

impl<T> Slots<T> {
    fn with_capacity(capacity: usize) -> Self {
        Slots { slots: (0..capacity).map(|_| None).collect() }
    }

    fn claim(&mut self, value: T) -> Result<&mut T, IsoError> {
        let slot = self.slots.iter_mut().find(|slot| slot.is_none()).ok_or(IsoError::NoResource)?;
        Ok(slot.get_or_insert(value))
    }

    fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<&T> {
        self.slots.iter().flatten().find(|value| predicate(value))
    }

    fn find_mut(&mut self, predicate: impl Fn(&T) -> bool) -> Option<&mut T> {
        self.slots.iter_mut().flatten().find(|value| predicate(value))
    }

    fn release(&mut self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.as_ref().map(&predicate).unwrap_or(false))
            .filter_map(Option::take)
            .collect()
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten()
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Data path directions of a CIS or BIS, as direction bit masks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataPath {
    pub established: u8,
    /// Directions of the setup request in flight.
    pub adding: u8,
    /// Directions of the remove request in flight.
    pub removing: u8,
}

impl DataPath {
    pub fn complete_setup(&mut self, success: bool) {
        if success {
            self.established |= self.adding;
        }
        self.adding = 0;
    }

    pub fn complete_remove(&mut self, success: bool) {
        if success {
            self.established &= !self.removing;
        }
        self.removing = 0;
    }
}

#[derive(Clone, Debug)]
pub struct Cig {
    pub cig_id: u8,
    pub param: Option<CigParam>,
}

#[derive(Clone, Debug)]
pub struct Cis {
    pub cig_id: u8,
    pub cis_id: u8,
    pub role: IsoRole,
    pub state: CisState,
    /// Assigned by the controller, once the CIG is set up (initiator)
    /// or when the CIS is requested (acceptor).
    pub cis_conn_handle: Option<ConnHandle>,
    /// ACL link the CIS is bound to.
    pub conn_id: Option<u8>,
    pub param: Option<CisParam>,
    pub data_path: DataPath,
    pub info: Option<IsochInfo>,
    pub link_quality: LinkQuality,
    /// Max SDU configured by the acceptor for the S->M direction.
    pub acceptor_max_sdu: Option<u16>,
}

impl Cis {
    fn new(cig_id: u8, cis_id: u8, role: IsoRole) -> Self {
        Cis {
            cig_id,
            cis_id,
            role,
            state: CisState::Idle,
            cis_conn_handle: None,
            conn_id: None,
            param: None,
            data_path: DataPath::default(),
            info: None,
            link_quality: Default::default(),
            acceptor_max_sdu: None,
        }
    }

    /// Max SDU in the direction this side transmits.
    pub fn max_sdu_tx(&self) -> u16 {
        match self.role {
            IsoRole::Acceptor => self
                .acceptor_max_sdu
                .or_else(|| self.info.map(|info| info.max_sdu_s_m))
                .unwrap_or(0),
            _ => self
                .info
                .map(|info| info.max_sdu_m_s)
                .or_else(|| self.param.map(|param| param.max_sdu_m_s))
                .unwrap_or(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BigState {
    Broadcaster(BroadcasterState),
    Receiver(ReceiverSyncState),
}

#[derive(Clone, Debug)]
pub struct Big {
    pub big_handle: u8,
    /// Advertising set (broadcaster) or periodic sync handle (receiver).
    pub source_handle: u16,
    pub state: BigState,
    /// Max SDU of the BISes of the group.
    pub max_sdu: u16,
}

impl Big {
    pub fn role(&self) -> IsoRole {
        match self.state {
            BigState::Broadcaster(_) => IsoRole::Broadcaster,
            BigState::Receiver(_) => IsoRole::Receiver,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Bis {
    pub big_handle: u8,
    pub bis_index: u8,
    pub bis_conn_handle: ConnHandle,
    pub data_path: DataPath,
    pub link_quality: LinkQuality,
}

/// Isochronous channel records of the subsystem.
#[derive(Default)]
pub struct IsochChannelRegistry {
    cigs: Slots<Cig>,
    cises: Slots<Cis>,
    bigs: Slots<Big>,
    bises: Slots<Bis>,
}

pub fn check_id(id: u8) -> Result<(), IsoError> {
    if id > ISO_ID_MAX {
        Err(IsoError::ParamInvalid)
    } else {
        Ok(())
    }
}

impl IsochChannelRegistry {
    /// Allocate the CIG and CIS tables, dropping any previous record.
    pub fn init_cig(&mut self, cig_num: usize, cis_num: usize) {
        self.cigs = Slots::with_capacity(cig_num);
        self.cises = Slots::with_capacity(cis_num);
    }

    /// Allocate the BIG and BIS tables, dropping any previous record.
    pub fn init_big(&mut self, big_num: usize, bis_num: usize) {
        self.bigs = Slots::with_capacity(big_num);
        self.bises = Slots::with_capacity(bis_num);
    }

    pub fn cig_capacity(&self) -> (usize, usize) {
        (self.cigs.capacity(), self.cises.capacity())
    }

    pub fn big_capacity(&self) -> (usize, usize) {
        (self.bigs.capacity(), self.bises.capacity())
    }

    pub fn add_cig(&mut self, cig_id: u8) -> Result<&mut Cig, IsoError> {
        check_id(cig_id)?;
        if self.cigs.find(|cig| cig.cig_id == cig_id).is_some() {
            return self.cigs.find_mut(|cig| cig.cig_id == cig_id).ok_or(IsoError::NotFound);
        }
        self.cigs.claim(Cig { cig_id, param: None })
    }

    pub fn cig(&self, cig_id: u8) -> Option<&Cig> {
        self.cigs.find(|cig| cig.cig_id == cig_id)
    }

    pub fn cig_mut(&mut self, cig_id: u8) -> Option<&mut Cig> {
        self.cigs.find_mut(|cig| cig.cig_id == cig_id)
    }

    /// Release a CIG and all its CISes.
    pub fn remove_cig(&mut self, cig_id: u8) -> Option<Cig> {
        self.cises.release(|cis| cis.cig_id == cig_id);
        self.cigs.release(|cig| cig.cig_id == cig_id).pop()
    }

    /// Claim a CIS slot. Initiator CISes belong to a registered CIG.
    pub fn add_cis(&mut self, cig_id: u8, cis_id: u8, role: IsoRole) -> Result<&mut Cis, IsoError> {
        check_id(cig_id)?;
        check_id(cis_id)?;
        if role == IsoRole::Initiator && self.cig(cig_id).is_none() {
            return Err(IsoError::ParamInvalid);
        }
        if self.cis(cig_id, cis_id).is_some() {
            return self.cis_mut(cig_id, cis_id).ok_or(IsoError::NotFound);
        }
        self.cises.claim(Cis::new(cig_id, cis_id, role))
    }

    pub fn cis(&self, cig_id: u8, cis_id: u8) -> Option<&Cis> {
        self.cises.find(|cis| cis.cig_id == cig_id && cis.cis_id == cis_id)
    }

    pub fn cis_mut(&mut self, cig_id: u8, cis_id: u8) -> Option<&mut Cis> {
        self.cises.find_mut(|cis| cis.cig_id == cig_id && cis.cis_id == cis_id)
    }

    /// First CIS with the given identifier, in any CIG.
    pub fn cis_by_id_mut(&mut self, cis_id: u8) -> Option<&mut Cis> {
        self.cises.find_mut(|cis| cis.cis_id == cis_id)
    }

    pub fn cis_by_handle(&self, handle: ConnHandle) -> Option<&Cis> {
        self.cises.find(|cis| cis.cis_conn_handle == Some(handle))
    }

    pub fn cis_by_handle_mut(&mut self, handle: ConnHandle) -> Option<&mut Cis> {
        self.cises.find_mut(|cis| cis.cis_conn_handle == Some(handle))
    }

    pub fn remove_cis(&mut self, cig_id: u8, cis_id: u8) -> Option<Cis> {
        self.cises.release(|cis| cis.cig_id == cig_id && cis.cis_id == cis_id).pop()
    }

    pub fn release_cis(&mut self, handle: ConnHandle) -> Option<Cis> {
        self.cises.release(|cis| cis.cis_conn_handle == Some(handle)).pop()
    }

    pub fn cises_in_cig_mut(&mut self, cig_id: u8) -> impl Iterator<Item = &mut Cis> {
        self.cises.iter_mut().filter(move |cis| cis.cig_id == cig_id)
    }

    pub fn cises(&self) -> impl Iterator<Item = &Cis> {
        self.cises.iter()
    }

    /// Returns the first unused BIG handle.
    pub fn new_big_handle(&self) -> Option<u8> {
        (0..=ISO_ID_MAX).find(|handle| self.big(*handle).is_none())
    }

    pub fn add_big(
        &mut self,
        big_handle: u8,
        source_handle: u16,
        state: BigState,
    ) -> Result<&mut Big, IsoError> {
        if self.big(big_handle).is_some() {
            return Err(IsoError::Busy);
        }
        self.bigs.claim(Big { big_handle, source_handle, state, max_sdu: 0 })
    }

    pub fn big(&self, big_handle: u8) -> Option<&Big> {
        self.bigs.find(|big| big.big_handle == big_handle)
    }

    pub fn big_mut(&mut self, big_handle: u8) -> Option<&mut Big> {
        self.bigs.find_mut(|big| big.big_handle == big_handle)
    }

    /// Release a BIG and all its BISes.
    pub fn remove_big(&mut self, big_handle: u8) -> Option<Big> {
        self.bises.release(|bis| bis.big_handle == big_handle);
        self.bigs.release(|big| big.big_handle == big_handle).pop()
    }

    pub fn add_bis(
        &mut self,
        big_handle: u8,
        bis_index: u8,
        bis_conn_handle: ConnHandle,
    ) -> Result<&mut Bis, IsoError> {
        if self.bis_by_handle(bis_conn_handle).is_some() {
            return self.bis_by_handle_mut(bis_conn_handle).ok_or(IsoError::NotFound);
        }
        self.bises.claim(Bis {
            big_handle,
            bis_index,
            bis_conn_handle,
            data_path: DataPath::default(),
            link_quality: Default::default(),
        })
    }

    pub fn bis_by_handle(&self, handle: ConnHandle) -> Option<&Bis> {
        self.bises.find(|bis| bis.bis_conn_handle == handle)
    }

    pub fn bis_by_handle_mut(&mut self, handle: ConnHandle) -> Option<&mut Bis> {
        self.bises.find_mut(|bis| bis.bis_conn_handle == handle)
    }

    /// Whether data may flow on a handle: a connected CIS or a BIS.
    /// `None` for an unknown handle.
    pub fn is_established(&self, handle: ConnHandle) -> Option<bool> {
        if let Some(cis) = self.cis_by_handle(handle) {
            return Some(cis.state == CisState::Connected);
        }
        self.bis_by_handle(handle).map(|_| true)
    }

    pub fn data_path_mut(&mut self, handle: ConnHandle) -> Option<&mut DataPath> {
        if self.cis_by_handle(handle).is_some() {
            return self.cis_by_handle_mut(handle).map(|cis| &mut cis.data_path);
        }
        self.bis_by_handle_mut(handle).map(|bis| &mut bis.data_path)
    }

    pub fn link_quality_mut(&mut self, handle: ConnHandle) -> Option<&mut LinkQuality> {
        if self.cis_by_handle(handle).is_some() {
            return self.cis_by_handle_mut(handle).map(|cis| &mut cis.link_quality);
        }
        self.bis_by_handle_mut(handle).map(|bis| &mut bis.link_quality)
    }

    /// Max SDU of the group a BIS belongs to.
    pub fn bis_max_sdu(&self, handle: ConnHandle) -> Option<u16> {
        self.bis_by_handle(handle).and_then(|bis| self.big(bis.big_handle)).map(|big| big.max_sdu)
    }

    /// Drop every record, keeping the capacities.
    pub fn clear(&mut self) {
        let (cig_num, cis_num) = self.cig_capacity();
        let (big_num, bis_num) = self.big_capacity();
        self.init_cig(cig_num, cis_num);
        self.init_big(big_num, bis_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> IsochChannelRegistry {
        let mut registry = IsochChannelRegistry::default();
        registry.init_cig(1, 2);
        registry.init_big(1, 2);
        registry
    }

    #[test]
    fn cig_slots_are_bounded() {
        let mut registry = registry();
        assert!(registry.add_cig(0).is_ok());
        // Registering the same CIG twice reuses its slot.
        assert!(registry.add_cig(0).is_ok());
        assert_eq!(registry.add_cig(1).err(), Some(IsoError::NoResource));
        assert_eq!(registry.add_cig(ISO_ID_MAX + 1).err(), Some(IsoError::ParamInvalid));
    }

    #[test]
    fn initiator_cis_needs_cig() {
        let mut registry = registry();
        assert_eq!(registry.add_cis(0, 0, IsoRole::Initiator).err(), Some(IsoError::ParamInvalid));
        registry.add_cig(0).unwrap();
        registry.add_cis(0, 0, IsoRole::Initiator).unwrap();
        registry.add_cis(0, 1, IsoRole::Initiator).unwrap();
        assert_eq!(registry.add_cis(0, 2, IsoRole::Initiator).err(), Some(IsoError::NoResource));
        assert_eq!(
            registry.add_cis(0, 0xf0, IsoRole::Initiator).err(),
            Some(IsoError::ParamInvalid)
        );
    }

    #[test]
    fn acceptor_cis_without_cig() {
        let mut registry = registry();
        let cis = registry.add_cis(3, 1, IsoRole::Acceptor).unwrap();
        cis.cis_conn_handle = Some(0x60);
        assert_eq!(registry.cis_by_handle(0x60).map(|cis| cis.cis_id), Some(1));
        assert!(registry.release_cis(0x60).is_some());
        assert!(registry.cis_by_handle(0x60).is_none());
    }

    #[test]
    fn remove_cig_releases_cises() {
        let mut registry = registry();
        registry.add_cig(0).unwrap();
        registry.add_cis(0, 0, IsoRole::Initiator).unwrap();
        registry.add_cis(0, 1, IsoRole::Initiator).unwrap();
        assert!(registry.remove_cig(0).is_some());
        assert_eq!(registry.cises().count(), 0);
        // Slots are available again.
        registry.add_cig(2).unwrap();
        registry.add_cis(2, 0, IsoRole::Initiator).unwrap();
    }

    #[test]
    fn bis_max_sdu_follows_big() {
        let mut registry = registry();
        let handle = registry.new_big_handle().unwrap();
        registry
            .add_big(handle, 1, BigState::Broadcaster(BroadcasterState::Creating))
            .unwrap()
            .max_sdu = 100;
        registry.add_bis(handle, 1, 0x20).unwrap();
        assert_eq!(registry.bis_max_sdu(0x20), Some(100));
        assert_eq!(registry.new_big_handle(), Some(handle + 1));
        registry.remove_big(handle);
        assert_eq!(registry.bis_max_sdu(0x20), None);
    }

    #[test]
    fn data_path_lookup_spans_cis_and_bis() {
        let mut registry = registry();
        assert_eq!(registry.is_established(0x40), None);

        registry.add_cig(0).unwrap();
        registry.add_cis(0, 0, IsoRole::Initiator).unwrap().cis_conn_handle = Some(0x40);
        assert_eq!(registry.is_established(0x40), Some(false));
        registry.cis_mut(0, 0).unwrap().state = CisState::Connected;
        assert_eq!(registry.is_established(0x40), Some(true));

        registry.add_big(1, 0, BigState::Receiver(ReceiverSyncState::Synchronized)).unwrap();
        registry.add_bis(1, 1, 0x50).unwrap();
        assert_eq!(registry.is_established(0x50), Some(true));

        let path = registry.data_path_mut(0x50).unwrap();
        path.adding = 0x02;
        path.complete_setup(true);
        path.removing = 0x02;
        path.complete_remove(false);
        assert_eq!(registry.bis_by_handle(0x50).unwrap().data_path.established, 0x02);
        assert!(registry.data_path_mut(0x40).is_some());
        assert!(registry.link_quality_mut(0x41).is_none());
    }

    #[test]
    fn max_sdu_tx_by_role() {
        let mut registry = registry();
        registry.add_cig(0).unwrap();
        let cis = registry.add_cis(0, 0, IsoRole::Initiator).unwrap();
        assert_eq!(cis.max_sdu_tx(), 0);
        cis.param = Some(CisParam { max_sdu_m_s: 120, ..Default::default() });
        assert_eq!(cis.max_sdu_tx(), 120);
        cis.info = Some(IsochInfo { max_sdu_m_s: 100, max_sdu_s_m: 40, ..Default::default() });
        assert_eq!(cis.max_sdu_tx(), 100);

        let cis = registry.add_cis(1, 0, IsoRole::Acceptor).unwrap();
        cis.info = Some(IsochInfo { max_sdu_m_s: 100, max_sdu_s_m: 40, ..Default::default() });
        assert_eq!(cis.max_sdu_tx(), 40);
    }
}
