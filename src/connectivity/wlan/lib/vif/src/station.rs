// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        error::{Error, Resource},
        mac::MacAddr,
        vif::VifId,
    },
    std::fmt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StaId(pub u8);

impl fmt::Display for StaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sta #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StationParams {
    pub aid: u16,
    pub qos: bool,
    /// AP-VLAN the peer's traffic is steered to, if any.
    pub vlan: Option<VifId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Station {
    pub mac: MacAddr,
    pub aid: u16,
    /// Interface the peer associated with.
    pub vif: VifId,
    /// Interface carrying the peer's traffic. Equal to `vif` unless steered to an AP-VLAN.
    pub vlan: VifId,
    pub qos: bool,
    pub ps_active: bool,
    /// Firmware station index, known once the firmware acknowledged the peer.
    pub fw_sta: Option<u8>,
    pub authorized: bool,
}

/// Fixed-size arena of peer records. A slot is either free or holds a valid station.
#[derive(Debug)]
pub struct StationTable {
    slots: Vec<Option<Station>>,
}

impl StationTable {
    pub fn new(size: usize) -> Self {
        Self { slots: vec![None; size] }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Binds the first free slot to `vif` and `mac`.
    pub fn allocate(
        &mut self,
        vif: VifId,
        mac: MacAddr,
        params: StationParams,
    ) -> Result<StaId, Error> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoResources(Resource::StationSlot))?;
        self.slots[idx] = Some(Station {
            mac,
            aid: params.aid,
            vif,
            vlan: params.vlan.unwrap_or(vif),
            qos: params.qos,
            ps_active: false,
            fw_sta: None,
            authorized: false,
        });
        Ok(StaId(idx as u8))
    }

    /// First valid station with `mac`. `None` means the peer is unknown.
    pub fn retrieve(&self, mac: &MacAddr) -> Option<StaId> {
        self.iter().find(|(_, sta)| &sta.mac == mac).map(|(id, _)| id)
    }

    pub fn retrieve_on(&self, vif: VifId, mac: &MacAddr) -> Option<StaId> {
        self.iter().find(|(_, sta)| sta.vif == vif && &sta.mac == mac).map(|(id, _)| id)
    }

    pub fn by_fw_sta(&self, fw_sta: u8) -> Option<StaId> {
        self.iter().find(|(_, sta)| sta.fw_sta == Some(fw_sta)).map(|(id, _)| id)
    }

    /// Frees the slot and hands back its last contents.
    pub fn release(&mut self, sta: StaId) -> Option<Station> {
        self.slots.get_mut(sta.0 as usize).and_then(Option::take)
    }

    pub fn get(&self, sta: StaId) -> Option<&Station> {
        self.slots.get(sta.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, sta: StaId) -> Option<&mut Station> {
        self.slots.get_mut(sta.0 as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StaId, &Station)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|sta| (StaId(idx as u8), sta)))
    }

    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
