// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        channel::{ChanCtxId, ChannelLease, Chandef},
        client::{ClientSm, ConnState},
        config::MAX_VIF_SLOTS,
        error::{Error, Resource},
        fw::MacVifType,
        mac::MacAddr,
        station::StaId,
    },
    std::fmt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VifId(pub u8);

impl fmt::Display for VifId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VifType {
    Station,
    Ap,
    ApVlan,
    P2pClient,
    P2pGo,
    P2pDevice,
    MeshPoint,
    Monitor,
}

impl VifType {
    /// Connects to an access point and carries a connection state.
    pub fn is_station_like(self) -> bool {
        matches!(self, VifType::Station | VifType::P2pClient)
    }

    /// Accepts associations from peers.
    pub fn hosts_peers(self) -> bool {
        matches!(self, VifType::Ap | VifType::P2pGo)
    }

    pub fn is_p2p(self) -> bool {
        matches!(self, VifType::P2pClient | VifType::P2pGo | VifType::P2pDevice)
    }

    pub fn mac_vif_type(self) -> MacVifType {
        match self {
            VifType::Station | VifType::P2pClient | VifType::P2pDevice => MacVifType::Sta,
            VifType::Ap | VifType::P2pGo | VifType::ApVlan => MacVifType::Ap,
            VifType::MeshPoint => MacVifType::MeshPoint,
            VifType::Monitor => MacVifType::Monitor,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Down,
    Opening,
    Up,
    Closing,
}

/// A running BSS hosted by an AP-like interface.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApState {
    pub chandef: Chandef,
    pub bcmc_fw_sta: u8,
    pub radar: bool,
}

#[derive(Debug)]
pub struct Vif {
    pub id: VifId,
    pub vif_type: VifType,
    pub mac: MacAddr,
    pub lifecycle: Lifecycle,
    /// Firmware instance number while up. AP-VLANs borrow the master's.
    pub fw_idx: Option<u8>,
    pub lease: Option<ChannelLease>,
    /// Present for station-like interfaces only.
    pub client: Option<ClientSm>,
    pub ap: Option<ApState>,
    /// An AP start/stop round-trip is in flight.
    pub ap_pending: bool,
    /// Master AP of an AP-VLAN.
    pub master: Option<VifId>,
    /// The single 4-address peer steered to this AP-VLAN.
    pub sta_4a: Option<StaId>,
    pub use_4addr: bool,
    pub scanning: bool,
}

impl Vif {
    fn new(id: VifId, vif_type: VifType, mac: MacAddr, master: Option<VifId>) -> Self {
        Self {
            id,
            vif_type,
            mac,
            lifecycle: Lifecycle::Down,
            fw_idx: None,
            lease: None,
            client: if vif_type.is_station_like() { Some(ClientSm::new()) } else { None },
            ap: None,
            ap_pending: false,
            master,
            sta_4a: None,
            use_4addr: false,
            scanning: false,
        }
    }

    pub fn is_up(&self) -> bool {
        self.lifecycle == Lifecycle::Up
    }

    pub fn chanctx(&self) -> Option<ChanCtxId> {
        self.lease.as_ref().map(ChannelLease::ctx)
    }

    pub fn conn_state(&self) -> Option<ConnState> {
        self.client.as_ref().map(ClientSm::state)
    }

    pub fn info(&self) -> VifInfo {
        VifInfo {
            id: self.id,
            vif_type: self.vif_type,
            mac: self.mac,
            lifecycle: self.lifecycle,
            fw_idx: self.fw_idx,
            chanctx: self.chanctx(),
            conn_state: self.conn_state(),
            ap_started: self.ap.is_some(),
            master: self.master,
            sta_4a: self.sta_4a,
            scanning: self.scanning,
        }
    }
}

/// Point-in-time copy of an interface's externally interesting state.
#[derive(Clone, Debug, PartialEq)]
pub struct VifInfo {
    pub id: VifId,
    pub vif_type: VifType,
    pub mac: MacAddr,
    pub lifecycle: Lifecycle,
    pub fw_idx: Option<u8>,
    pub chanctx: Option<ChanCtxId>,
    pub conn_state: Option<ConnState>,
    pub ap_started: bool,
    pub master: Option<VifId>,
    pub sta_4a: Option<StaId>,
    pub scanning: bool,
}

/// Interfaces in creation order. Indices come from a bitmap of free slots.
#[derive(Debug)]
pub struct VifRegistry {
    capacity: usize,
    used: u32,
    vifs: Vec<Vif>,
}

impl VifRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.min(MAX_VIF_SLOTS), used: 0, vifs: vec![] }
    }

    pub fn allocate(
        &mut self,
        vif_type: VifType,
        mac: MacAddr,
        master: Option<VifId>,
    ) -> Result<VifId, Error> {
        let slot = (0..self.capacity)
            .find(|slot| self.used & (1 << slot) == 0)
            .ok_or(Error::NoResources(Resource::VifSlot))?;
        self.used |= 1 << slot;
        let id = VifId(slot as u8);
        self.vifs.push(Vif::new(id, vif_type, mac, master));
        Ok(id)
    }

    pub fn get(&self, id: VifId) -> Option<&Vif> {
        self.vifs.iter().find(|vif| vif.id == id)
    }

    pub fn get_mut(&mut self, id: VifId) -> Option<&mut Vif> {
        self.vifs.iter_mut().find(|vif| vif.id == id)
    }

    /// Frees the slot. The caller must have unlinked the channel context beforehand.
    pub fn remove(&mut self, id: VifId) -> Option<Vif> {
        let pos = self.vifs.iter().position(|vif| vif.id == id)?;
        self.used &= !(1 << id.0);
        Some(self.vifs.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vif> {
        self.vifs.iter()
    }

    pub fn len(&self) -> usize {
        self.vifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vifs.is_empty()
    }

    /// The up interface owning firmware instance `fw_idx`. AP-VLANs never match.
    pub fn by_fw_idx(&self, fw_idx: u8) -> Option<VifId> {
        self.vifs
            .iter()
            .find(|vif| vif.vif_type != VifType::ApVlan && vif.fw_idx == Some(fw_idx))
            .map(|vif| vif.id)
    }

    pub fn vlans_of(&self, master: VifId) -> Vec<VifId> {
        self.vifs.iter().filter(|vif| vif.master == Some(master)).map(|vif| vif.id).collect()
    }

    pub fn mac_in_use(&self, mac: &MacAddr) -> bool {
        self.vifs.iter().any(|vif| vif.vif_type != VifType::ApVlan && &vif.mac == mac)
    }
}
