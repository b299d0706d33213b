// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Everything guarded by the single table lock.
//!
//! The composite operations here keep the individual tables consistent with each other: an
//! interface's lease and its queue's channel bit change together, and a station's queue is
//! torn down before its slot is freed.

use {
    crate::{
        channel::{ChanCtxId, ChanCtxTable, Chandef, Unlinked},
        config::DriverConfig,
        error::Error,
        mac::{MacAddr, MacFmt},
        station::{StaId, Station, StationParams, StationTable},
        txq::{QueueTarget, StopReasons, TxqCoordinator},
        vif::{Vif, VifId, VifRegistry, VifType},
    },
    log::{debug, info},
};

#[derive(Debug)]
pub struct Tables {
    pub vifs: VifRegistry,
    pub stations: StationTable,
    pub chanctx: ChanCtxTable,
    pub txq: TxqCoordinator,
}

impl Tables {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            vifs: VifRegistry::new(config.max_vifs),
            stations: StationTable::new(config.max_stations),
            chanctx: ChanCtxTable::new(config.num_chanctx),
            txq: TxqCoordinator::new(),
        }
    }

    pub fn vif(&self, id: VifId) -> Result<&Vif, Error> {
        self.vifs.get(id).ok_or(Error::NoSuchVif)
    }

    pub fn vif_mut(&mut self, id: VifId) -> Result<&mut Vif, Error> {
        self.vifs.get_mut(id).ok_or(Error::NoSuchVif)
    }

    /// Points the interface at `ctx`. A lease already held is returned first, so moving to a
    /// new definition on the same context replaces it when nobody else shares the context.
    pub fn link_vif(
        &mut self,
        id: VifId,
        ctx: ChanCtxId,
        chandef: Option<Chandef>,
    ) -> Result<(), Error> {
        if !self.vif(id)?.is_up() {
            return Err(Error::VifDown);
        }
        if self.chanctx.count(ctx).is_none() {
            return Err(Error::InvalidChanCtx(ctx.0));
        }
        let _ = self.unlink_vif(id);
        let lease = self.chanctx.link(ctx, chandef)?;
        self.vif_mut(id)?.lease = Some(lease);
        self.txq.bind_vif_chanctx(id, Some(ctx));
        debug!("{} linked to {}", id, ctx);
        Ok(())
    }

    /// Returns the interface's lease, if any, and leaves it with no context.
    pub fn unlink_vif(&mut self, id: VifId) -> Option<Unlinked> {
        let lease = self.vifs.get_mut(id)?.lease.take()?;
        let unlinked = self.chanctx.unlink(lease);
        if unlinked.disable_radar {
            self.txq.disable_radar();
        }
        self.txq.bind_vif_chanctx(id, None);
        debug!("{} unlinked from {}", id, unlinked.ctx);
        Some(unlinked)
    }

    /// Creates a station record on an up interface and binds its queue.
    pub fn add_station(
        &mut self,
        vif: VifId,
        mac: MacAddr,
        params: StationParams,
    ) -> Result<StaId, Error> {
        if !self.vif(vif)?.is_up() {
            return Err(Error::VifDown);
        }
        if self.stations.retrieve_on(vif, &mac).is_some() {
            return Err(Error::StationExists);
        }
        if let Some(vlan) = params.vlan.filter(|vlan| *vlan != vif) {
            self.check_vlan(vif, vlan)?;
        }
        let sta = self.stations.allocate(vif, mac, params)?;
        let vlan = params.vlan.unwrap_or(vif);
        let _ = self.txq.station_queue_init(sta, vlan, StopReasons::empty());
        if vlan != vif {
            self.steer_4addr(sta, vlan);
        }
        info!("{} {} added on {}", sta, mac.to_mac_str(), vif);
        Ok(sta)
    }

    /// Queue state goes first so a racing power-save update never sees a half-freed slot.
    pub fn release_station(&mut self, sta: StaId) -> Option<Station> {
        self.txq.station_queue_deinit(sta);
        let station = self.stations.release(sta)?;
        if station.vlan != station.vif {
            self.clear_4addr(station.vlan, sta);
        }
        info!("{} {} removed from {}", sta, station.mac.to_mac_str(), station.vif);
        Some(station)
    }

    /// Stations that associated through `vif`.
    pub fn stations_of(&self, vif: VifId) -> Vec<StaId> {
        self.stations.iter().filter(|(_, sta)| sta.vif == vif).map(|(id, _)| id).collect()
    }

    /// Stations whose traffic is carried by AP-VLAN `vlan`.
    pub fn stations_steered_to(&self, vlan: VifId) -> Vec<StaId> {
        self.stations
            .iter()
            .filter(|(_, sta)| sta.vlan == vlan && sta.vif != vlan)
            .map(|(id, _)| id)
            .collect()
    }

    fn check_vlan(&self, owner: VifId, vlan: VifId) -> Result<(), Error> {
        let target = self.vif(vlan)?;
        if target.vif_type != VifType::ApVlan || target.master != Some(owner) {
            return Err(Error::InvalidArgs("vlan is not an AP-VLAN of this interface"));
        }
        if !target.is_up() {
            return Err(Error::VifDown);
        }
        Ok(())
    }

    fn steer_4addr(&mut self, sta: StaId, vlan: VifId) {
        if let Some(vif) = self.vifs.get_mut(vlan) {
            if vif.use_4addr {
                vif.sta_4a = Some(sta);
            }
        }
    }

    fn clear_4addr(&mut self, vlan: VifId, sta: StaId) {
        if let Some(vif) = self.vifs.get_mut(vlan) {
            if vif.sta_4a == Some(sta) {
                vif.sta_4a = None;
            }
        }
    }

    /// Moves a station's traffic to `vlan`, or back to its owner when `vlan` is the owner.
    pub fn set_station_vlan(&mut self, sta: StaId, vlan: VifId) -> Result<(), Error> {
        let (owner, old) = {
            let station = self.stations.get(sta).ok_or(Error::NoSuchStation)?;
            (station.vif, station.vlan)
        };
        if vlan != owner {
            self.check_vlan(owner, vlan)?;
        }
        if old == vlan {
            return Ok(());
        }
        if old != owner {
            self.clear_4addr(old, sta);
        }
        if let Some(station) = self.stations.get_mut(sta) {
            station.vlan = vlan;
        }
        if vlan != owner {
            self.steer_4addr(sta, vlan);
        }
        self.txq.rebind_station(sta, vlan);
        Ok(())
    }

    pub fn set_power_save(&mut self, sta: StaId, ps_on: bool) -> Result<(), Error> {
        let station = self.stations.get_mut(sta).ok_or(Error::NoSuchStation)?;
        station.ps_active = ps_on;
        if ps_on {
            self.txq.stop(QueueTarget::Station(sta), StopReasons::PS);
        } else {
            self.txq.start(QueueTarget::Station(sta), StopReasons::PS);
        }
        Ok(())
    }

    /// The radio now sits on `ctx`. Returns the context's definition, if it still has one.
    pub fn switch_chanctx(&mut self, ctx: ChanCtxId) -> Result<Option<Chandef>, Error> {
        self.chanctx.set_active(ctx)?;
        self.txq.set_active_chanctx(ctx);
        Ok(self.chanctx.chandef(ctx))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{channel::Cbw, vif::Lifecycle},
        assert_matches::assert_matches,
    };

    fn tables() -> Tables {
        Tables::new(&DriverConfig::default())
    }

    fn up_vif(tables: &mut Tables, vif_type: VifType, master: Option<VifId>) -> VifId {
        let id = tables.vifs.allocate(vif_type, [2, 0, 0, 0, 0, 1], master).expect("allocate vif");
        tables.txq.vif_queue_init(id, StopReasons::CHAN);
        tables.vif_mut(id).expect("vif").lifecycle = Lifecycle::Up;
        id
    }

    fn chan() -> Chandef {
        Chandef::new(2412, Cbw::Cbw20)
    }

    #[test]
    fn link_requires_up() {
        let mut tables = tables();
        let id = tables.vifs.allocate(VifType::Station, [2; 6], None).expect("allocate");
        assert_matches!(tables.link_vif(id, ChanCtxId(0), Some(chan())), Err(Error::VifDown));
        assert_eq!(tables.chanctx.count(ChanCtxId(0)), Some(0));
    }

    #[test]
    fn relink_returns_old_lease() {
        let mut tables = tables();
        let id = up_vif(&mut tables, VifType::Station, None);
        tables.link_vif(id, ChanCtxId(0), Some(chan())).expect("link 0");
        tables.link_vif(id, ChanCtxId(1), Some(Chandef::new(5180, Cbw::Cbw20))).expect("link 1");
        assert_eq!(tables.chanctx.count(ChanCtxId(0)), Some(0));
        assert_eq!(tables.chanctx.count(ChanCtxId(1)), Some(1));
        assert_eq!(tables.vif(id).expect("vif").chanctx(), Some(ChanCtxId(1)));

        assert!(tables.unlink_vif(id).is_some());
        assert!(tables.unlink_vif(id).is_none());
        assert_eq!(tables.chanctx.count(ChanCtxId(1)), Some(0));
    }

    #[test]
    fn relink_same_context_takes_new_definition() {
        let mut tables = tables();
        let id = up_vif(&mut tables, VifType::Monitor, None);
        tables.link_vif(id, ChanCtxId(0), Some(chan())).expect("link");
        let moved = Chandef::new(2462, Cbw::Cbw20);
        tables.link_vif(id, ChanCtxId(0), Some(moved)).expect("relink");
        assert_eq!(tables.chanctx.chandef(ChanCtxId(0)), Some(moved));
        assert_eq!(tables.chanctx.count(ChanCtxId(0)), Some(1));
        let _ = tables.unlink_vif(id);
    }

    #[test]
    fn failed_link_keeps_old_lease() {
        let mut tables = tables();
        let id = up_vif(&mut tables, VifType::Station, None);
        tables.link_vif(id, ChanCtxId(0), Some(chan())).expect("link");
        assert_matches!(tables.link_vif(id, ChanCtxId(9), None), Err(Error::InvalidChanCtx(9)));
        assert_eq!(tables.vif(id).expect("vif").chanctx(), Some(ChanCtxId(0)));
        let _ = tables.unlink_vif(id);
    }

    #[test]
    fn unlink_active_disables_radar() {
        let mut tables = tables();
        let id = up_vif(&mut tables, VifType::Ap, None);
        tables.link_vif(id, ChanCtxId(2), Some(chan())).expect("link");
        tables.switch_chanctx(ChanCtxId(2)).expect("switch");
        tables.txq.enable_radar();
        let gate = tables.txq.vif_handle(id).expect("gate");
        assert!(gate.can_transmit());

        let unlinked = tables.unlink_vif(id).expect("unlinked");
        assert!(unlinked.disable_radar);
        assert!(!tables.txq.radar_enabled());
        assert!(!gate.can_transmit());
    }

    #[test]
    fn station_on_down_vif_rejected() {
        let mut tables = tables();
        let id = tables.vifs.allocate(VifType::Ap, [2; 6], None).expect("allocate");
        assert_matches!(
            tables.add_station(id, [4; 6], StationParams::default()),
            Err(Error::VifDown)
        );
        assert_matches!(
            tables.add_station(VifId(7), [4; 6], StationParams::default()),
            Err(Error::NoSuchVif)
        );
    }

    #[test]
    fn duplicate_station_rejected() {
        let mut tables = tables();
        let ap = up_vif(&mut tables, VifType::Ap, None);
        tables.add_station(ap, [4; 6], StationParams::default()).expect("add");
        assert_matches!(
            tables.add_station(ap, [4; 6], StationParams::default()),
            Err(Error::StationExists)
        );
    }

    #[test]
    fn release_deinits_queue_and_clears_vlan_back_reference() {
        let mut tables = tables();
        let ap = up_vif(&mut tables, VifType::Ap, None);
        let vlan = up_vif(&mut tables, VifType::ApVlan, Some(ap));
        tables.vif_mut(vlan).expect("vlan").use_4addr = true;

        let sta = tables
            .add_station(ap, [4; 6], StationParams { vlan: Some(vlan), ..Default::default() })
            .expect("add");
        assert_eq!(tables.vif(vlan).expect("vlan").sta_4a, Some(sta));
        assert_eq!(tables.stations_steered_to(vlan), vec![sta]);
        let gate = tables.txq.station_handle(sta).expect("gate");

        let station = tables.release_station(sta).expect("release");
        assert_eq!(station.vlan, vlan);
        assert_eq!(tables.vif(vlan).expect("vlan").sta_4a, None);
        assert!(gate.stop_reasons().contains(StopReasons::INACTIVE));
        assert_eq!(tables.stations.occupancy(), 0);
    }

    #[test]
    fn vlan_must_belong_to_owner() {
        let mut tables = tables();
        let ap = up_vif(&mut tables, VifType::Ap, None);
        let other = up_vif(&mut tables, VifType::Ap, None);
        let vlan = up_vif(&mut tables, VifType::ApVlan, Some(other));
        assert_matches!(
            tables.add_station(ap, [4; 6], StationParams { vlan: Some(vlan), ..Default::default() }),
            Err(Error::InvalidArgs(_))
        );
        assert_eq!(tables.stations.occupancy(), 0);
    }

    #[test]
    fn move_station_between_vlan_and_owner() {
        let mut tables = tables();
        let ap = up_vif(&mut tables, VifType::Ap, None);
        let vlan = up_vif(&mut tables, VifType::ApVlan, Some(ap));
        tables.vif_mut(vlan).expect("vlan").use_4addr = true;
        let sta = tables.add_station(ap, [4; 6], StationParams::default()).expect("add");

        tables.set_station_vlan(sta, vlan).expect("steer");
        assert_eq!(tables.vif(vlan).expect("vlan").sta_4a, Some(sta));
        tables.set_station_vlan(sta, ap).expect("unsteer");
        assert_eq!(tables.vif(vlan).expect("vlan").sta_4a, None);
        assert_eq!(tables.stations.get(sta).map(|s| s.vlan), Some(ap));
    }

    #[test]
    fn power_save_gates_station_queue() {
        let mut tables = tables();
        let ap = up_vif(&mut tables, VifType::Ap, None);
        tables.link_vif(ap, ChanCtxId(0), Some(chan())).expect("link");
        tables.switch_chanctx(ChanCtxId(0)).expect("switch");
        let sta = tables.add_station(ap, [4; 6], StationParams::default()).expect("add");
        let gate = tables.txq.station_handle(sta).expect("gate");
        assert!(gate.can_transmit());

        tables.set_power_save(sta, true).expect("ps on");
        assert!(!gate.can_transmit());
        assert_eq!(tables.stations.get(sta).map(|s| s.ps_active), Some(true));
        tables.set_power_save(sta, false).expect("ps off");
        assert!(gate.can_transmit());
        assert_matches!(tables.set_power_save(StaId(9), true), Err(Error::NoSuchStation));
        let _ = tables.unlink_vif(ap);
    }
}
