// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The network-stack facing side of the driver core.
//!
//! Every operation follows the same shape: validate and reserve under the table lock, release
//! the lock, perform the firmware round-trip, then take the lock again and apply the outcome.
//! The lock is never held across an `.await`.

use {
    crate::{
        channel::{ChanCtxId, Chandef},
        client::{ClientSm, ConnState, ConnectTicket},
        config::DriverConfig,
        error::{Error, GatewayError},
        event::{ConnectResult, StackEvent},
        fw::{CmdId, FirmwareGateway, FwConfirm, FwIndication, FwRequest},
        mac::{is_multicast, MacAddr, MacFmt},
        sink::{StackEventSink, UnboundedSink},
        station::{StaId, Station, StationParams},
        tables::Tables,
        timer::Timer,
        txq::{StopReasons, TxqHandle},
        vif::{ApState, Lifecycle, VifId, VifInfo, VifType},
    },
    futures::{
        channel::mpsc,
        future::{self, Either},
    },
    log::{debug, error, info, warn},
    parking_lot::Mutex,
};

/// Reason code used when the driver itself tears a link down.
pub const REASON_DEAUTH_LEAVING: u16 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VifParams {
    pub vif_type: VifType,
    pub mac: MacAddr,
    /// Master AP, for AP-VLAN interfaces only.
    pub master: Option<VifId>,
    pub use_4addr: bool,
}

impl VifParams {
    pub fn new(vif_type: VifType, mac: MacAddr) -> Self {
        Self { vif_type, mac, master: None, use_4addr: false }
    }

    pub fn ap_vlan(master: VifId, mac: MacAddr, use_4addr: bool) -> Self {
        Self { vif_type: VifType::ApVlan, mac, master: Some(master), use_4addr }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectParams {
    pub bssid: MacAddr,
    pub ssid: Vec<u8>,
    pub chandef: Option<Chandef>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApSettings {
    pub chandef: Chandef,
    pub beacon_interval: u16,
    pub radar_detect: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StationChange {
    /// Steer the peer to this AP-VLAN, or back to its owner.
    pub vlan: Option<VifId>,
    pub authorized: Option<bool>,
}

fn unexpected(cmd: CmdId) -> Error {
    Error::Gateway { cmd, source: GatewayError::Transport(format!("unexpected {:?} confirmation", cmd)) }
}

fn client_mut(tables: &mut Tables, id: VifId) -> Option<&mut ClientSm> {
    tables.vifs.get_mut(id)?.client.as_mut()
}

/// Firmware instance of an up interface whose type allows `op`.
fn up_vif(
    tables: &Tables,
    id: VifId,
    op: &'static str,
    allowed: impl Fn(VifType) -> bool,
) -> Result<u8, Error> {
    let vif = tables.vif(id)?;
    if !allowed(vif.vif_type) {
        return Err(Error::WrongVifType { op, vif_type: vif.vif_type });
    }
    if !vif.is_up() {
        return Err(Error::VifDown);
    }
    vif.fw_idx.ok_or(Error::VifDown)
}

/// Releases the implicit AP station and the channel lease of a station-like interface.
fn drop_link(tables: &mut Tables, id: VifId) {
    let ap = client_mut(tables, id).and_then(|client| {
        client.bssid = None;
        client.ap.take()
    });
    if let Some(sta) = ap {
        let _ = tables.release_station(sta);
    }
    let _ = tables.unlink_vif(id);
}

pub struct Driver<G, T> {
    config: DriverConfig,
    tables: Mutex<Tables>,
    gateway: G,
    timer: T,
    events: StackEventSink,
}

impl<G: FirmwareGateway, T: Timer> Driver<G, T> {
    /// Builds a driver instance and the stream its upcalls are delivered on.
    pub fn new(
        config: DriverConfig,
        gateway: G,
        timer: T,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StackEvent>), anyhow::Error> {
        config.validate()?;
        let (sender, receiver) = mpsc::unbounded();
        let driver = Self {
            tables: Mutex::new(Tables::new(&config)),
            config,
            gateway,
            timer,
            events: UnboundedSink::new(sender),
        };
        Ok((driver, receiver))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// One firmware round-trip, bounded by the command timeout. The status is not inspected.
    async fn request(&self, req: FwRequest) -> Result<FwConfirm, Error> {
        let cmd = req.id();
        debug!("fw <- {:?}", req);
        let reply = self.gateway.send(req);
        let timeout = self.timer.wait(self.config.cmd_timeout());
        match future::select(reply, timeout).await {
            Either::Left((Ok(cfm), _)) if cfm.id() == cmd => {
                debug!("fw -> {:?}", cfm);
                Ok(cfm)
            }
            Either::Left((Ok(cfm), _)) => {
                error!("{:?} answered with {:?}", cmd, cfm.id());
                Err(unexpected(cfm.id()))
            }
            Either::Left((Err(source), _)) => {
                error!("{:?} failed: {}", cmd, source);
                Err(Error::Gateway { cmd, source })
            }
            Either::Right(((), _)) => {
                error!("{:?} timed out", cmd);
                Err(Error::Timeout(cmd))
            }
        }
    }

    /// Like `request`, but a non-OK status is an error.
    async fn command(&self, req: FwRequest) -> Result<FwConfirm, Error> {
        let cmd = req.id();
        let cfm = self.request(req).await?;
        let status = cfm.status();
        if !status.is_ok() {
            error!("firmware rejected {:?}: {}", cmd, status);
            return Err(Error::Rejected { cmd, status });
        }
        Ok(cfm)
    }

    /// Reserves an interface slot. The interface starts down.
    pub fn add_interface(&self, params: VifParams) -> Result<VifId, Error> {
        if is_multicast(&params.mac) {
            return Err(Error::InvalidArgs("interface address must be unicast"));
        }
        let mut tables = self.tables.lock();
        match (params.vif_type, params.master) {
            (VifType::ApVlan, Some(master)) => {
                let master_type = tables.vif(master)?.vif_type;
                if master_type != VifType::Ap {
                    return Err(Error::WrongVifType { op: "add_ap_vlan", vif_type: master_type });
                }
            }
            (VifType::ApVlan, None) => return Err(Error::InvalidArgs("AP-VLAN needs a master")),
            (_, Some(_)) => return Err(Error::InvalidArgs("only AP-VLANs have a master")),
            (_, None) => {
                if tables.vifs.mac_in_use(&params.mac) {
                    return Err(Error::InvalidArgs("interface address in use"));
                }
            }
        }
        let id = tables.vifs.allocate(params.vif_type, params.mac, params.master)?;
        tables.vif_mut(id)?.use_4addr = params.use_4addr;
        info!("new iface #{} with role '{:?}' and address {}", id.0, params.vif_type, params.mac.to_mac_str());
        Ok(id)
    }

    /// Brings the interface up: registers it with the firmware and binds its queue.
    pub async fn open(&self, id: VifId) -> Result<(), Error> {
        let (vif_type, mac) = {
            let mut tables = self.tables.lock();
            let vif = tables.vif(id)?;
            let (vif_type, mac) = (vif.vif_type, vif.mac);
            match vif.lifecycle {
                Lifecycle::Up => return Ok(()),
                Lifecycle::Opening | Lifecycle::Closing => return Err(Error::Busy),
                Lifecycle::Down => {}
            }
            if vif_type == VifType::ApVlan {
                return self.open_vlan(&mut tables, id);
            }
            tables.vif_mut(id)?.lifecycle = Lifecycle::Opening;
            (vif_type, mac)
        };

        let req = FwRequest::AddIf { vif_type: vif_type.mac_vif_type(), mac, p2p: vif_type.is_p2p() };
        let result = self.command(req).await;

        let mut tables = self.tables.lock();
        let inst_nbr = match result {
            Ok(FwConfirm::AddIf { inst_nbr, .. }) => Ok(inst_nbr),
            Ok(_) => Err(unexpected(CmdId::AddIf)),
            Err(e) => Err(e),
        };
        let vif = tables.vif_mut(id)?;
        let inst_nbr = match inst_nbr {
            Ok(inst_nbr) => inst_nbr,
            Err(e) => {
                vif.lifecycle = Lifecycle::Down;
                return Err(e);
            }
        };
        vif.fw_idx = Some(inst_nbr);
        vif.lifecycle = Lifecycle::Up;
        let _ = tables.txq.vif_queue_init(id, StopReasons::CHAN);
        info!("{} up as firmware instance {}", id, inst_nbr);
        Ok(())
    }

    /// AP-VLANs ride on their master's firmware instance and channel.
    fn open_vlan(&self, tables: &mut Tables, id: VifId) -> Result<(), Error> {
        let master = tables.vif(id)?.master.ok_or(Error::InvalidArgs("AP-VLAN needs a master"))?;
        let (fw_idx, chanctx) = {
            let master = tables.vif(master)?;
            if !master.is_up() {
                return Err(Error::VifDown);
            }
            (master.fw_idx, master.chanctx())
        };
        let vif = tables.vif_mut(id)?;
        vif.fw_idx = fw_idx;
        vif.lifecycle = Lifecycle::Up;
        let _ = tables.txq.vif_queue_init(id, StopReasons::CHAN);
        tables.txq.bind_vif_chanctx(id, chanctx);
        info!("{} up on master {}", id, master);
        Ok(())
    }

    /// Hands the stations steered to `vlan` back to the master and takes the AP-VLAN down.
    fn detach_vlan(&self, tables: &mut Tables, vlan: VifId) {
        if let Some(master) = tables.vifs.get(vlan).and_then(|vif| vif.master) {
            for sta in tables.stations_steered_to(vlan) {
                if let Err(e) = tables.set_station_vlan(sta, master) {
                    warn!("could not return {} to {}: {}", sta, master, e);
                }
            }
        }
        tables.txq.vif_queue_deinit(vlan);
        if let Some(vif) = tables.vifs.get_mut(vlan) {
            vif.sta_4a = None;
            vif.fw_idx = None;
            vif.lifecycle = Lifecycle::Down;
        }
        info!("{} down", vlan);
    }

    /// Takes the interface down. The connection is driven to Disconnected, the BSS is stopped,
    /// stations are removed and the channel context is unlinked before the firmware instance
    /// goes away. Host state ends up down even if the firmware misbehaves; the last firmware
    /// error is returned in that case.
    pub async fn close(&self, id: VifId) -> Result<(), Error> {
        let (vif_type, fw_vif, ap_running) = {
            let mut tables = self.tables.lock();
            let vif = tables.vif(id)?;
            let (vif_type, fw_idx, ap_running) = (vif.vif_type, vif.fw_idx, vif.ap.is_some());
            match vif.lifecycle {
                Lifecycle::Down => return Ok(()),
                Lifecycle::Opening | Lifecycle::Closing => return Err(Error::Busy),
                Lifecycle::Up => {}
            }
            if vif_type == VifType::ApVlan {
                self.detach_vlan(&mut tables, id);
                return Ok(());
            }
            for vlan in tables.vifs.vlans_of(id) {
                if tables.vifs.get(vlan).map_or(false, |vif| vif.is_up()) {
                    self.detach_vlan(&mut tables, vlan);
                }
            }
            tables.vif_mut(id)?.lifecycle = Lifecycle::Closing;
            (vif_type, fw_idx, ap_running)
        };
        info!("closing {}", id);

        if let Some(fw_vif) = fw_vif {
            if vif_type.is_station_like() {
                self.teardown_link(id, fw_vif).await;
            }
            if ap_running {
                if let Err(e) = self.command(FwRequest::ApStop { fw_vif }).await {
                    warn!("{} stop BSS during close failed: {}", id, e);
                }
            }
        }

        {
            let mut tables = self.tables.lock();
            self.abort_scan(&mut tables, id);
            self.drop_bss(&mut tables, id);
            tables.txq.vif_queue_deinit(id);
        }

        let result = match fw_vif {
            Some(fw_vif) => self.remove_fw_instance(fw_vif).await,
            None => Ok(()),
        };

        let mut tables = self.tables.lock();
        if let Ok(vif) = tables.vif_mut(id) {
            vif.fw_idx = None;
            vif.ap_pending = false;
            vif.lifecycle = Lifecycle::Down;
        }
        info!("{} down", id);
        result
    }

    /// Bounded retry of the firmware interface removal.
    async fn remove_fw_instance(&self, fw_vif: u8) -> Result<(), Error> {
        let attempts = self.config.teardown_retries + 1;
        let mut last = Ok(());
        for attempt in 1..=attempts {
            match self.command(FwRequest::RemoveIf { fw_vif }).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("removing firmware instance {} ({}/{}): {}", fw_vif, attempt, attempts, e);
                    last = Err(e);
                }
            }
        }
        error!("giving up on firmware instance {}", fw_vif);
        last
    }

    /// Drives the connection to Disconnected, issuing a disconnect from Connected and waiting
    /// out commands other callers have in flight. Gives up after the configured number of
    /// retries and forces the state.
    /// A Connecting link is waited on rather than disconnected, since a disconnect is only ever
    /// issued from Connected; an attempt still in flight when teardown gives up goes stale.
    async fn teardown_link(&self, id: VifId, fw_vif: u8) {
        let attempts = self.config.teardown_retries + 1;
        for attempt in 1..=attempts {
            let in_flight = {
                let mut tables = self.tables.lock();
                let client = match client_mut(&mut tables, id) {
                    Some(client) => client,
                    None => return,
                };
                match client.state() {
                    ConnState::Disconnected => return,
                    ConnState::Connected => match client.begin_disconnect() {
                        Ok(()) => None,
                        Err(_) => return,
                    },
                    ConnState::Connecting | ConnState::Disconnecting => Some(client.wait_terminal()),
                }
            };

            match in_flight {
                None => {
                    let reason = REASON_DEAUTH_LEAVING;
                    let result = self.command(FwRequest::Disconnect { fw_vif, reason }).await;
                    let mut tables = self.tables.lock();
                    let confirmed = result.is_ok();
                    let completed =
                        client_mut(&mut tables, id).map_or(false, |c| c.complete_disconnect(confirmed));
                    match result {
                        Ok(_) => {
                            if completed {
                                self.finish_disconnect(&mut tables, id, reason, true);
                            }
                            return;
                        }
                        Err(e) => warn!("{} teardown disconnect ({}/{}): {}", id, attempt, attempts, e),
                    }
                }
                Some(terminal) => {
                    let timeout = self.timer.wait(self.config.cmd_timeout());
                    if let Either::Right(_) = future::select(terminal, timeout).await {
                        warn!("{} link still busy during teardown ({}/{})", id, attempt, attempts);
                    }
                }
            }
        }

        let mut tables = self.tables.lock();
        let forced = match client_mut(&mut tables, id) {
            Some(client) if client.state() != ConnState::Disconnected => {
                client.force_disconnected();
                true
            }
            _ => false,
        };
        if forced {
            error!("{} link forced down after {} attempts", id, attempts);
            self.finish_disconnect(&mut tables, id, REASON_DEAUTH_LEAVING, true);
        }
    }

    fn finish_disconnect(&self, tables: &mut Tables, id: VifId, reason: u16, locally_generated: bool) {
        drop_link(tables, id);
        info!("{} disconnected, reason {}", id, reason);
        self.events.send(StackEvent::Disconnected { vif: id, reason, locally_generated });
    }

    fn abort_scan(&self, tables: &mut Tables, id: VifId) {
        if let Some(vif) = tables.vifs.get_mut(id) {
            if vif.scanning {
                vif.scanning = false;
                self.events.send(StackEvent::ScanDone { vif: id, aborted: true });
            }
        }
    }

    /// Removes every peer of the interface and returns its channel lease.
    fn drop_bss(&self, tables: &mut Tables, id: VifId) {
        for sta in tables.stations_of(id) {
            if let Some(station) = tables.release_station(sta) {
                self.events.send(StackEvent::StationRemoved { vif: id, sta, mac: station.mac });
            }
        }
        if let Some(client) = client_mut(tables, id) {
            client.ap = None;
            client.bssid = None;
        }
        let _ = tables.unlink_vif(id);
        for vlan in tables.vifs.vlans_of(id) {
            tables.txq.bind_vif_chanctx(vlan, None);
        }
        let radar = tables.vifs.get_mut(id).and_then(|vif| vif.ap.take()).map_or(false, |ap| ap.radar);
        if radar {
            tables.txq.disable_radar();
        }
    }

    /// Frees the slot of an interface that is already down.
    fn remove_vif(&self, tables: &mut Tables, id: VifId) {
        let _ = tables.unlink_vif(id);
        for sta in tables.stations_of(id) {
            let _ = tables.release_station(sta);
        }
        tables.txq.vif_queue_deinit(id);
        if tables.vifs.remove(id).is_some() {
            info!("removed iface #{}", id.0);
        }
    }

    /// Closes the interface if needed and frees its slot. AP-VLANs of an AP go with it.
    pub async fn del_interface(&self, id: VifId) -> Result<(), Error> {
        {
            let tables = self.tables.lock();
            match tables.vif(id)?.lifecycle {
                Lifecycle::Opening | Lifecycle::Closing => return Err(Error::Busy),
                Lifecycle::Up | Lifecycle::Down => {}
            }
        }
        let result = self.close(id).await;
        if let Err(Error::Busy) = result {
            return result;
        }
        let mut tables = self.tables.lock();
        for vlan in tables.vifs.vlans_of(id) {
            if tables.vifs.get(vlan).map_or(false, |vif| vif.is_up()) {
                self.detach_vlan(&mut tables, vlan);
            }
            self.remove_vif(&mut tables, vlan);
        }
        self.remove_vif(&mut tables, id);
        result
    }

    /// Connects a station-like interface. A connect on a live link roams.
    pub async fn connect(&self, id: VifId, params: ConnectParams) -> Result<(), Error> {
        let bssid = params.bssid;
        if is_multicast(&bssid) {
            return Err(Error::InvalidArgs("BSSID must be unicast"));
        }
        let (fw_vif, ticket) = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "connect", VifType::is_station_like)?;
            let client = client_mut(&mut tables, id).ok_or(Error::NoSuchVif)?;
            (fw_vif, client.begin_connect()?)
        };
        info!(
            "{} {} to {}",
            id,
            if ticket.roaming { "roaming" } else { "connecting" },
            bssid.to_mac_str()
        );

        let req = FwRequest::Connect { fw_vif, bssid, ssid: params.ssid, chandef: params.chandef };
        let result = self.request(req).await;

        let (outcome, undo) = {
            let mut tables = self.tables.lock();
            self.apply_connect(&mut tables, id, &ticket, bssid, result)
        };
        if undo {
            let req = FwRequest::Disconnect { fw_vif, reason: REASON_DEAUTH_LEAVING };
            if let Err(e) = self.request(req).await {
                warn!("{} could not undo firmware connection: {}", id, e);
            }
        }
        outcome
    }

    /// Applies a connect confirmation. The flag asks the caller to disconnect a link the
    /// firmware established but the host could not track.
    fn apply_connect(
        &self,
        tables: &mut Tables,
        id: VifId,
        ticket: &ConnectTicket,
        bssid: MacAddr,
        result: Result<FwConfirm, Error>,
    ) -> (Result<(), Error>, bool) {
        let cfm = match result {
            Ok(cfm) => cfm,
            Err(e) => {
                match client_mut(tables, id).map(|client| client.abort_connect(ticket)) {
                    Some(Ok(())) => {}
                    _ => return (Err(Error::Canceled), false),
                }
                self.report_connect(id, ticket, Some(&e));
                return (Err(e), false);
            }
        };
        let link = match cfm {
            FwConfirm::Connect { status, link: Some(link) } if status.is_ok() => link,
            FwConfirm::Connect { status, .. } if !status.is_ok() => {
                let e = Error::Rejected { cmd: CmdId::Connect, status };
                return self.fail_connect(tables, id, ticket, e, false);
            }
            _ => return self.fail_connect(tables, id, ticket, unexpected(CmdId::Connect), false),
        };
        if !client_mut(tables, id).map_or(false, |client| client.is_current(ticket)) {
            return (Err(Error::Canceled), false);
        }

        let old_ap = client_mut(tables, id).and_then(|client| client.ap.take());
        if let Some(old_ap) = old_ap {
            let _ = tables.release_station(old_ap);
        }
        let params = StationParams { aid: link.aid, qos: link.qos, vlan: None };
        let sta = match tables.add_station(id, bssid, params) {
            Ok(sta) => sta,
            // Teardown took the interface down while the connect was in flight.
            Err(Error::VifDown) => return self.fail_connect(tables, id, ticket, Error::Canceled, true),
            Err(e) => return self.fail_connect(tables, id, ticket, e, true),
        };
        if let Some(station) = tables.stations.get_mut(sta) {
            station.fw_sta = Some(link.ap_fw_sta);
            station.authorized = true;
        }
        if let Err(e) = tables.link_vif(id, ChanCtxId(link.chanctx), Some(link.chandef)) {
            let _ = tables.release_station(sta);
            return self.fail_connect(tables, id, ticket, e, true);
        }
        if let Some(client) = client_mut(tables, id) {
            let _ = client.complete_connect(ticket, true);
            client.ap = Some(sta);
            client.bssid = Some(bssid);
        }
        info!("{} connected to {} on chanctx #{}", id, bssid.to_mac_str(), link.chanctx);
        self.report_connect(id, ticket, None);
        (Ok(()), false)
    }

    fn fail_connect(
        &self,
        tables: &mut Tables,
        id: VifId,
        ticket: &ConnectTicket,
        e: Error,
        undo: bool,
    ) -> (Result<(), Error>, bool) {
        match client_mut(tables, id).map(|client| client.complete_connect(ticket, false)) {
            Some(Ok(())) => {}
            _ => return (Err(Error::Canceled), false),
        }
        drop_link(tables, id);
        error!("{} connect failed: {}", id, e);
        self.report_connect(id, ticket, Some(&e));
        (Err(e), undo)
    }

    fn report_connect(&self, id: VifId, ticket: &ConnectTicket, failure: Option<&Error>) {
        let result = match failure {
            None => ConnectResult::Success,
            Some(e) => ConnectResult::Failed(e.kind()),
        };
        self.events.send(StackEvent::ConnectResult { vif: id, result, roamed: ticket.roaming });
    }

    /// Disconnects a connected station-like interface.
    pub async fn disconnect(&self, id: VifId, reason: u16) -> Result<(), Error> {
        let fw_vif = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "disconnect", VifType::is_station_like)?;
            client_mut(&mut tables, id).ok_or(Error::NoSuchVif)?.begin_disconnect()?;
            fw_vif
        };
        info!("{} disconnecting, reason {}", id, reason);

        let attempts = self.config.teardown_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.command(FwRequest::Disconnect { fw_vif, reason }).await;
            let mut tables = self.tables.lock();
            let client = client_mut(&mut tables, id).ok_or(Error::Canceled)?;
            match result {
                Ok(_) => {
                    if client.complete_disconnect(true) {
                        self.finish_disconnect(&mut tables, id, reason, true);
                    }
                    return Ok(());
                }
                Err(e) if !e.is_transport() => {
                    client.complete_disconnect(false);
                    return Err(e);
                }
                Err(e) => {
                    if client.state() != ConnState::Disconnecting {
                        return Ok(());
                    }
                    if attempt >= attempts {
                        client.force_disconnected();
                        self.finish_disconnect(&mut tables, id, reason, true);
                        return Err(e);
                    }
                    warn!("{} disconnect ({}/{}): {}", id, attempt, attempts, e);
                }
            }
        }
    }

    /// Starts a BSS on an AP-like interface and links it to the context the firmware picked.
    pub async fn start_ap(&self, id: VifId, settings: ApSettings) -> Result<(), Error> {
        if !settings.chandef.is_valid() {
            return Err(Error::InvalidArgs("invalid channel definition"));
        }
        let fw_vif = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "start_ap", VifType::hosts_peers)?;
            let vif = tables.vif_mut(id)?;
            if vif.ap.is_some() || vif.ap_pending {
                return Err(Error::Busy);
            }
            vif.ap_pending = true;
            fw_vif
        };

        let req = FwRequest::ApStart {
            fw_vif,
            chandef: settings.chandef,
            beacon_interval: settings.beacon_interval,
        };
        let result = self.command(req).await;

        let linked = {
            let mut tables = self.tables.lock();
            if let Ok(vif) = tables.vif_mut(id) {
                vif.ap_pending = false;
            }
            let (chanctx, bcmc_fw_sta) = match result? {
                FwConfirm::ApStart { chanctx, bcmc_fw_sta, .. } => (ChanCtxId(chanctx), bcmc_fw_sta),
                _ => return Err(unexpected(CmdId::ApStart)),
            };
            let ap = ApState { chandef: settings.chandef, bcmc_fw_sta, radar: settings.radar_detect };
            self.apply_ap_start(&mut tables, id, chanctx, ap)
        };

        // The firmware runs a BSS the host could not record; stop it again.
        if let Err(e) = linked {
            error!("{} BSS started but could not be tracked: {}", id, e);
            if let Err(stop_err) = self.request(FwRequest::ApStop { fw_vif }).await {
                warn!("{} could not undo BSS start: {}", id, stop_err);
            }
            return Err(match e {
                Error::VifDown | Error::NoSuchVif => Error::Canceled,
                e => e,
            });
        }
        info!("{} BSS started on {}", id, settings.chandef);
        Ok(())
    }

    fn apply_ap_start(
        &self,
        tables: &mut Tables,
        id: VifId,
        chanctx: ChanCtxId,
        ap: ApState,
    ) -> Result<(), Error> {
        tables.link_vif(id, chanctx, Some(ap.chandef))?;
        for vlan in tables.vifs.vlans_of(id) {
            tables.txq.bind_vif_chanctx(vlan, Some(chanctx));
        }
        if ap.radar {
            tables.txq.enable_radar();
        }
        tables.vif_mut(id)?.ap = Some(ap);
        debug!("{} BSS on {}", id, chanctx);
        Ok(())
    }

    /// Stops the BSS. Its stations are removed and the channel context unlinked.
    pub async fn stop_ap(&self, id: VifId) -> Result<(), Error> {
        let fw_vif = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "stop_ap", VifType::hosts_peers)?;
            let vif = tables.vif_mut(id)?;
            if vif.ap_pending {
                return Err(Error::Busy);
            }
            if vif.ap.is_none() {
                return Err(Error::InvalidArgs("BSS not started"));
            }
            vif.ap_pending = true;
            fw_vif
        };

        let result = self.command(FwRequest::ApStop { fw_vif }).await;

        let mut tables = self.tables.lock();
        if let Ok(vif) = tables.vif_mut(id) {
            vif.ap_pending = false;
        }
        result?;
        self.drop_bss(&mut tables, id);
        info!("{} BSS stopped", id);
        Ok(())
    }

    /// Registers an associated peer. The record is valid, with a running queue, while the
    /// firmware registration is in flight.
    pub async fn add_station(
        &self,
        id: VifId,
        mac: MacAddr,
        params: StationParams,
    ) -> Result<StaId, Error> {
        if is_multicast(&mac) {
            return Err(Error::InvalidArgs("station address must be unicast"));
        }
        let (fw_vif, sta) = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "add_station", VifType::hosts_peers)?;
            if tables.vif(id)?.ap.is_none() {
                return Err(Error::InvalidArgs("BSS not started"));
            }
            (fw_vif, tables.add_station(id, mac, params)?)
        };

        let req = FwRequest::StaAdd { fw_vif, mac, aid: params.aid, qos: params.qos };
        let result = self.command(req).await;

        let mut tables = self.tables.lock();
        let still_ours =
            tables.stations.get(sta).map_or(false, |station| station.vif == id && station.mac == mac);
        match result {
            Err(e) => {
                if still_ours {
                    let _ = tables.release_station(sta);
                }
                Err(e)
            }
            Ok(_) if !still_ours => Err(Error::Canceled),
            Ok(FwConfirm::StaAdd { fw_sta, .. }) => {
                if let Some(station) = tables.stations.get_mut(sta) {
                    station.fw_sta = Some(fw_sta);
                }
                self.events.send(StackEvent::StationAdded { vif: id, sta, mac });
                Ok(sta)
            }
            Ok(_) => {
                let _ = tables.release_station(sta);
                Err(unexpected(CmdId::StaAdd))
            }
        }
    }

    /// Forgets a peer. The host record goes first; the firmware is told afterwards.
    pub async fn del_station(&self, id: VifId, mac: MacAddr) -> Result<(), Error> {
        let fw_sta = {
            let mut tables = self.tables.lock();
            let vif_type = tables.vif(id)?.vif_type;
            if !vif_type.hosts_peers() {
                return Err(Error::WrongVifType { op: "del_station", vif_type });
            }
            let sta = tables.stations.retrieve_on(id, &mac).ok_or(Error::NoSuchStation)?;
            let station = tables.release_station(sta).ok_or(Error::NoSuchStation)?;
            self.events.send(StackEvent::StationRemoved { vif: id, sta, mac });
            station.fw_sta
        };
        match fw_sta {
            Some(fw_sta) => self.command(FwRequest::StaDel { fw_sta }).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Steers a peer to or from an AP-VLAN and toggles its port authorization.
    pub async fn change_station(
        &self,
        id: VifId,
        mac: MacAddr,
        change: StationChange,
    ) -> Result<(), Error> {
        let port = {
            let mut tables = self.tables.lock();
            let _ = up_vif(&tables, id, "change_station", VifType::hosts_peers)?;
            let sta = tables.stations.retrieve_on(id, &mac).ok_or(Error::NoSuchStation)?;
            if let Some(vlan) = change.vlan {
                tables.set_station_vlan(sta, vlan)?;
            }
            match change.authorized {
                Some(authorized) => {
                    let station = tables.stations.get(sta).ok_or(Error::NoSuchStation)?;
                    if station.authorized == authorized {
                        None
                    } else {
                        let fw_sta = station
                            .fw_sta
                            .ok_or(Error::InvalidArgs("station not registered with firmware"))?;
                        Some((sta, fw_sta, authorized))
                    }
                }
                None => None,
            }
        };

        if let Some((sta, fw_sta, authorized)) = port {
            self.command(FwRequest::PortControl { fw_sta, authorized }).await?;
            let mut tables = self.tables.lock();
            if let Some(station) = tables.stations.get_mut(sta).filter(|station| station.mac == mac) {
                station.authorized = authorized;
            }
        }
        Ok(())
    }

    /// Tunes the up monitor interface.
    pub async fn set_monitor_channel(&self, chandef: Chandef) -> Result<(), Error> {
        if !chandef.is_valid() {
            return Err(Error::InvalidArgs("invalid channel definition"));
        }
        let id = {
            let tables = self.tables.lock();
            let monitor =
                tables.vifs.iter().find(|vif| vif.vif_type == VifType::Monitor && vif.is_up());
            monitor.map(|vif| vif.id).ok_or(Error::NoSuchVif)?
        };

        let chanctx = match self.command(FwRequest::SetChannel { chandef }).await? {
            FwConfirm::SetChannel { chanctx, .. } => ChanCtxId(chanctx),
            _ => return Err(unexpected(CmdId::SetChannel)),
        };

        let mut tables = self.tables.lock();
        tables.link_vif(id, chanctx, Some(chandef))?;
        info!("{} monitoring {} ({})", id, chandef, chanctx);
        Ok(())
    }

    /// Starts a scan. Completion arrives as a scan-done indication.
    pub async fn start_scan(&self, id: VifId) -> Result<(), Error> {
        let fw_vif = {
            let mut tables = self.tables.lock();
            let fw_vif = up_vif(&tables, id, "start_scan", |vif_type| {
                !matches!(vif_type, VifType::Monitor | VifType::ApVlan)
            })?;
            let vif = tables.vif_mut(id)?;
            if vif.scanning {
                return Err(Error::Busy);
            }
            vif.scanning = true;
            fw_vif
        };
        if let Err(e) = self.command(FwRequest::ScanStart { fw_vif }).await {
            if let Ok(vif) = self.tables.lock().vif_mut(id) {
                vif.scanning = false;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Applies an unsolicited firmware event. Never blocks beyond the table lock.
    pub fn handle_indication(&self, ind: FwIndication) {
        let mut tables = self.tables.lock();
        match ind {
            FwIndication::PsChange { fw_sta, ps_on } => {
                match tables.stations.by_fw_sta(fw_sta) {
                    Some(sta) => {
                        debug!("{} power save {}", sta, if ps_on { "on" } else { "off" });
                        let _ = tables.set_power_save(sta, ps_on);
                    }
                    None => debug!("power save change for unknown firmware station {}", fw_sta),
                }
            }
            FwIndication::ChannelSwitch { chanctx } => {
                let chanctx = ChanCtxId(chanctx);
                match tables.switch_chanctx(chanctx) {
                    Ok(chandef) => {
                        info!("switched to {}", chanctx);
                        self.events.send(StackEvent::ChannelSwitch { chanctx, chandef });
                    }
                    Err(e) => warn!("ignoring channel switch: {}", e),
                }
            }
            FwIndication::Disconnected { fw_vif, reason } => {
                let id = match tables.vifs.by_fw_idx(fw_vif) {
                    Some(id) => id,
                    None => {
                        warn!("disconnect for unknown firmware instance {}", fw_vif);
                        return;
                    }
                };
                if client_mut(&mut tables, id).map_or(false, ClientSm::on_link_lost) {
                    self.finish_disconnect(&mut tables, id, reason, false);
                }
            }
            FwIndication::ScanDone { fw_vif, aborted } => {
                let id = match tables.vifs.by_fw_idx(fw_vif) {
                    Some(id) => id,
                    None => {
                        debug!("scan done for unknown firmware instance {}", fw_vif);
                        return;
                    }
                };
                if let Some(vif) = tables.vifs.get_mut(id).filter(|vif| vif.scanning) {
                    vif.scanning = false;
                    self.events.send(StackEvent::ScanDone { vif: id, aborted });
                }
            }
        }
    }

    /// Deletes every interface, newest first.
    pub async fn shutdown(&self) {
        let ids: Vec<VifId> = self.tables.lock().vifs.iter().map(|vif| vif.id).collect();
        info!("shutting down {} interfaces", ids.len());
        for id in ids.into_iter().rev() {
            match self.del_interface(id).await {
                Ok(()) | Err(Error::NoSuchVif) => {}
                Err(e) => warn!("{} removed with error: {}", id, e),
            }
        }
    }

    pub fn vif_info(&self, id: VifId) -> Option<VifInfo> {
        self.tables.lock().vifs.get(id).map(|vif| vif.info())
    }

    pub fn vifs(&self) -> Vec<VifInfo> {
        self.tables.lock().vifs.iter().map(|vif| vif.info()).collect()
    }

    pub fn station(&self, mac: &MacAddr) -> Option<(StaId, Station)> {
        let tables = self.tables.lock();
        let sta = tables.stations.retrieve(mac)?;
        tables.stations.get(sta).map(|station| (sta, station.clone()))
    }

    pub fn station_count(&self) -> usize {
        self.tables.lock().stations.occupancy()
    }

    pub fn chanctx_count(&self, ctx: ChanCtxId) -> Option<u32> {
        self.tables.lock().chanctx.count(ctx)
    }

    pub fn chanctx_def(&self, ctx: ChanCtxId) -> Option<Chandef> {
        self.tables.lock().chanctx.chandef(ctx)
    }

    pub fn active_chanctx(&self) -> Option<ChanCtxId> {
        self.tables.lock().chanctx.active()
    }

    pub fn vif_txq(&self, id: VifId) -> Option<TxqHandle> {
        self.tables.lock().txq.vif_handle(id)
    }

    pub fn station_txq(&self, sta: StaId) -> Option<TxqHandle> {
        self.tables.lock().txq.station_handle(sta)
    }

    pub fn radar_detection_enabled(&self) -> bool {
        self.tables.lock().txq.radar_enabled()
    }
}
