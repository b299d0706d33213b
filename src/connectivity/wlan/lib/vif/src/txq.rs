// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Transmit-queue gating.
//!
//! Each interface and each station owns a gate: an atomic mask of reasons the queue is stopped.
//! The data path holds a `TxqHandle` and only ever performs a lock-free load; every mutation
//! happens under the table lock through `TxqCoordinator`.

use {
    crate::{channel::ChanCtxId, station::StaId, vif::VifId},
    bitflags::bitflags,
    log::debug,
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    },
};

bitflags! {
    pub struct StopReasons: u32 {
        /// Not resident on the active channel context.
        const CHAN = 1 << 0;
        /// The peer is dozing.
        const PS = 1 << 1;
        /// Queue torn down, or the owner is not yet operational.
        const INACTIVE = 1 << 2;
    }
}

#[derive(Debug, Default)]
struct TxqGate {
    stopped: AtomicU32,
}

/// Read side of a queue gate, cheap to clone into the data path.
#[derive(Clone, Debug)]
pub struct TxqHandle(Arc<TxqGate>);

impl TxqHandle {
    fn new(stopped: StopReasons) -> Self {
        Self(Arc::new(TxqGate { stopped: AtomicU32::new(stopped.bits()) }))
    }

    pub fn stop_reasons(&self) -> StopReasons {
        StopReasons::from_bits_truncate(self.0.stopped.load(Ordering::Acquire))
    }

    pub fn can_transmit(&self) -> bool {
        self.0.stopped.load(Ordering::Acquire) == 0
    }

    fn stop(&self, reasons: StopReasons) {
        self.0.stopped.fetch_or(reasons.bits(), Ordering::AcqRel);
    }

    fn start(&self, reasons: StopReasons) {
        self.0.stopped.fetch_and(!reasons.bits(), Ordering::AcqRel);
    }

    fn set(&self, reasons: StopReasons, stopped: bool) {
        if stopped {
            self.stop(reasons)
        } else {
            self.start(reasons)
        }
    }
}

/// Which queues a start/stop applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueTarget {
    All,
    /// The interface queue and the queues of every station it owns.
    Vif(VifId),
    Station(StaId),
}

#[derive(Debug)]
struct VifQueue {
    gate: TxqHandle,
    chanctx: Option<ChanCtxId>,
}

#[derive(Debug)]
struct StaQueue {
    gate: TxqHandle,
    vif: VifId,
}

#[derive(Debug, Default)]
pub struct TxqCoordinator {
    vifs: HashMap<VifId, VifQueue>,
    stations: HashMap<StaId, StaQueue>,
    active: Option<ChanCtxId>,
    radar: bool,
}

impl TxqCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn off_channel(&self, chanctx: Option<ChanCtxId>) -> bool {
        chanctx.is_none() || chanctx != self.active
    }

    pub fn vif_queue_init(&mut self, vif: VifId, stopped: StopReasons) -> TxqHandle {
        let gate = TxqHandle::new(stopped);
        self.vifs.insert(vif, VifQueue { gate: gate.clone(), chanctx: None });
        gate
    }

    /// Unbinds the interface queue. Outstanding handles observe a permanently stopped gate.
    pub fn vif_queue_deinit(&mut self, vif: VifId) {
        if let Some(queue) = self.vifs.remove(&vif) {
            queue.gate.stop(StopReasons::INACTIVE);
        }
    }

    /// Binds a station queue to its interface. The channel bit follows the interface.
    pub fn station_queue_init(&mut self, sta: StaId, vif: VifId, stopped: StopReasons) -> TxqHandle {
        let mut stopped = stopped;
        match self.vifs.get(&vif) {
            Some(queue) => {
                stopped.set(StopReasons::CHAN, queue.gate.stop_reasons().contains(StopReasons::CHAN))
            }
            None => stopped |= StopReasons::INACTIVE,
        }
        let gate = TxqHandle::new(stopped);
        self.stations.insert(sta, StaQueue { gate: gate.clone(), vif });
        gate
    }

    pub fn station_queue_deinit(&mut self, sta: StaId) {
        if let Some(queue) = self.stations.remove(&sta) {
            queue.gate.stop(StopReasons::INACTIVE);
        }
    }

    fn for_each_gate(&self, target: QueueTarget, mut f: impl FnMut(&TxqHandle)) {
        match target {
            QueueTarget::All => {
                self.vifs.values().for_each(|q| f(&q.gate));
                self.stations.values().for_each(|q| f(&q.gate));
            }
            QueueTarget::Vif(vif) => {
                if let Some(q) = self.vifs.get(&vif) {
                    f(&q.gate);
                }
                self.stations.values().filter(|q| q.vif == vif).for_each(|q| f(&q.gate));
            }
            QueueTarget::Station(sta) => {
                if let Some(q) = self.stations.get(&sta) {
                    f(&q.gate);
                }
            }
        }
    }

    pub fn stop(&mut self, target: QueueTarget, reasons: StopReasons) {
        debug!("stop {:?} for {:?}", target, reasons);
        self.for_each_gate(target, |gate| gate.stop(reasons));
    }

    pub fn start(&mut self, target: QueueTarget, reasons: StopReasons) {
        debug!("start {:?} for {:?}", target, reasons);
        self.for_each_gate(target, |gate| gate.start(reasons));
    }

    /// Records which context the interface resides on and updates its channel bit.
    pub fn bind_vif_chanctx(&mut self, vif: VifId, chanctx: Option<ChanCtxId>) {
        let off = self.off_channel(chanctx);
        if let Some(queue) = self.vifs.get_mut(&vif) {
            queue.chanctx = chanctx;
        }
        self.for_each_gate(QueueTarget::Vif(vif), |gate| gate.set(StopReasons::CHAN, off));
    }

    /// Queues bound to `ctx` lose their channel bit; every other queue gains it.
    pub fn set_active_chanctx(&mut self, ctx: ChanCtxId) {
        self.active = Some(ctx);
        let vifs: Vec<_> = self.vifs.iter().map(|(vif, q)| (*vif, q.chanctx)).collect();
        for (vif, chanctx) in vifs {
            let off = self.off_channel(chanctx);
            self.for_each_gate(QueueTarget::Vif(vif), |gate| gate.set(StopReasons::CHAN, off));
        }
    }

    pub fn active_chanctx(&self) -> Option<ChanCtxId> {
        self.active
    }

    pub fn vif_handle(&self, vif: VifId) -> Option<TxqHandle> {
        self.vifs.get(&vif).map(|q| q.gate.clone())
    }

    pub fn station_handle(&self, sta: StaId) -> Option<TxqHandle> {
        self.stations.get(&sta).map(|q| q.gate.clone())
    }

    /// Moves a station queue under another interface, e.g. when it is steered to an AP-VLAN.
    pub fn rebind_station(&mut self, sta: StaId, vif: VifId) {
        let off = self.vifs.get(&vif).map(|q| self.off_channel(q.chanctx)).unwrap_or(true);
        if let Some(queue) = self.stations.get_mut(&sta) {
            queue.vif = vif;
            queue.gate.set(StopReasons::CHAN, off);
        }
    }

    pub fn enable_radar(&mut self) {
        self.radar = true;
    }

    pub fn disable_radar(&mut self) {
        if self.radar {
            debug!("radar detection disabled");
        }
        self.radar = false;
    }

    pub fn radar_enabled(&self) -> bool {
        self.radar
    }
}
