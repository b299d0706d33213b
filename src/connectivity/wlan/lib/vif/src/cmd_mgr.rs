// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pairs firmware confirmations with the requests that caused them.
//!
//! The firmware answers strictly in order, so a confirmation always belongs to the oldest
//! outstanding request with the same command id. A requester that stopped waiting keeps its
//! place in the queue until its confirmation shows up, or until the queue is full and its slot
//! is needed by a live request.

use {
    crate::{
        error::GatewayError,
        fw::{CmdId, FirmwareGateway, FwConfirm, FwRequest},
    },
    futures::{
        channel::{mpsc, oneshot},
        future::{self, BoxFuture},
        FutureExt,
    },
    log::{debug, warn},
    parking_lot::Mutex,
    std::{collections::VecDeque, sync::Arc},
};

#[derive(Debug)]
struct Pending {
    id: CmdId,
    responder: oneshot::Sender<FwConfirm>,
}

/// Evicts abandoned requests, oldest first, until a slot is free. Only live requesters count
/// against the capacity; an abandoned entry keeps its place until room is needed.
fn prune_abandoned(queue: &mut VecDeque<Pending>, capacity: usize) {
    while queue.len() >= capacity {
        match queue.iter().position(|p| p.responder.is_canceled()) {
            Some(pos) => {
                if let Some(pending) = queue.remove(pos) {
                    debug!("cmd_mgr: evicting abandoned {:?}", pending.id);
                }
            }
            None => return,
        }
    }
}

#[derive(Debug)]
pub struct CmdMgr {
    capacity: usize,
    queue: Mutex<VecDeque<Pending>>,
}

impl CmdMgr {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, queue: Mutex::new(VecDeque::new()) }
    }

    /// Registers `req` and hands it to `transmit` while holding the queue lock, so the queue
    /// order always equals the transmit order.
    pub fn submit<F>(
        &self,
        req: FwRequest,
        transmit: F,
    ) -> Result<oneshot::Receiver<FwConfirm>, GatewayError>
    where
        F: FnOnce(FwRequest) -> Result<(), GatewayError>,
    {
        let id = req.id();
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            prune_abandoned(&mut queue, self.capacity);
        }
        if queue.len() >= self.capacity {
            warn!("cmd_mgr: no free slot for {:?}", id);
            return Err(GatewayError::QueueFull);
        }
        transmit(req)?;
        let (responder, receiver) = oneshot::channel();
        queue.push_back(Pending { id, responder });
        debug!("cmd_mgr: {:?} queued, {} pending", id, queue.len());
        Ok(receiver)
    }

    /// Completes the oldest request waiting for `cfm`. Returns false if none was waiting.
    pub fn on_confirm(&self, cfm: FwConfirm) -> bool {
        let id = cfm.id();
        let pending = {
            let mut queue = self.queue.lock();
            match queue.iter().position(|p| p.id == id) {
                Some(pos) => queue.remove(pos),
                None => None,
            }
        };
        match pending {
            Some(pending) => {
                if pending.responder.send(cfm).is_err() {
                    debug!("cmd_mgr: requester of {:?} gave up", id);
                }
                true
            }
            None => {
                warn!("cmd_mgr: unexpected {:?} confirmation", id);
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Fails every outstanding request, e.g. when the firmware link went away.
    pub fn abort_all(&self) {
        let aborted: Vec<_> = self.queue.lock().drain(..).collect();
        if !aborted.is_empty() {
            warn!("cmd_mgr: aborting {} pending commands", aborted.len());
        }
    }
}

/// `FirmwareGateway` over a command manager and an outbound message channel. The transport
/// drains the receiver and feeds confirmations back through `CmdMgr::on_confirm`.
#[derive(Debug)]
pub struct CmdGateway {
    mgr: Arc<CmdMgr>,
    outbound: mpsc::UnboundedSender<FwRequest>,
}

impl CmdGateway {
    pub fn new(capacity: usize) -> (Self, Arc<CmdMgr>, mpsc::UnboundedReceiver<FwRequest>) {
        let mgr = Arc::new(CmdMgr::new(capacity));
        let (outbound, receiver) = mpsc::unbounded();
        (Self { mgr: Arc::clone(&mgr), outbound }, mgr, receiver)
    }
}

impl FirmwareGateway for CmdGateway {
    fn send(&self, req: FwRequest) -> BoxFuture<'static, Result<FwConfirm, GatewayError>> {
        let outbound = &self.outbound;
        let submitted =
            self.mgr.submit(req, |req| outbound.unbounded_send(req).map_err(|_| GatewayError::Closed));
        match submitted {
            Ok(receiver) => receiver.map(|res| res.map_err(|_| GatewayError::Closed)).boxed(),
            Err(e) => future::err(e).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::fw::FwStatus,
        assert_matches::assert_matches,
        futures::{executor::block_on, StreamExt},
    };

    fn ok_transmit(_: FwRequest) -> Result<(), GatewayError> {
        Ok(())
    }

    #[test]
    fn confirm_completes_oldest_matching_request() {
        let mgr = CmdMgr::new(8);
        let first = mgr.submit(FwRequest::StaDel { fw_sta: 1 }, ok_transmit).expect("first");
        let other = mgr.submit(FwRequest::ApStop { fw_vif: 0 }, ok_transmit).expect("other");
        let second = mgr.submit(FwRequest::StaDel { fw_sta: 2 }, ok_transmit).expect("second");

        assert!(mgr.on_confirm(FwConfirm::StaDel { status: FwStatus::OK }));
        assert!(mgr.on_confirm(FwConfirm::StaDel { status: FwStatus::FAIL }));
        assert_eq!(block_on(first), Ok(FwConfirm::StaDel { status: FwStatus::OK }));
        assert_eq!(block_on(second), Ok(FwConfirm::StaDel { status: FwStatus::FAIL }));
        assert_eq!(mgr.pending(), 1);
        drop(other);
    }

    #[test]
    fn unexpected_confirmation() {
        let mgr = CmdMgr::new(8);
        assert!(!mgr.on_confirm(FwConfirm::RemoveIf { status: FwStatus::OK }));
    }

    #[test]
    fn abandoned_request_keeps_its_place() {
        let mgr = CmdMgr::new(8);
        let abandoned = mgr.submit(FwRequest::ScanStart { fw_vif: 0 }, ok_transmit).expect("a");
        drop(abandoned);
        let waiting = mgr.submit(FwRequest::ScanStart { fw_vif: 0 }, ok_transmit).expect("b");

        assert!(mgr.on_confirm(FwConfirm::ScanStart { status: FwStatus::FAIL }));
        assert_eq!(mgr.pending(), 1);
        assert!(mgr.on_confirm(FwConfirm::ScanStart { status: FwStatus::OK }));
        assert_eq!(block_on(waiting), Ok(FwConfirm::ScanStart { status: FwStatus::OK }));
    }

    #[test]
    fn capacity_is_bounded() {
        let mgr = CmdMgr::new(1);
        let _held = mgr.submit(FwRequest::ApStop { fw_vif: 0 }, ok_transmit).expect("first");
        assert_matches!(
            mgr.submit(FwRequest::ApStop { fw_vif: 1 }, ok_transmit),
            Err(GatewayError::QueueFull)
        );
    }

    #[test]
    fn abandoned_requests_free_capacity() {
        let mgr = CmdMgr::new(2);
        let live = mgr.submit(FwRequest::ApStop { fw_vif: 0 }, ok_transmit).expect("live");
        let abandoned = mgr.submit(FwRequest::StaDel { fw_sta: 1 }, ok_transmit).expect("abandoned");
        drop(abandoned);

        let next = mgr.submit(FwRequest::StaDel { fw_sta: 2 }, ok_transmit).expect("slot reclaimed");
        assert_eq!(mgr.pending(), 2);
        assert_matches!(
            mgr.submit(FwRequest::ScanStart { fw_vif: 0 }, ok_transmit),
            Err(GatewayError::QueueFull)
        );

        assert!(mgr.on_confirm(FwConfirm::StaDel { status: FwStatus::OK }));
        assert_eq!(block_on(next), Ok(FwConfirm::StaDel { status: FwStatus::OK }));
        assert!(mgr.on_confirm(FwConfirm::ApStop { status: FwStatus::OK }));
        assert_eq!(block_on(live), Ok(FwConfirm::ApStop { status: FwStatus::OK }));
    }

    #[test]
    fn failed_transmit_is_not_queued() {
        let mgr = CmdMgr::new(2);
        assert_matches!(
            mgr.submit(FwRequest::ApStop { fw_vif: 0 }, |_| Err(GatewayError::Closed)),
            Err(GatewayError::Closed)
        );
        assert_eq!(mgr.pending(), 0);
    }

    #[test]
    fn abort_all_fails_waiters() {
        let mgr = CmdMgr::new(2);
        let receiver = mgr.submit(FwRequest::ApStop { fw_vif: 0 }, ok_transmit).expect("submit");
        mgr.abort_all();
        assert!(block_on(receiver).is_err());
        assert_eq!(mgr.pending(), 0);
    }

    #[test]
    fn gateway_round_trip() {
        let (gateway, mgr, mut outbound) = CmdGateway::new(4);
        let fut = gateway.send(FwRequest::RemoveIf { fw_vif: 3 });
        assert_eq!(block_on(outbound.next()), Some(FwRequest::RemoveIf { fw_vif: 3 }));
        mgr.on_confirm(FwConfirm::RemoveIf { status: FwStatus::OK });
        assert_eq!(block_on(fut), Ok(FwConfirm::RemoveIf { status: FwStatus::OK }));
    }

    #[test]
    fn gateway_closed_transport() {
        let (gateway, _mgr, outbound) = CmdGateway::new(4);
        drop(outbound);
        assert_eq!(
            block_on(gateway.send(FwRequest::RemoveIf { fw_vif: 3 })),
            Err(GatewayError::Closed)
        );
    }
}
