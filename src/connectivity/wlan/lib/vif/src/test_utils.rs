// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        channel::{Cbw, Chandef},
        error::GatewayError,
        fw::{CmdId, FirmwareGateway, FwConfirm, FwRequest, FwStatus, LinkInfo},
        timer::Timer,
    },
    futures::{
        channel::oneshot,
        future::{self, BoxFuture},
        task::{noop_waker, Context, Poll},
        Future, FutureExt,
    },
    parking_lot::Mutex,
    std::{
        collections::{HashMap, VecDeque},
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
};

/// Polls `fut` once. Everything the fakes complete synchronously is driven to completion, so
/// `Poll::Pending` means the future waits on a held confirmation or a timer.
pub fn run_until_stalled<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    Pin::new(fut).poll(&mut cx)
}

pub fn fake_chandef() -> Chandef {
    Chandef::new(2412, Cbw::Cbw20)
}

/// How the fake answers the next request with a given command id.
#[derive(Clone, Debug)]
pub enum Reply {
    /// The usual confirmation, carrying `status`.
    Status(FwStatus),
    Confirm(FwConfirm),
    Error(GatewayError),
    /// No answer until the test calls `FakeGateway::release`.
    Hold,
}

type Responder = oneshot::Sender<Result<FwConfirm, GatewayError>>;

#[derive(Default)]
struct FakeState {
    requests: Vec<FwRequest>,
    scripted: HashMap<CmdId, VecDeque<Reply>>,
    held: VecDeque<(FwRequest, Responder)>,
    next_inst: u8,
    next_sta: u8,
    chanctx: u8,
}

/// Records every request. Answers with success unless a reply was scripted for the command.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, cmd: CmdId, reply: Reply) {
        self.state.lock().scripted.entry(cmd).or_default().push_back(reply);
    }

    /// Context index reported by successful connect, start-AP and set-channel confirmations.
    pub fn set_chanctx(&self, chanctx: u8) {
        self.state.lock().chanctx = chanctx;
    }

    pub fn requests(&self) -> Vec<FwRequest> {
        self.state.lock().requests.clone()
    }

    pub fn count(&self, cmd: CmdId) -> usize {
        self.state.lock().requests.iter().filter(|req| req.id() == cmd).count()
    }

    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Answers the oldest held request with `cmd`.
    pub fn release(&self, cmd: CmdId, reply: Reply) {
        let mut state = self.state.lock();
        let pos = state.held.iter().position(|(req, _)| req.id() == cmd).expect("no held request");
        let (req, responder) = state.held.remove(pos).expect("held request");
        let result = match reply {
            Reply::Status(status) => Ok(confirm_for(&mut state, &req, status)),
            Reply::Confirm(cfm) => Ok(cfm),
            Reply::Error(e) => Err(e),
            Reply::Hold => panic!("cannot release with Hold"),
        };
        let _ = responder.send(result);
    }
}

fn confirm_for(state: &mut FakeState, req: &FwRequest, status: FwStatus) -> FwConfirm {
    match req {
        FwRequest::AddIf { .. } => {
            let inst_nbr = state.next_inst;
            state.next_inst += 1;
            FwConfirm::AddIf { status, inst_nbr }
        }
        FwRequest::RemoveIf { .. } => FwConfirm::RemoveIf { status },
        FwRequest::Connect { chandef, .. } => {
            let link = if status.is_ok() {
                let ap_fw_sta = state.next_sta;
                state.next_sta += 1;
                Some(LinkInfo {
                    ap_fw_sta,
                    aid: 1,
                    chanctx: state.chanctx,
                    chandef: chandef.unwrap_or_else(fake_chandef),
                    qos: true,
                })
            } else {
                None
            };
            FwConfirm::Connect { status, link }
        }
        FwRequest::Disconnect { .. } => FwConfirm::Disconnect { status },
        FwRequest::StaAdd { .. } => {
            let fw_sta = state.next_sta;
            state.next_sta += 1;
            FwConfirm::StaAdd { status, fw_sta }
        }
        FwRequest::StaDel { .. } => FwConfirm::StaDel { status },
        FwRequest::ApStart { .. } => {
            let bcmc_fw_sta = state.next_sta;
            state.next_sta += 1;
            FwConfirm::ApStart { status, chanctx: state.chanctx, bcmc_fw_sta }
        }
        FwRequest::ApStop { .. } => FwConfirm::ApStop { status },
        FwRequest::SetChannel { .. } => FwConfirm::SetChannel { status, chanctx: state.chanctx },
        FwRequest::ScanStart { .. } => FwConfirm::ScanStart { status },
        FwRequest::PortControl { .. } => FwConfirm::PortControl { status },
    }
}

impl FirmwareGateway for FakeGateway {
    fn send(&self, req: FwRequest) -> BoxFuture<'static, Result<FwConfirm, GatewayError>> {
        let mut state = self.state.lock();
        state.requests.push(req.clone());
        let reply = state
            .scripted
            .get_mut(&req.id())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Status(FwStatus::OK));
        match reply {
            Reply::Status(status) => future::ok(confirm_for(&mut state, &req, status)).boxed(),
            Reply::Confirm(cfm) => future::ok(cfm).boxed(),
            Reply::Error(e) => future::err(e).boxed(),
            Reply::Hold => {
                let (responder, receiver) = oneshot::channel();
                state.held.push_back((req, responder));
                receiver.map(|res| res.unwrap_or(Err(GatewayError::Closed))).boxed()
            }
        }
    }
}

/// Counts the waits it hands out. Wait number `k` (from zero) fires at once if `k >= fire_from`
/// and never otherwise.
#[derive(Clone, Debug)]
pub struct FakeTimer {
    fire_from: usize,
    issued: Arc<AtomicUsize>,
}

impl FakeTimer {
    pub fn fire_from(fire_from: usize) -> Self {
        Self { fire_from, issued: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn never() -> Self {
        Self::fire_from(usize::MAX)
    }

    pub fn immediate() -> Self {
        Self::fire_from(0)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

impl Timer for FakeTimer {
    fn wait(&self, _delay: Duration) -> BoxFuture<'static, ()> {
        if self.issued.fetch_add(1, Ordering::SeqCst) >= self.fire_from {
            future::ready(()).boxed()
        } else {
            future::pending().boxed()
        }
    }
}
