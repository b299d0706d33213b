// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    channel::{ChanCtxId, Chandef},
    error::ErrorKind,
    mac::MacAddr,
    station::StaId,
    vif::VifId,
};

/// Outcome of a connect request, as reported to the network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectResult {
    Success,
    Failed(ErrorKind),
}

/// Upcalls from the driver core to the network stack.
#[derive(Clone, Debug, PartialEq)]
pub enum StackEvent {
    ConnectResult { vif: VifId, result: ConnectResult, roamed: bool },
    Disconnected { vif: VifId, reason: u16, locally_generated: bool },
    StationAdded { vif: VifId, sta: StaId, mac: MacAddr },
    StationRemoved { vif: VifId, sta: StaId, mac: MacAddr },
    ChannelSwitch { chanctx: ChanCtxId, chandef: Option<Chandef> },
    ScanDone { vif: VifId, aborted: bool },
}
