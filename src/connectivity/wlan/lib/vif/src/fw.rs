// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boundary types for the firmware command/confirmation gateway.
//!
//! The core never looks at message bytes. Every request is an `FwRequest`, every reply an
//! `FwConfirm` carrying the firmware status code, and unsolicited firmware events are
//! `FwIndication`s. How these travel to the SoC is the gateway implementation's business.

use {
    crate::{channel::Chandef, error::GatewayError, mac::MacAddr},
    futures::future::BoxFuture,
    std::fmt,
};

/// Firmware status code carried by every confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FwStatus(pub u8);

impl FwStatus {
    pub const OK: Self = Self(0);
    pub const FAIL: Self = Self(1);
    pub const EMPTY: Self = Self(2);
    pub const FULL: Self = Self(3);
    pub const BAD_PARAM: Self = Self(4);
    pub const NOT_FOUND: Self = Self(5);
    pub const NO_MORE_ELT_AVAILABLE: Self = Self(6);
    pub const NO_ELT_IN_USE: Self = Self(7);
    pub const BUSY: Self = Self(8);
    pub const OP_IN_PROGRESS: Self = Self(9);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for FwStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::OK => "CO_OK",
            Self::FAIL => "CO_FAIL",
            Self::EMPTY => "CO_EMPTY",
            Self::FULL => "CO_FULL",
            Self::BAD_PARAM => "CO_BAD_PARAM",
            Self::NOT_FOUND => "CO_NOT_FOUND",
            Self::NO_MORE_ELT_AVAILABLE => "CO_NO_MORE_ELT_AVAILABLE",
            Self::NO_ELT_IN_USE => "CO_NO_ELT_IN_USE",
            Self::BUSY => "CO_BUSY",
            Self::OP_IN_PROGRESS => "CO_OP_IN_PROGRESS",
            Self(other) => return write!(f, "CO_UNKNOWN({})", other),
        };
        f.write_str(name)
    }
}

/// Interface type as understood by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MacVifType {
    Sta = 0,
    Ibss = 1,
    Ap = 2,
    MeshPoint = 3,
    Monitor = 4,
}

/// Identifies a request/confirmation pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmdId {
    AddIf,
    RemoveIf,
    Connect,
    Disconnect,
    StaAdd,
    StaDel,
    ApStart,
    ApStop,
    SetChannel,
    ScanStart,
    PortControl,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FwRequest {
    AddIf { vif_type: MacVifType, mac: MacAddr, p2p: bool },
    RemoveIf { fw_vif: u8 },
    Connect { fw_vif: u8, bssid: MacAddr, ssid: Vec<u8>, chandef: Option<Chandef> },
    Disconnect { fw_vif: u8, reason: u16 },
    StaAdd { fw_vif: u8, mac: MacAddr, aid: u16, qos: bool },
    StaDel { fw_sta: u8 },
    ApStart { fw_vif: u8, chandef: Chandef, beacon_interval: u16 },
    ApStop { fw_vif: u8 },
    SetChannel { chandef: Chandef },
    ScanStart { fw_vif: u8 },
    PortControl { fw_sta: u8, authorized: bool },
}

impl FwRequest {
    pub fn id(&self) -> CmdId {
        match self {
            Self::AddIf { .. } => CmdId::AddIf,
            Self::RemoveIf { .. } => CmdId::RemoveIf,
            Self::Connect { .. } => CmdId::Connect,
            Self::Disconnect { .. } => CmdId::Disconnect,
            Self::StaAdd { .. } => CmdId::StaAdd,
            Self::StaDel { .. } => CmdId::StaDel,
            Self::ApStart { .. } => CmdId::ApStart,
            Self::ApStop { .. } => CmdId::ApStop,
            Self::SetChannel { .. } => CmdId::SetChannel,
            Self::ScanStart { .. } => CmdId::ScanStart,
            Self::PortControl { .. } => CmdId::PortControl,
        }
    }
}

/// What the firmware reports about the link a successful connect established.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkInfo {
    /// Firmware station index of the access point.
    pub ap_fw_sta: u8,
    pub aid: u16,
    pub chanctx: u8,
    pub chandef: Chandef,
    pub qos: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FwConfirm {
    AddIf { status: FwStatus, inst_nbr: u8 },
    RemoveIf { status: FwStatus },
    Connect { status: FwStatus, link: Option<LinkInfo> },
    Disconnect { status: FwStatus },
    StaAdd { status: FwStatus, fw_sta: u8 },
    StaDel { status: FwStatus },
    ApStart { status: FwStatus, chanctx: u8, bcmc_fw_sta: u8 },
    ApStop { status: FwStatus },
    SetChannel { status: FwStatus, chanctx: u8 },
    ScanStart { status: FwStatus },
    PortControl { status: FwStatus },
}

impl FwConfirm {
    pub fn id(&self) -> CmdId {
        match self {
            Self::AddIf { .. } => CmdId::AddIf,
            Self::RemoveIf { .. } => CmdId::RemoveIf,
            Self::Connect { .. } => CmdId::Connect,
            Self::Disconnect { .. } => CmdId::Disconnect,
            Self::StaAdd { .. } => CmdId::StaAdd,
            Self::StaDel { .. } => CmdId::StaDel,
            Self::ApStart { .. } => CmdId::ApStart,
            Self::ApStop { .. } => CmdId::ApStop,
            Self::SetChannel { .. } => CmdId::SetChannel,
            Self::ScanStart { .. } => CmdId::ScanStart,
            Self::PortControl { .. } => CmdId::PortControl,
        }
    }

    pub fn status(&self) -> FwStatus {
        match self {
            Self::AddIf { status, .. }
            | Self::RemoveIf { status }
            | Self::Connect { status, .. }
            | Self::Disconnect { status }
            | Self::StaAdd { status, .. }
            | Self::StaDel { status }
            | Self::ApStart { status, .. }
            | Self::ApStop { status }
            | Self::SetChannel { status, .. }
            | Self::ScanStart { status }
            | Self::PortControl { status } => *status,
        }
    }
}

/// Unsolicited events reported by the firmware, possibly from interrupt context.
#[derive(Clone, Debug, PartialEq)]
pub enum FwIndication {
    /// A peer entered or left power-save.
    PsChange { fw_sta: u8, ps_on: bool },
    /// The radio moved to another channel context.
    ChannelSwitch { chanctx: u8 },
    /// The firmware dropped the link of a station-like interface.
    Disconnected { fw_vif: u8, reason: u16 },
    ScanDone { fw_vif: u8, aborted: bool },
}

/// Synchronous request/response channel to the device firmware. Confirmations are delivered
/// in the order the requests were issued.
pub trait FirmwareGateway: Send + Sync {
    fn send(&self, req: FwRequest) -> BoxFuture<'static, Result<FwConfirm, GatewayError>>;
}
