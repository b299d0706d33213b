// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        fw::{CmdId, FwStatus},
        vif::VifType,
    },
    log::error,
    thiserror::Error,
};

/// Negative errno values handed back across the network-stack boundary.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ENETDOWN: i32 = 100;
    pub const ENOTCONN: i32 = 107;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECANCELED: i32 = 125;
}

/// Fixed-size resources the driver can run out of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    VifSlot,
    StationSlot,
    PendingCommand,
}

/// Failure of the transport underneath the firmware gateway.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("firmware transport closed")]
    Closed,
    #[error("too many outstanding firmware commands")]
    QueueFull,
    #[error("firmware transport error: {0}")]
    Transport(String),
}

/// Coarse classification of every failure surfaced to the network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// No free slot; the caller may retry later.
    NoResources,
    /// The request does not fit the current state. Nothing was mutated.
    InvalidRequest,
    /// The firmware answered with a non-OK status. The state machine reverted.
    FirmwareRejected,
    /// The gateway failed or the operation was torn down underneath the caller.
    Aborted,
}

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("no free {0:?}")]
    NoResources(Resource),
    #[error("no such interface")]
    NoSuchVif,
    #[error("interface is down")]
    VifDown,
    #[error("{op} not supported on {vif_type:?} interface")]
    WrongVifType { op: &'static str, vif_type: VifType },
    #[error("channel context {0} out of range")]
    InvalidChanCtx(u8),
    #[error("no such station")]
    NoSuchStation,
    #[error("station already exists")]
    StationExists,
    #[error("operation already in progress")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),
    #[error("firmware rejected {cmd:?} with {status}")]
    Rejected { cmd: CmdId, status: FwStatus },
    #[error("gateway failure during {cmd:?}")]
    Gateway {
        cmd: CmdId,
        #[source]
        source: GatewayError,
    },
    #[error("timed out waiting for {0:?} confirmation")]
    Timeout(CmdId),
    #[error("operation canceled by teardown")]
    Canceled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoResources(_) => ErrorKind::NoResources,
            Error::NoSuchVif
            | Error::VifDown
            | Error::WrongVifType { .. }
            | Error::InvalidChanCtx(_)
            | Error::NoSuchStation
            | Error::StationExists
            | Error::Busy
            | Error::NotConnected
            | Error::InvalidArgs(_) => ErrorKind::InvalidRequest,
            Error::Rejected { .. } => ErrorKind::FirmwareRejected,
            Error::Gateway { .. } | Error::Timeout(_) | Error::Canceled => ErrorKind::Aborted,
        }
    }

    /// True if the gateway itself failed, as opposed to the firmware answering.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Gateway { .. } | Error::Timeout(_))
    }

    pub fn into_errno(self) -> i32 {
        let code = match self {
            Error::NoResources(Resource::PendingCommand) => errno::ENOMEM,
            Error::NoResources(_) => errno::ENOSPC,
            Error::NoSuchVif => errno::ENODEV,
            Error::VifDown => errno::ENETDOWN,
            Error::WrongVifType { .. } => errno::EOPNOTSUPP,
            Error::InvalidChanCtx(_) | Error::InvalidArgs(_) => errno::EINVAL,
            Error::NoSuchStation => errno::ENOENT,
            Error::StationExists => errno::EEXIST,
            Error::Busy => errno::EBUSY,
            Error::NotConnected => errno::ENOTCONN,
            Error::Rejected { status, .. } if status == FwStatus::BUSY => errno::EBUSY,
            Error::Rejected { .. } | Error::Gateway { .. } => errno::EIO,
            Error::Timeout(_) => errno::ETIMEDOUT,
            Error::Canceled => errno::ECANCELED,
        };
        -code
    }
}

pub trait ResultExt {
    /// Returns 0 if Self is Ok, otherwise logs the error and turns it into a negative errno.
    fn into_raw_status(self) -> i32;
}

impl ResultExt for Result<(), Error> {
    fn into_raw_status(self) -> i32 {
        match self {
            Ok(()) => 0,
            Err(e) => {
                error!("{}", e);
                e.into_errno()
            }
        }
    }
}
