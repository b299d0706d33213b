// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual-interface and connection lifecycle core of a FullMAC host driver.
//!
//! The crate keeps track of the interfaces hosted on one radio, the channel contexts they
//! share, the peers they talk to and whether their transmit queues may run. All of that lives
//! in [`tables::Tables`] behind a single lock owned by [`driver::Driver`], which is also the
//! entry point for the network stack. Firmware is reached through the
//! [`fw::FirmwareGateway`] trait; [`cmd_mgr::CmdGateway`] implements it on top of an in-order
//! command queue.

pub mod channel;
pub mod client;
pub mod cmd_mgr;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod fw;
pub mod mac;
mod sink;
pub mod station;
pub mod tables;
pub mod timer;
pub mod txq;
pub mod vif;
pub mod worker;

#[cfg(test)]
pub mod test_utils;

pub use {
    config::DriverConfig,
    driver::{ApSettings, ConnectParams, Driver, StationChange, VifParams},
    error::{Error, ErrorKind, ResultExt},
    event::StackEvent,
    worker::{serve_indications, DriverEvent, DriverEventSink},
};
