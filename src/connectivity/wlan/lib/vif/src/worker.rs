// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{driver::Driver, fw::FirmwareGateway, fw::FwIndication, timer::Timer},
    anyhow::{bail, Error},
    futures::{channel::mpsc, StreamExt},
    log::info,
};

pub enum DriverEvent {
    // Indicates that the device is being removed and the worker should exit.
    Stop,
    // An unsolicited firmware event, possibly posted from interrupt context.
    Indication(FwIndication),
}

/// Interrupt-context producers post through this sink. Posting never blocks, and any number of
/// copies may be handed to other threads.
#[derive(Clone, Debug)]
pub struct DriverEventSink(pub mpsc::UnboundedSender<DriverEvent>);

impl DriverEventSink {
    pub fn post(&self, ind: FwIndication) {
        // The worker is gone once the device is removed; late events are dropped.
        let _ = self.0.unbounded_send(DriverEvent::Indication(ind));
    }

    pub fn stop(&self) {
        let _ = self.0.unbounded_send(DriverEvent::Stop);
    }
}

pub fn driver_event_channel() -> (DriverEventSink, mpsc::UnboundedReceiver<DriverEvent>) {
    let (sender, receiver) = mpsc::unbounded();
    (DriverEventSink(sender), receiver)
}

/// Applies firmware events one at a time. Does not return until `DriverEvent::Stop` arrives,
/// unless every sink was dropped first.
pub async fn serve_indications<G: FirmwareGateway, T: Timer>(
    driver: &Driver<G, T>,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
) -> Result<(), Error> {
    while let Some(event) = events.next().await {
        match event {
            DriverEvent::Stop => {
                info!("driver event worker stopping");
                return Ok(());
            }
            DriverEvent::Indication(ind) => driver.handle_indication(ind),
        }
    }
    bail!("Driver event stream terminated unexpectedly.")
}
