// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Connection state of a station-like interface.
//!
//! The state machine never talks to the firmware. The driver asks it for permission to start a
//! connect or a disconnect, performs the firmware round-trip without holding the table lock,
//! and then reports the outcome back. Each connect attempt is identified by a `ConnectTicket`,
//! so an outcome arriving after teardown already forced the interface down is recognized as
//! stale instead of resurrecting the link.

use {
    crate::{error::Error, mac::MacAddr, station::StaId},
    futures::channel::oneshot,
    log::info,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnState {
    /// No firmware command is in flight for the link.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Disconnected | ConnState::Connected)
    }
}

/// Grants one connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectTicket {
    attempt: u64,
    /// State visible before the attempt began.
    pub prev: ConnState,
    pub roaming: bool,
}

#[derive(Debug)]
pub struct ClientSm {
    state: ConnState,
    roaming: bool,
    attempt: u64,
    /// Implicit station record of the access point while connected.
    pub ap: Option<StaId>,
    pub bssid: Option<MacAddr>,
    waiters: Vec<oneshot::Sender<ConnState>>,
}

impl Default for ClientSm {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSm {
    pub fn new() -> Self {
        Self {
            state: ConnState::Disconnected,
            roaming: false,
            attempt: 0,
            ap: None,
            bssid: None,
            waiters: vec![],
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_roaming(&self) -> bool {
        self.roaming
    }

    fn enter(&mut self, state: ConnState) {
        self.state = state;
        if state.is_terminal() {
            self.roaming = false;
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(state);
            }
        }
    }

    /// Disconnected or Connected to Connecting. A connect on a live link is a roam.
    pub fn begin_connect(&mut self) -> Result<ConnectTicket, Error> {
        let roaming = match self.state {
            ConnState::Connecting | ConnState::Disconnecting => return Err(Error::Busy),
            ConnState::Connected => true,
            ConnState::Disconnected => false,
        };
        let prev = self.state;
        self.attempt += 1;
        self.roaming = roaming;
        self.enter(ConnState::Connecting);
        Ok(ConnectTicket { attempt: self.attempt, prev, roaming })
    }

    /// The attempt is still the one in flight.
    pub fn is_current(&self, ticket: &ConnectTicket) -> bool {
        self.state == ConnState::Connecting && self.attempt == ticket.attempt
    }

    /// Applies the firmware verdict: Connected on success, Disconnected otherwise.
    pub fn complete_connect(&mut self, ticket: &ConnectTicket, success: bool) -> Result<(), Error> {
        if !self.is_current(ticket) {
            return Err(Error::Canceled);
        }
        self.enter(if success { ConnState::Connected } else { ConnState::Disconnected });
        Ok(())
    }

    /// The attempt never reached the firmware; the previous state comes back.
    pub fn abort_connect(&mut self, ticket: &ConnectTicket) -> Result<(), Error> {
        if !self.is_current(ticket) {
            return Err(Error::Canceled);
        }
        self.enter(ticket.prev);
        Ok(())
    }

    /// Connected to Disconnecting.
    pub fn begin_disconnect(&mut self) -> Result<(), Error> {
        match self.state {
            ConnState::Connecting | ConnState::Disconnecting => Err(Error::Busy),
            ConnState::Disconnected => Err(Error::NotConnected),
            ConnState::Connected => {
                self.enter(ConnState::Disconnecting);
                Ok(())
            }
        }
    }

    /// Disconnected if the firmware confirmed, back to Connected otherwise. Returns false if
    /// the link was torn down some other way in the meantime.
    pub fn complete_disconnect(&mut self, success: bool) -> bool {
        if self.state != ConnState::Disconnecting {
            return false;
        }
        self.enter(if success { ConnState::Disconnected } else { ConnState::Connected });
        true
    }

    /// Teardown gave up on the firmware. Any attempt in flight becomes stale.
    pub fn force_disconnected(&mut self) {
        if self.state != ConnState::Disconnected {
            info!("forcing link down from {:?}", self.state);
        }
        self.attempt += 1;
        self.enter(ConnState::Disconnected);
    }

    /// The firmware dropped the link on its own. Returns true if there was a link to drop.
    pub fn on_link_lost(&mut self) -> bool {
        match self.state {
            ConnState::Connected | ConnState::Disconnecting => {
                self.enter(ConnState::Disconnected);
                true
            }
            ConnState::Connecting | ConnState::Disconnected => false,
        }
    }

    /// Resolves with the next terminal state, immediately if already terminal.
    pub fn wait_terminal(&mut self) -> oneshot::Receiver<ConnState> {
        let (sender, receiver) = oneshot::channel();
        if self.state.is_terminal() {
            let _ = sender.send(self.state);
        } else {
            self.waiters.push(sender);
        }
        receiver
    }
}
