// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared RF channel contexts.
//!
//! A context is referenced by every interface operating on it. References are handed out as
//! `ChannelLease`s: a lease is produced by `link` and can only be given back by moving it into
//! `unlink`, so each link is matched by exactly one unlink.

use {
    crate::error::Error,
    log::{error, warn},
    std::fmt,
};

/// Channel bandwidth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cbw {
    Cbw20NoHt,
    Cbw20,
    Cbw40,
    Cbw80,
    Cbw160,
    Cbw80P80,
}

impl Cbw {
    pub fn mhz(self) -> u16 {
        match self {
            Cbw::Cbw20NoHt | Cbw::Cbw20 => 20,
            Cbw::Cbw40 => 40,
            Cbw::Cbw80 | Cbw::Cbw80P80 => 80,
            Cbw::Cbw160 => 160,
        }
    }
}

/// Channel definition: where the radio sits and how wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Chandef {
    pub primary_freq: u16,
    pub cbw: Cbw,
    pub center_freq1: u16,
    /// Only meaningful for 80+80.
    pub center_freq2: u16,
}

impl Chandef {
    pub fn new(primary_freq: u16, cbw: Cbw) -> Self {
        Self { primary_freq, cbw, center_freq1: primary_freq, center_freq2: 0 }
    }

    pub fn with_centers(mut self, center_freq1: u16, center_freq2: u16) -> Self {
        self.center_freq1 = center_freq1;
        self.center_freq2 = center_freq2;
        self
    }

    pub fn is_valid(&self) -> bool {
        if self.primary_freq == 0 || self.center_freq1 == 0 {
            return false;
        }
        let half = self.cbw.mhz() / 2;
        let low = self.center_freq1.saturating_sub(half);
        let high = self.center_freq1.saturating_add(half);
        let primary_inside = self.primary_freq > low && self.primary_freq < high;
        match self.cbw {
            Cbw::Cbw80P80 => primary_inside && self.center_freq2 != 0,
            _ => primary_inside,
        }
    }
}

impl fmt::Display for Chandef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} MHz ({:?}, cf1 {})", self.primary_freq, self.cbw, self.center_freq1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChanCtxId(pub u8);

impl fmt::Display for ChanCtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chanctx #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChannelContext {
    pub chandef: Option<Chandef>,
    pub count: u32,
}

/// One reference on a channel context.
#[must_use = "a lease must be returned through ChanCtxTable::unlink"]
#[derive(Debug, PartialEq)]
pub struct ChannelLease {
    ctx: ChanCtxId,
}

impl ChannelLease {
    pub fn ctx(&self) -> ChanCtxId {
        self.ctx
    }

    fn consume(self) -> ChanCtxId {
        let ctx = self.ctx;
        std::mem::forget(self);
        ctx
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        error!("lease on {} dropped without unlink; reference leaked", self.ctx);
    }
}

/// What happened to the context when a lease was returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unlinked {
    pub ctx: ChanCtxId,
    /// The count reached zero and the definition was cleared.
    pub emptied: bool,
    /// The emptied context was the active one; radar detection has to be turned off.
    pub disable_radar: bool,
}

#[derive(Debug)]
pub struct ChanCtxTable {
    ctxs: Vec<ChannelContext>,
    active: Option<ChanCtxId>,
}

impl ChanCtxTable {
    pub fn new(size: usize) -> Self {
        Self { ctxs: vec![ChannelContext::default(); size], active: None }
    }

    pub fn len(&self) -> usize {
        self.ctxs.len()
    }

    /// Takes a reference on `ctx`, installing `chandef` if the context has no definition yet.
    /// A conflicting definition on an already-defined context is ignored: the first writer wins.
    pub fn link(&mut self, ctx: ChanCtxId, chandef: Option<Chandef>) -> Result<ChannelLease, Error> {
        let entry = match self.ctxs.get_mut(ctx.0 as usize) {
            Some(entry) => entry,
            None => {
                error!("cannot link {}: out of range", ctx);
                return Err(Error::InvalidChanCtx(ctx.0));
            }
        };
        match (entry.chandef, chandef) {
            (None, Some(new)) => entry.chandef = Some(new),
            (Some(installed), Some(new)) if installed != new => {
                warn!("{} keeps {}, ignoring {}", ctx, installed, new);
            }
            _ => {}
        }
        entry.count += 1;
        Ok(ChannelLease { ctx })
    }

    /// Returns a reference. The definition is cleared when the last one goes away.
    pub fn unlink(&mut self, lease: ChannelLease) -> Unlinked {
        let ctx = lease.consume();
        let entry = &mut self.ctxs[ctx.0 as usize];
        entry.count -= 1;
        let emptied = entry.count == 0;
        if emptied {
            entry.chandef = None;
        }
        Unlinked { ctx, emptied, disable_radar: emptied && self.active == Some(ctx) }
    }

    pub fn is_valid(&self, ctx: ChanCtxId) -> bool {
        self.chandef(ctx).is_some()
    }

    pub fn chandef(&self, ctx: ChanCtxId) -> Option<Chandef> {
        self.ctxs.get(ctx.0 as usize).and_then(|entry| entry.chandef)
    }

    /// `None` if `ctx` is out of range.
    pub fn count(&self, ctx: ChanCtxId) -> Option<u32> {
        self.ctxs.get(ctx.0 as usize).map(|entry| entry.count)
    }

    pub fn set_active(&mut self, ctx: ChanCtxId) -> Result<(), Error> {
        if ctx.0 as usize >= self.ctxs.len() {
            return Err(Error::InvalidChanCtx(ctx.0));
        }
        self.active = Some(ctx);
        Ok(())
    }

    pub fn active(&self) -> Option<ChanCtxId> {
        self.active
    }

    /// A context already carrying `chandef`, or else the first unreferenced one.
    pub fn find_for(&self, chandef: &Chandef) -> Option<ChanCtxId> {
        let position = self
            .ctxs
            .iter()
            .position(|entry| entry.chandef.as_ref() == Some(chandef))
            .or_else(|| self.ctxs.iter().position(|entry| entry.count == 0))?;
        Some(ChanCtxId(position as u8))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches, proptest::prelude::*};

    fn chan(freq: u16) -> Chandef {
        Chandef::new(freq, Cbw::Cbw20)
    }

    #[test]
    fn link_installs_definition_and_unlink_clears_it() {
        let mut table = ChanCtxTable::new(3);
        let lease = table.link(ChanCtxId(1), Some(chan(2412))).expect("link");
        assert_eq!(lease.ctx(), ChanCtxId(1));
        assert!(table.is_valid(ChanCtxId(1)));
        assert_eq!(table.count(ChanCtxId(1)), Some(1));

        let unlinked = table.unlink(lease);
        assert!(unlinked.emptied);
        assert!(!unlinked.disable_radar);
        assert!(!table.is_valid(ChanCtxId(1)));
        assert_eq!(table.count(ChanCtxId(1)), Some(0));
    }

    #[test]
    fn first_writer_wins() {
        let mut table = ChanCtxTable::new(3);
        let first = table.link(ChanCtxId(0), Some(chan(2412))).expect("link first");
        let second = table.link(ChanCtxId(0), Some(chan(5180))).expect("link second");
        assert_eq!(table.chandef(ChanCtxId(0)), Some(chan(2412)));
        assert_eq!(table.count(ChanCtxId(0)), Some(2));

        assert!(!table.unlink(first).emptied);
        assert_eq!(table.chandef(ChanCtxId(0)), Some(chan(2412)));
        assert!(table.unlink(second).emptied);
    }

    #[test]
    fn link_without_definition_only_counts() {
        let mut table = ChanCtxTable::new(2);
        let lease = table.link(ChanCtxId(0), None).expect("link");
        assert_eq!(table.count(ChanCtxId(0)), Some(1));
        assert!(!table.is_valid(ChanCtxId(0)));
        let _ = table.unlink(lease);
    }

    #[test]
    fn out_of_range() {
        let mut table = ChanCtxTable::new(2);
        assert_matches!(table.link(ChanCtxId(2), Some(chan(2412))), Err(Error::InvalidChanCtx(2)));
        assert!(!table.is_valid(ChanCtxId(7)));
        assert_eq!(table.count(ChanCtxId(7)), None);
        assert_matches!(table.set_active(ChanCtxId(2)), Err(Error::InvalidChanCtx(2)));
    }

    #[test]
    fn emptying_active_context_disables_radar() {
        let mut table = ChanCtxTable::new(2);
        let lease = table.link(ChanCtxId(1), Some(chan(5260))).expect("link");
        table.set_active(ChanCtxId(1)).expect("set active");
        let unlinked = table.unlink(lease);
        assert!(unlinked.disable_radar);
        assert_eq!(table.active(), Some(ChanCtxId(1)));
        assert!(!table.is_valid(ChanCtxId(1)));
    }

    #[test]
    fn find_for_prefers_matching_context() {
        let mut table = ChanCtxTable::new(3);
        let lease = table.link(ChanCtxId(1), Some(chan(2437))).expect("link");
        assert_eq!(table.find_for(&chan(2437)), Some(ChanCtxId(1)));
        assert_eq!(table.find_for(&chan(5180)), Some(ChanCtxId(0)));
        let _ = table.unlink(lease);
    }

    #[test]
    fn chandef_validity() {
        assert!(Chandef::new(2412, Cbw::Cbw20).is_valid());
        assert!(Chandef::new(5180, Cbw::Cbw80).with_centers(5210, 0).is_valid());
        assert!(!Chandef::new(5180, Cbw::Cbw40).with_centers(5260, 0).is_valid());
        assert!(!Chandef::new(5180, Cbw::Cbw80P80).with_centers(5210, 0).is_valid());
        assert!(!Chandef::new(0, Cbw::Cbw20).is_valid());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Link(u8, u16),
        Unlink(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, prop::sample::select(vec![2412u16, 2437, 5180])).prop_map(|(c, f)| Op::Link(c, f)),
            any::<usize>().prop_map(Op::Unlink),
        ]
    }

    proptest! {
        #[test]
        fn count_and_definition_stay_consistent(ops in prop::collection::vec(op(), 0..64)) {
            let mut table = ChanCtxTable::new(4);
            let mut leases = Vec::new();
            for op in ops {
                match op {
                    Op::Link(ctx, freq) => leases.push(table.link(ChanCtxId(ctx), Some(chan(freq))).unwrap()),
                    Op::Unlink(i) if !leases.is_empty() => {
                        let lease = leases.swap_remove(i % leases.len());
                        let unlinked = table.unlink(lease);
                        if unlinked.emptied {
                            prop_assert!(!table.is_valid(unlinked.ctx));
                        }
                    }
                    Op::Unlink(_) => {}
                }
                for ctx in 0..4u8 {
                    let ctx = ChanCtxId(ctx);
                    let held = leases.iter().filter(|l| l.ctx() == ctx).count() as u32;
                    prop_assert_eq!(table.count(ctx), Some(held));
                    prop_assert_eq!(table.is_valid(ctx), held > 0);
                }
            }
            for lease in leases {
                let _ = table.unlink(lease);
            }
        }
    }
}
