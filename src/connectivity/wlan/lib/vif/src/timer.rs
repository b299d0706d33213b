// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    futures::{future::BoxFuture, FutureExt},
    std::time::Duration,
};

/// A Timer that can block for a duration specified.
pub trait Timer: Send + Sync {
    /// Returns a future that will complete after `delay`.
    fn wait(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Timer backed by the host's async-io reactor.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostTimer;

impl Timer for HostTimer {
    fn wait(&self, delay: Duration) -> BoxFuture<'static, ()> {
        FutureExt::map(async_io::Timer::after(delay), |_| ()).boxed()
    }
}
