// Copyright 2021 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    anyhow::{bail, Context, Error},
    serde::Deserialize,
    std::time::Duration,
};

/// Interface slots are tracked in a `u32` bitmap.
pub const MAX_VIF_SLOTS: usize = 32;

/// Sizing and timing knobs of a driver instance. Every field has a default, so a partial (or
/// empty) JSON object is a valid configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub max_vifs: usize,
    pub max_stations: usize,
    pub num_chanctx: usize,
    pub cmd_timeout_ms: u64,
    /// How many times teardown re-issues a disconnect or interface removal before giving up.
    pub teardown_retries: u32,
    pub max_pending_cmds: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_vifs: 4,
            max_stations: 10,
            num_chanctx: 3,
            cmd_timeout_ms: 6000,
            teardown_retries: 3,
            max_pending_cmds: 8,
        }
    }
}

impl DriverConfig {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).context("malformed driver config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_vifs == 0 || self.max_vifs > MAX_VIF_SLOTS {
            bail!("max_vifs must be in 1..={}, got {}", MAX_VIF_SLOTS, self.max_vifs);
        }
        if self.max_stations == 0 || self.max_stations > u8::MAX as usize {
            bail!("max_stations must be in 1..=255, got {}", self.max_stations);
        }
        if self.num_chanctx == 0 || self.num_chanctx > u8::MAX as usize {
            bail!("num_chanctx must be in 1..=255, got {}", self.num_chanctx);
        }
        if self.max_pending_cmds == 0 {
            bail!("max_pending_cmds must be non-zero");
        }
        if self.cmd_timeout_ms == 0 {
            bail!("cmd_timeout_ms must be non-zero");
        }
        Ok(())
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = DriverConfig::from_json("{}").expect("parse empty config");
        assert_eq!(config, DriverConfig::default());
        assert_eq!(config.cmd_timeout(), Duration::from_secs(6));
    }

    #[test]
    fn partial_override() {
        let config = DriverConfig::from_json(r#"{"max_vifs": 8, "teardown_retries": 1}"#)
            .expect("parse config");
        assert_eq!(config.max_vifs, 8);
        assert_eq!(config.teardown_retries, 1);
        assert_eq!(config.max_stations, 10);
    }

    #[test]
    fn reject_oversized_bitmap() {
        let err = DriverConfig::from_json(r#"{"max_vifs": 33}"#).expect_err("should reject");
        assert!(err.to_string().contains("max_vifs"));
    }

    #[test]
    fn reject_zero_tables() {
        assert!(DriverConfig { max_stations: 0, ..Default::default() }.validate().is_err());
        assert!(DriverConfig { num_chanctx: 0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn reject_malformed_json() {
        assert!(DriverConfig::from_json("{max_vifs").is_err());
    }
}
