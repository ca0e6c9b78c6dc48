use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DistributionMode;

pub const ENV_DEVICES: &str = "AERO_MULTIGPU_DEVICES";
pub const ENV_MODE: &str = "AERO_MULTIGPU_MODE";
pub const ENV_RESOLUTION: &str = "AERO_MULTIGPU_RESOLUTION";
pub const ENV_BALANCE_SMOOTHING: &str = "AERO_MULTIGPU_BALANCE_SMOOTHING";
pub const ENV_COMPLETION_TIMEOUT_MS: &str = "AERO_MULTIGPU_COMPLETION_TIMEOUT_MS";
pub const ENV_STALL_THRESHOLD: &str = "AERO_MULTIGPU_STALL_THRESHOLD";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("frame resolution must be non-zero (got {width}x{height})")]
    ZeroResolution { width: u32, height: u32 },

    #[error("no active devices")]
    NoDevices,

    #[error("unknown distribution mode {0:?}")]
    UnknownMode(String),

    #[error("balance smoothing must be in (0, 1] (got {0})")]
    InvalidSmoothing(f64),
}

/// Runtime settings for a [`crate::MultiGpuContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiGpuConfig {
    /// Desired device count; the context uses at most what the directory exposes.
    pub device_count: u32,
    pub mode: DistributionMode,
    pub width: u32,
    pub height: u32,
    /// Weight of the newest workload sample in the balancer's moving average.
    pub balance_smoothing: f64,
    /// Default bound for completion waits issued by higher layers.
    pub completion_timeout: Duration,
    /// Consecutive completion timeouts before a device is considered stalled.
    pub stall_threshold: u32,
}

impl Default for MultiGpuConfig {
    fn default() -> Self {
        Self {
            device_count: 3,
            mode: DistributionMode::HorizontalSplit,
            width: 1920,
            height: 1080,
            balance_smoothing: 0.5,
            completion_timeout: Duration::from_millis(2000),
            stall_threshold: 3,
        }
    }
}

impl MultiGpuConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEVICES) {
            config.device_count = parse_env(ENV_DEVICES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MODE) {
            // Numeric values are raw mode ids; unknown ids fall back to horizontal.
            config.mode = match raw.trim().parse::<u32>() {
                Ok(id) => DistributionMode::from_raw(id),
                Err(_) => raw.parse()?,
            };
        }
        if let Some(raw) = lookup(ENV_RESOLUTION) {
            let (width, height) =
                parse_resolution(&raw).ok_or(ConfigError::InvalidEnv(ENV_RESOLUTION))?;
            config.width = width;
            config.height = height;
        }
        if let Some(raw) = lookup(ENV_BALANCE_SMOOTHING) {
            config.balance_smoothing = parse_env(ENV_BALANCE_SMOOTHING, &raw)?;
        }
        if let Some(raw) = lookup(ENV_COMPLETION_TIMEOUT_MS) {
            config.completion_timeout =
                Duration::from_millis(parse_env(ENV_COMPLETION_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(ENV_STALL_THRESHOLD) {
            config.stall_threshold = parse_env(ENV_STALL_THRESHOLD, &raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_count == 0 {
            return Err(ConfigError::NoDevices);
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroResolution {
                width: self.width,
                height: self.height,
            });
        }
        if !(self.balance_smoothing > 0.0 && self.balance_smoothing <= 1.0) {
            return Err(ConfigError::InvalidSmoothing(self.balance_smoothing));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv(var))
}

/// Parses `WIDTHxHEIGHT` (case-insensitive `x`).
pub fn parse_resolution(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = MultiGpuConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, MultiGpuConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = MultiGpuConfig::from_lookup(lookup(&[
            (ENV_DEVICES, "4"),
            (ENV_MODE, "quadrant"),
            (ENV_RESOLUTION, "3840x2160"),
            (ENV_BALANCE_SMOOTHING, "0.25"),
            (ENV_COMPLETION_TIMEOUT_MS, "50"),
            (ENV_STALL_THRESHOLD, "5"),
        ]))
        .unwrap();
        assert_eq!(config.device_count, 4);
        assert_eq!(config.mode, DistributionMode::QuadrantSplit);
        assert_eq!((config.width, config.height), (3840, 2160));
        assert_eq!(config.balance_smoothing, 0.25);
        assert_eq!(config.completion_timeout, Duration::from_millis(50));
        assert_eq!(config.stall_threshold, 5);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            MultiGpuConfig::from_lookup(lookup(&[(ENV_RESOLUTION, "wide")])),
            Err(ConfigError::InvalidEnv(ENV_RESOLUTION))
        );
        assert_eq!(
            MultiGpuConfig::from_lookup(lookup(&[(ENV_RESOLUTION, "0x1080")])),
            Err(ConfigError::ZeroResolution {
                width: 0,
                height: 1080
            })
        );
        assert_eq!(
            MultiGpuConfig::from_lookup(lookup(&[(ENV_DEVICES, "0")])),
            Err(ConfigError::NoDevices)
        );
        assert_eq!(
            MultiGpuConfig::from_lookup(lookup(&[(ENV_MODE, "checkerboard")])),
            Err(ConfigError::UnknownMode("checkerboard".into()))
        );
        assert_eq!(
            MultiGpuConfig::from_lookup(lookup(&[(ENV_BALANCE_SMOOTHING, "1.5")])),
            Err(ConfigError::InvalidSmoothing(1.5))
        );
    }

    #[test]
    fn numeric_modes_use_raw_ids() {
        let mode = |raw: &str| {
            MultiGpuConfig::from_lookup(lookup(&[(ENV_MODE, raw)]))
                .unwrap()
                .mode
        };
        assert_eq!(mode("2"), DistributionMode::QuadrantSplit);
        assert_eq!(mode("4"), DistributionMode::OptimizedSplit);
        assert_eq!(mode("17"), DistributionMode::HorizontalSplit);
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("1921X1080"), Some((1921, 1080)));
        assert_eq!(parse_resolution(" 640 x 480 "), Some((640, 480)));
        assert_eq!(parse_resolution("640"), None);
    }
}
