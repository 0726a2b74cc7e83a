//! Reconnection settings shared by the aggregator and standalone sources.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(5000);
pub const DEFAULT_RECONNECT_BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Reconnection attempts per namespace before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Geometric growth factor applied per attempt.
    pub reconnect_backoff_multiplier: f64,
    /// Optional ceiling for any single delay (uncapped when `None`).
    pub reconnect_max_delay: Option<Duration>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_backoff_multiplier: DEFAULT_RECONNECT_BACKOFF_MULTIPLIER,
            reconnect_max_delay: None,
        }
    }
}

impl WatchConfig {
    /// Defaults overridden by `NSWATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`WatchConfig::from_env`] with a custom variable source.
    /// Unparsable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(n) = parse_var::<u32, _>(&lookup, "NSWATCH_MAX_RECONNECT_ATTEMPTS") {
            cfg.max_reconnect_attempts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "NSWATCH_RECONNECT_BASE_DELAY_MS") {
            cfg.reconnect_base_delay = Duration::from_millis(ms);
        }
        if let Some(m) = parse_var::<f64, _>(&lookup, "NSWATCH_RECONNECT_BACKOFF_MULTIPLIER") {
            if m.is_finite() && m > 0.0 {
                cfg.reconnect_backoff_multiplier = m;
            } else {
                warn!(value = m, "ignoring non-positive NSWATCH_RECONNECT_BACKOFF_MULTIPLIER");
            }
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "NSWATCH_RECONNECT_MAX_DELAY_MS") {
            cfg.reconnect_max_delay = Some(Duration::from_millis(ms));
        }
        cfg
    }

    /// Delay for the Nth reconnection attempt (1-indexed):
    /// `base * multiplier^(n-1)`, clamped by `reconnect_max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.reconnect_base_delay.as_nanos() as f64 * self.reconnect_backoff_multiplier.powi(exp);
        let delay = if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            Duration::MAX
        } else if nanos <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(nanos.round() as u64)
        };
        match self.reconnect_max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.reconnect_base_delay, Duration::from_secs(5));
        assert_eq!(cfg.reconnect_backoff_multiplier, 2.0);
        assert!(cfg.reconnect_max_delay.is_none());
    }

    #[test]
    fn backoff_grows_geometrically() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(5));
        assert_eq!(cfg.backoff_delay(2), Duration::from_secs(10));
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(cfg.backoff_delay(5), Duration::from_secs(80));
    }

    #[test]
    fn backoff_respects_cap_and_saturates() {
        let mut cfg = WatchConfig { reconnect_max_delay: Some(Duration::from_secs(30)), ..Default::default() };
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(20));
        assert_eq!(cfg.backoff_delay(4), Duration::from_secs(30));
        cfg.reconnect_max_delay = None;
        assert_eq!(cfg.backoff_delay(10_000), Duration::MAX);
    }

    #[test]
    fn from_lookup_overrides_and_ignores_garbage() {
        let vars: HashMap<&str, &str> = [
            ("NSWATCH_MAX_RECONNECT_ATTEMPTS", "3"),
            ("NSWATCH_RECONNECT_BASE_DELAY_MS", "250"),
            ("NSWATCH_RECONNECT_BACKOFF_MULTIPLIER", "nope"),
            ("NSWATCH_RECONNECT_MAX_DELAY_MS", "1000"),
        ]
        .into_iter()
        .collect();
        let cfg = WatchConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.max_reconnect_attempts, 3);
        assert_eq!(cfg.reconnect_base_delay, Duration::from_millis(250));
        assert_eq!(cfg.reconnect_backoff_multiplier, 2.0);
        assert_eq!(cfg.reconnect_max_delay, Some(Duration::from_secs(1)));
        assert_eq!(cfg.backoff_delay(4), Duration::from_secs(1));
    }

    #[test]
    fn non_positive_multiplier_is_rejected() {
        let cfg = WatchConfig::from_lookup(|k| (k == "NSWATCH_RECONNECT_BACKOFF_MULTIPLIER").then(|| "-1".to_string()));
        assert_eq!(cfg.reconnect_backoff_multiplier, 2.0);
    }
}
