//! Adapter configuration
//!
//! Options are given as `key=value` pairs:
//!
//! - `device=N` or `index=N`: select the Nth adapter (0-indexed)
//! - `serial=XXXX`: select an adapter by USB serial number
//! - `transfer_timeout=MS`: deadline of a single USB transfer
//! - `operation_timeout=MS`: deadline of one attempt of a read/write
//! - `attempts=N`: attempts of a read/write before giving up
//! - `retry_pause=MS`: pause before a repeated attempt, may be 0
//! - `search_interval=MS`: pause between background ROM searches
//! - `search_timeout=MS`: deadline of one background ROM search

use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Deadline of a single USB transfer
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(200);
/// Pause between background ROM searches
pub const DEFAULT_SEARCH_INTERVAL: Duration = Duration::from_millis(250);
/// Deadline of one background ROM search pass
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration of a 1-Wire adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Adapter index when several are attached
    pub device_index: usize,
    /// USB serial number to select instead of the index
    pub serial: Option<String>,
    /// Deadline of a single USB transfer
    pub transfer_timeout: Duration,
    /// Retry policy of whole read/write operations
    pub retry: RetryPolicy,
    /// Pause between background ROM searches
    pub search_interval: Duration,
    /// Deadline of one background ROM search pass
    pub search_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            serial: None,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            retry: RetryPolicy::default(),
            search_interval: DEFAULT_SEARCH_INTERVAL,
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
        }
    }
}

/// Parse options from key=value pairs
pub fn parse_options(options: &[(&str, &str)]) -> Result<AdapterConfig> {
    let mut config = AdapterConfig::default();

    for (key, value) in options {
        match *key {
            "device" | "index" => {
                config.device_index = value
                    .parse()
                    .map_err(|_| Error::InvalidParameter(format!("{}: {}", key, value)))?;
            }
            "serial" => {
                config.serial = Some(value.to_string());
            }
            "transfer_timeout" => config.transfer_timeout = parse_millis(key, value)?,
            "operation_timeout" => config.retry.timeout = parse_millis(key, value)?,
            "retry_pause" => config.retry.pause = parse_duration(key, value)?,
            "search_interval" => config.search_interval = parse_millis(key, value)?,
            "search_timeout" => config.search_timeout = parse_millis(key, value)?,
            "attempts" => {
                config.retry.attempts = value
                    .parse()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Error::InvalidParameter(format!("attempts: {}", value)))?;
            }
            _ => {
                return Err(Error::InvalidParameter(format!("unknown option: {}", key)));
            }
        }
    }

    Ok(config)
}

/// Parse a duration in milliseconds, with an optional `ms` or `s` suffix.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let trimmed = value.trim();
    if let Some(ms) = trimmed.strip_suffix("ms") {
        ms.trim().parse().map(Duration::from_millis)
    } else if let Some(s) = trimmed.strip_suffix('s') {
        s.trim().parse().map(Duration::from_secs)
    } else {
        trimmed.parse().map(Duration::from_millis)
    }
    .map_err(|_| Error::InvalidParameter(format!("{}: {}", key, value)))
}

/// Like [`parse_duration`], rejecting zero.
fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let duration = parse_duration(key, value)?;
    if duration.is_zero() {
        return Err(Error::InvalidParameter(format!("{}: {}", key, value)));
    }
    Ok(duration)
}
