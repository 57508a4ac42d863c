use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use ssmtune_protocol_lib::Endpoint;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::parameter::ParameterDescriptor;

/// Upper bound for the request timeout; longer stalls make Stop unresponsive
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Upper bound for the per-iteration sleep
pub const MAX_CYCLE_SLEEP_MS: u64 = 1000;

/// Polling worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Device to talk to
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Time to wait for a reply to a single-shot request (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Delay between identify attempts while the device is silent (ms)
    #[serde(default = "default_identify_interval_ms")]
    pub identify_interval_ms: u64,
    /// Sleep between loop iterations (ms)
    #[serde(default = "default_cycle_sleep_ms")]
    pub cycle_sleep_ms: u64,
    /// How long each iteration waits for a streamed frame (ms)
    #[serde(default = "default_stream_poll_ms")]
    pub stream_poll_ms: u64,
    /// Number of response intervals averaged for the reported query rate
    #[serde(default = "default_rate_window")]
    pub rate_window: usize,
    /// Ask the device to stream query responses
    #[serde(default)]
    pub continuous: bool,
}

const fn default_request_timeout_ms() -> u64 {
    5000
}

const fn default_identify_interval_ms() -> u64 {
    5000
}

const fn default_cycle_sleep_ms() -> u64 {
    10
}

const fn default_stream_poll_ms() -> u64 {
    20
}

const fn default_rate_window() -> usize {
    10
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            request_timeout_ms: default_request_timeout_ms(),
            identify_interval_ms: default_identify_interval_ms(),
            cycle_sleep_ms: default_cycle_sleep_ms(),
            stream_poll_ms: default_stream_poll_ms(),
            rate_window: default_rate_window(),
            continuous: false,
        }
    }
}

impl PollerConfig {
    /// Clamp values to valid ranges and fix invalid values
    pub fn validate(&mut self) {
        if self.request_timeout_ms == 0 {
            warn!("request_timeout_ms is 0, resetting to default");
            self.request_timeout_ms = default_request_timeout_ms();
        }
        if self.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            warn!(
                "Clamping request_timeout_ms from {} to {MAX_REQUEST_TIMEOUT_MS}",
                self.request_timeout_ms
            );
            self.request_timeout_ms = MAX_REQUEST_TIMEOUT_MS;
        }
        if self.cycle_sleep_ms > MAX_CYCLE_SLEEP_MS {
            warn!(
                "Clamping cycle_sleep_ms from {} to {MAX_CYCLE_SLEEP_MS}",
                self.cycle_sleep_ms
            );
            self.cycle_sleep_ms = MAX_CYCLE_SLEEP_MS;
        }
        if self.stream_poll_ms > self.request_timeout_ms {
            warn!("stream_poll_ms exceeds request_timeout_ms, clamping");
            self.stream_poll_ms = self.request_timeout_ms;
        }
        if self.rate_window == 0 {
            warn!("rate_window is 0, using 1");
            self.rate_window = 1;
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn identify_interval(&self) -> Duration {
        Duration::from_millis(self.identify_interval_ms)
    }

    #[must_use]
    pub const fn cycle_sleep(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep_ms)
    }

    #[must_use]
    pub const fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }

    /// Load from a JSON file without validating.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading poller config from {}", path.display());
        let json = std::fs::read(path)?;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded poller config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load poller config from {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

/// Load parameter definitions from a JSON array.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed.
pub fn load_parameters(path: &Path) -> Result<Vec<ParameterDescriptor>, ConfigError> {
    let json = std::fs::read(path)?;
    let parameters: Vec<ParameterDescriptor> = serde_json::from_slice(&json)?;
    info!("Loaded {} parameter definitions from {}", parameters.len(), path.display());
    Ok(parameters)
}
