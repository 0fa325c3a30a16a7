//! LP2 engine configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Whether CV reads/writes should always restore track power at the end of
/// a programming operation, or only when there's no other pending traffic.
///
/// The reference LokProgrammer source conditions this on the pending-request
/// table being empty "as a hack" (§9); we make the policy an explicit,
/// configured choice instead of guessing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerOffPolicy {
    /// Always power off once the programming operation completes.
    Always,
    /// Only power off if the pending-request table is empty (reference
    /// behavior).
    WhenIdle,
}

impl Default for PowerOffPolicy {
    fn default() -> Self {
        PowerOffPolicy::WhenIdle
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Lp2Config {
    pub baud_rate: u32,
    #[serde(with = "duration_millis")]
    pub response_timeout: Duration,
    pub power_off_policy: PowerOffPolicy,
    /// Number of DCC reset packets sent before each bit-verify during a CV
    /// read (§4.4 says 5).
    pub reset_repeats: u8,
}

impl Default for Lp2Config {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            response_timeout: Duration::from_millis(500),
            power_off_policy: PowerOffPolicy::default(),
            reset_repeats: 5,
        }
    }
}

/// Loads an `Lp2Config` from a TOML file at `path`, falling back to
/// [`Lp2Config::default`] if the file doesn't exist (missing fields in a
/// present file fall back individually, per `#[serde(default)]` above).
pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Lp2Config, ConfigError> {
    if let Ok(contents) = std::fs::read_to_string(&path) {
        Ok(toml::from_str(&contents)?)
    } else {
        Ok(Lp2Config::default())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
