//! Z21 client configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Z21Config {
    pub port: u16,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Outbound frames queued within this window of each other are coalesced
    /// into a single UDP datagram (§4.5, up to [`crate::z21::framing::MAX_DATAGRAM_LEN`]
    /// bytes).
    #[serde(with = "duration_millis")]
    pub idle_coalesce_window: Duration,
    /// How often the pending-request table is swept for retransmission.
    #[serde(with = "duration_millis")]
    pub retransmit_interval: Duration,
    /// A pending request older than this is considered stale and retransmitted.
    #[serde(with = "duration_millis")]
    pub retransmit_after: Duration,
    #[serde(with = "duration_millis")]
    pub programming_timeout: Duration,
    /// Delay between a POM write and its verifying read-back.
    #[serde(with = "duration_millis")]
    pub pom_write_verify_delay: Duration,
}

impl Default for Z21Config {
    fn default() -> Self {
        Self {
            port: 21105,
            connect_timeout: Duration::from_secs(2),
            idle_coalesce_window: Duration::from_millis(50),
            retransmit_interval: Duration::from_secs(1),
            retransmit_after: Duration::from_secs(2),
            programming_timeout: Duration::from_secs(5),
            pom_write_verify_delay: Duration::from_millis(100),
        }
    }
}

/// Loads a `Z21Config` from a TOML file at `path`, falling back to
/// [`Z21Config::default`] if the file doesn't exist (missing fields in a
/// present file fall back individually, per `#[serde(default)]` above).
pub fn parse_config<P: AsRef<Path>>(path: P) -> Result<Z21Config, ConfigError> {
    if let Ok(contents) = std::fs::read_to_string(&path) {
        Ok(toml::from_str(&contents)?)
    } else {
        Ok(Z21Config::default())
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(Z21Config::default().port, 21105);
    }

    #[test]
    fn test_parse_config_missing_file_falls_back_to_default() {
        let config = parse_config("/nonexistent/lmrs-z21.toml").unwrap();
        assert_eq!(config.port, Z21Config::default().port);
    }

    #[test]
    fn test_parse_config_reads_overrides() {
        let dir = std::env::temp_dir();
        let path = dir.join("lmrs-z21-test-config.toml");
        std::fs::write(&path, "port = 12345\n").unwrap();
        let config = parse_config(&path).unwrap();
        assert_eq!(config.port, 12345);
        std::fs::remove_file(&path).ok();
    }
}
