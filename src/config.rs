//! Startup configuration of one plug device.
//!
//! Built either from the host's string parameters (`"1;2;3"`, `"1;2:3;4"`,
//! `"18;19;20"` or `"None"`) or deserialized from JSON.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::payload::{DpsIndex, MeterConfig};
use crate::protocol::Version;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;
const NONE: &str = "None";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlugConfig {
    pub address: String,
    pub device_id: String,
    #[serde(default)]
    pub local_key: String,
    #[serde(default)]
    pub version: Version,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dps")]
    pub dps: Vec<DpsIndex>,
    #[serde(default)]
    pub groups: Vec<Vec<DpsIndex>>,
    #[serde(default)]
    pub metering: Option<MeterConfig>,
    #[serde(default)]
    pub always_on: Vec<DpsIndex>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Heartbeats between two command cycles.
    #[serde(default = "default_poll_every")]
    pub poll_every: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Match replies to requests by sequence number.
    #[serde(default = "default_strict")]
    pub strict_correlation: bool,
    /// Immediate re-issues allowed after malformed replies.
    #[serde(default = "default_max_reissues")]
    pub max_reissues: u32,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_dps() -> Vec<DpsIndex> {
    vec![DpsIndex(1)]
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_poll_every() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_strict() -> bool {
    true
}

fn default_max_reissues() -> u32 {
    3
}

impl PlugConfig {
    pub fn new<A, I, K>(address: A, device_id: I, local_key: K) -> Self
    where
        A: Into<String>,
        I: Into<String>,
        K: Into<String>,
    {
        Self {
            address: address.into(),
            device_id: device_id.into(),
            local_key: local_key.into(),
            version: Version::default(),
            port: default_port(),
            dps: default_dps(),
            groups: Vec::new(),
            metering: None,
            always_on: Vec::new(),
            heartbeat_ms: default_heartbeat_ms(),
            poll_every: default_poll_every(),
            connect_timeout_ms: default_connect_timeout_ms(),
            strict_correlation: default_strict(),
            max_reissues: default_max_reissues(),
        }
    }

    /// Builds a validated configuration from the host's parameter strings.
    pub fn from_parameters(
        address: &str,
        device_id: &str,
        local_key: &str,
        dps: &str,
        groups: &str,
        metering: &str,
    ) -> Result<Self> {
        let config = Self::new(address, device_id, local_key)
            .with_dps(parse_index_list(dps)?)
            .with_groups(parse_groups(groups)?)
            .with_metering(parse_metering(metering)?);
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TuyaError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_dps(mut self, dps: Vec<DpsIndex>) -> Self {
        self.dps = dps;
        self
    }

    pub fn with_groups(mut self, groups: Vec<Vec<DpsIndex>>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_metering(mut self, metering: Option<MeterConfig>) -> Self {
        self.metering = metering;
        self
    }

    pub fn with_always_on(mut self, always_on: Vec<DpsIndex>) -> Self {
        self.always_on = always_on;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_poll_every(mut self, ticks: u32) -> Self {
        self.poll_every = ticks;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_strict_correlation(mut self, strict: bool) -> Self {
        self.strict_correlation = strict;
        self
    }

    pub fn with_max_reissues(mut self, max: u32) -> Self {
        self.max_reissues = max;
        self
    }

    pub fn has_key(&self) -> bool {
        !self.local_key.is_empty()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Dps indices of all switch plugs, sorted.
    pub fn switch_indices(&self) -> Vec<DpsIndex> {
        let mut dps = self.dps.clone();
        dps.sort();
        dps.dedup();
        dps
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TuyaError::InvalidConfig("address is empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(TuyaError::InvalidConfig("device id is empty".into()));
        }
        // 3.1 devices answer status queries in clear, so a keyless 3.1
        // config can still read state.
        if !(self.local_key.is_empty() && self.version == Version::V3_1) {
            TuyaCipher::new(self.local_key.as_bytes())?;
        }
        if self.dps.is_empty() {
            return Err(TuyaError::InvalidConfig("no switch dps configured".into()));
        }
        for group in &self.groups {
            if group.is_empty() {
                return Err(TuyaError::InvalidConfig("empty group".into()));
            }
            if let Some(missing) = group.iter().find(|i| !self.dps.contains(i)) {
                return Err(TuyaError::InvalidConfig(format!(
                    "group member {} is not a configured dps",
                    missing
                )));
            }
        }
        if let Some(missing) = self.always_on.iter().find(|i| !self.dps.contains(i)) {
            return Err(TuyaError::InvalidConfig(format!(
                "always-on dps {} is not a configured dps",
                missing
            )));
        }
        if self.heartbeat_ms == 0 || self.poll_every == 0 {
            return Err(TuyaError::InvalidConfig(
                "heartbeat interval and poll count must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Parses `"1;2;3"` into sorted, deduplicated indices.
pub fn parse_index_list(s: &str) -> Result<Vec<DpsIndex>> {
    let mut indices = s
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<DpsIndex>>>()?;
    indices.sort();
    indices.dedup();
    Ok(indices)
}

/// Parses `"1;2:3;4"` (colon between groups) or `"None"`.
pub fn parse_groups(s: &str) -> Result<Vec<Vec<DpsIndex>>> {
    let s = s.trim();
    if s.is_empty() || s == NONE {
        return Ok(Vec::new());
    }
    s.split(':').map(parse_index_list).collect()
}

/// Parses `"current;power;voltage"` ids or `"None"`.
pub fn parse_metering(s: &str) -> Result<Option<MeterConfig>> {
    let s = s.trim();
    if s.is_empty() || s == NONE {
        return Ok(None);
    }
    let ids = s
        .split(';')
        .map(str::parse)
        .collect::<Result<Vec<DpsIndex>>>()?;
    match ids.as_slice() {
        [current, power, voltage] => Ok(Some(MeterConfig::new(*current, *power, *voltage))),
        _ => Err(TuyaError::InvalidConfig(format!(
            "metering needs three dps ids, got '{}'",
            s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn parses_host_parameters() {
        let config =
            PlugConfig::from_parameters("192.168.1.20", "dev", KEY, "4;1;2;3", "1;2:3;4", "18;19;20")
                .unwrap();
        assert_eq!(config.dps, vec![DpsIndex(1), DpsIndex(2), DpsIndex(3), DpsIndex(4)]);
        assert_eq!(
            config.groups,
            vec![vec![DpsIndex(1), DpsIndex(2)], vec![DpsIndex(3), DpsIndex(4)]]
        );
        let meter = config.metering.unwrap();
        assert_eq!(meter.current, DpsIndex(18));
        assert_eq!(meter.voltage, DpsIndex(20));
        assert_eq!(config.port, 6668);
        assert_eq!(config.version, Version::V3_3);
    }

    #[test]
    fn none_means_absent() {
        let config =
            PlugConfig::from_parameters("10.0.0.2", "dev", KEY, "1", "None", "None").unwrap();
        assert!(config.groups.is_empty());
        assert!(config.metering.is_none());
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(parse_index_list("1;x").is_err());
        assert!(parse_metering("18;19").is_err());
        assert!(PlugConfig::from_parameters("10.0.0.2", "dev", "short", "1", "None", "None").is_err());
        assert!(PlugConfig::from_parameters("10.0.0.2", "dev", KEY, "1;2", "2;3", "None").is_err());
        assert!(PlugConfig::from_parameters("10.0.0.2", "dev", KEY, "", "None", "None").is_err());
    }

    #[test]
    fn key_is_optional_only_for_v31() {
        let keyless = PlugConfig::new("10.0.0.2", "dev", "");
        assert!(matches!(keyless.validate(), Err(TuyaError::InvalidConfig(_))));

        let keyless = keyless.with_version(Version::V3_1);
        assert!(keyless.validate().is_ok());
        assert!(!keyless.has_key());

        let short = PlugConfig::new("10.0.0.2", "dev", "short").with_version(Version::V3_1);
        assert!(short.validate().is_err());
    }

    #[test]
    fn json_uses_defaults() {
        let config = PlugConfig::from_json(
            r#"{"address":"10.0.0.2","device_id":"dev","local_key":"0123456789abcdef",
                "version":"3.1","dps":[1,2],"always_on":[2]}"#,
        )
        .unwrap();
        assert_eq!(config.version, Version::V3_1);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert!(config.strict_correlation);
        assert_eq!(config.always_on, vec![DpsIndex(2)]);
    }

    #[test]
    fn json_rejects_unknown_version() {
        let err = PlugConfig::from_json(
            r#"{"address":"a","device_id":"d","local_key":"0123456789abcdef","version":"3.4"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TuyaError::InvalidConfig(_)));
    }
}
