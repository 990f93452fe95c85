//! JSON payloads exchanged with the device and the sparse `dps` map.

use crate::error::{Result, TuyaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const JSON_START: &[u8] = b"{\"devId";
const JSON_END: &[u8] = b"}}";

/// Index of a data point in the device's `dps` map (`"1"`, `"18"`, ...).
///
/// Serialized as the string key the device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DpsIndex(pub u32);

impl fmt::Display for DpsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DpsIndex {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.parse::<u32>() {
            Ok(n) if n > 0 => Ok(DpsIndex(n)),
            _ => Err(TuyaError::InvalidConfig(format!(
                "'{}' is not a data point index",
                trimmed
            ))),
        }
    }
}

impl From<u32> for DpsIndex {
    fn from(n: u32) -> Self {
        DpsIndex(n)
    }
}

/// Sparse data point map as reported by the device. Absent keys mean
/// "unknown", never zero.
pub type Dps = BTreeMap<DpsIndex, Value>;

#[derive(Deserialize)]
struct StatusPayload {
    dps: Dps,
}

#[derive(Serialize)]
struct RequestPayload<'a> {
    #[serde(rename = "gwId")]
    gw_id: &'a str,
    #[serde(rename = "devId")]
    dev_id: &'a str,
    uid: &'a str,
    t: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dps: Option<&'a BTreeMap<DpsIndex, bool>>,
}

/// Extract the `dps` map from a decrypted status payload.
///
/// Falls back to the first `{"devId ... }}` object when the bytes carry
/// extra data around the JSON.
pub fn parse_status(data: &[u8]) -> Result<Dps> {
    match serde_json::from_slice::<StatusPayload>(data) {
        Ok(status) => Ok(status.dps),
        Err(err) => {
            let sniffed = sniff_status_object(data).ok_or_else(|| classify(err))?;
            serde_json::from_slice::<StatusPayload>(sniffed)
                .map(|status| status.dps)
                .map_err(classify)
        }
    }
}

fn classify(err: serde_json::Error) -> TuyaError {
    // Valid JSON without a usable `dps` field vs. broken JSON.
    if err.is_data() {
        TuyaError::InvalidPayload
    } else {
        TuyaError::from(err)
    }
}

fn sniff_status_object(data: &[u8]) -> Option<&[u8]> {
    let start = data
        .windows(JSON_START.len())
        .position(|w| w == JSON_START)?;
    let rest = &data[start..];
    let end = rest.windows(JSON_END.len()).position(|w| w == JSON_END)?;
    Some(&rest[..end + JSON_END.len()])
}

/// Build the JSON body of a `Control` request.
pub fn build_set_payload(device_id: &str, dps: &BTreeMap<DpsIndex, bool>, t: u64) -> Result<Vec<u8>> {
    let payload = RequestPayload {
        gw_id: device_id,
        dev_id: device_id,
        uid: device_id,
        t: t.to_string(),
        dps: Some(dps),
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Build the JSON body of a `DpQuery` request.
pub fn build_status_request(device_id: &str, t: u64) -> Result<Vec<u8>> {
    let payload = RequestPayload {
        gw_id: device_id,
        dev_id: device_id,
        uid: device_id,
        t: t.to_string(),
        dps: None,
    };
    Ok(serde_json::to_vec(&payload)?)
}

/// Switch state of a data point value; devices report booleans, some older
/// firmwares 0/1.
pub fn switch_state(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_u64().and_then(|n| match n {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }),
        _ => None,
    }
}

/// Data point indices and scaling of the metering channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    pub current: DpsIndex,
    pub power: DpsIndex,
    pub voltage: DpsIndex,
    #[serde(default = "default_current_divisor")]
    pub current_divisor: f64,
    #[serde(default = "default_tenths")]
    pub power_divisor: f64,
    #[serde(default = "default_tenths")]
    pub voltage_divisor: f64,
}

fn default_current_divisor() -> f64 {
    1000.0
}

fn default_tenths() -> f64 {
    10.0
}

impl MeterConfig {
    /// Metering on the given indices with the usual scaling
    /// (mA, tenths of W, tenths of V).
    pub fn new(current: DpsIndex, power: DpsIndex, voltage: DpsIndex) -> Self {
        Self {
            current,
            power,
            voltage,
            current_divisor: default_current_divisor(),
            power_divisor: default_tenths(),
            voltage_divisor: default_tenths(),
        }
    }
}

/// Scaled metering values. A channel missing from the report stays `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeterReading {
    /// Amperes
    pub current: Option<f64>,
    /// Watts
    pub power: Option<f64>,
    /// Volts
    pub voltage: Option<f64>,
}

impl MeterReading {
    pub fn from_dps(dps: &Dps, config: &MeterConfig) -> Self {
        let scaled = |index: DpsIndex, divisor: f64| {
            dps.get(&index)
                .and_then(Value::as_f64)
                .map(|raw| raw / divisor)
        };
        Self {
            current: scaled(config.current, config.current_divisor),
            power: scaled(config.power, config.power_divisor),
            voltage: scaled(config.voltage, config.voltage_divisor),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.power.is_none() && self.voltage.is_none()
    }
}
