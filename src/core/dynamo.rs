//! Mirror of the backend's rate configuration and local rate validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Valid sampling rate range (Hz). `-1` means "backend default".
pub const SAMPLING_RATE_RANGE: (i32, i32) = (-1, 1200);

/// Valid emission rate range (Hz). `-1` means "backend default".
pub const EMISSION_RATE_RANGE: (i32, i32) = (-1, 500);

/// A configuration value rejected before it reached the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValueError {
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    OutOfRangeF64 {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    Blank {
        field: &'static str,
    },
}

impl std::fmt::Display for ConfigValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValueError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{field} = {value} outside allowed range [{min}, {max}]"),
            ConfigValueError::OutOfRangeF64 {
                field,
                value,
                min,
                max,
            } => write!(f, "{field} = {value} outside allowed range [{min}, {max}]"),
            ConfigValueError::Blank { field } => write!(f, "{field} must not be blank"),
        }
    }
}

impl std::error::Error for ConfigValueError {}

fn validate_range(field: &'static str, value: i32, range: (i32, i32)) -> Result<i32, ConfigValueError> {
    if value < range.0 || value > range.1 {
        return Err(ConfigValueError::OutOfRange {
            field,
            value: value as i64,
            min: range.0 as i64,
            max: range.1 as i64,
        });
    }
    Ok(value)
}

pub fn validate_sampling_rate(rate: i32) -> Result<i32, ConfigValueError> {
    validate_range("samplingRate", rate, SAMPLING_RATE_RANGE)
}

pub fn validate_emission_rate(rate: i32) -> Result<i32, ConfigValueError> {
    validate_range("emissionRate", rate, EMISSION_RATE_RANGE)
}

/// Process-wide view of the backend's rate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamoConfig {
    pub sampling_rate: i32,
    pub emission_rate: i32,
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            sampling_rate: -1,
            emission_rate: -1,
        }
    }
}

impl DynamoConfig {
    /// Decode a `getDynamoConfigStatus` payload.
    ///
    /// Returns `None` unless `status == "success"`. Missing or null rates
    /// read as `-1`.
    pub fn from_status(payload: &Value) -> Option<Self> {
        if payload.get("status").and_then(Value::as_str) != Some("success") {
            return None;
        }
        let data = payload.get("data")?;
        let read = |key: &str| -> i32 {
            data.get(key)
                .and_then(|v| v.as_f64())
                .map(|v| v as i32)
                .unwrap_or(-1)
        };
        Some(Self {
            sampling_rate: read("samplingRate"),
            emission_rate: read("emissionRate"),
        })
    }
}
