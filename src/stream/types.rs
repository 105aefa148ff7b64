//! Wire-level frame types for the force-plate event stream.
//!
//! A [`RawFrame`] is one `jsonData` event exactly as the backend pushed it.
//! Frames are immutable once received; the aggregator shares them behind an
//! `Arc` between the history buffer and downstream snapshots.

use serde::{Deserialize, Serialize};

/// A 3-axis vector (force or moment).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A 2D point. On the wire COP is in metres, after scaling in millimetres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One per-sensor reading inside a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sensor name, e.g. `rear-right-outer` or the synthetic `Sum` entry
    #[serde(default)]
    pub name: String,
    /// Backend sub-identifier for the sensor, if any
    #[serde(default, alias = "id", alias = "subId", skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<String>,
    /// Force vector (N)
    #[serde(flatten)]
    pub force: Vec3,
    /// Scalar magnitude as reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
}

impl SensorReading {
    pub fn new(name: impl Into<String>, force: Vec3) -> Self {
        Self {
            name: name.into(),
            sub_id: None,
            force,
            magnitude: None,
        }
    }

    /// Reported magnitude, or the norm of the force vector when absent.
    pub fn magnitude(&self) -> f64 {
        self.magnitude.unwrap_or_else(|| self.force.norm())
    }

    /// Whether this is the backend's precomputed total.
    pub fn is_sum(&self) -> bool {
        self.name.trim().eq_ignore_ascii_case("sum")
    }
}

/// One ingestion event (`jsonData`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    /// Free-text device identifier, typically `<group>.<virtual name>`
    #[serde(alias = "device_id", default)]
    pub device_id: String,
    /// Monotonic timestamp in milliseconds
    #[serde(default)]
    pub time: i64,
    /// Per-device sequence number; wraps at `u32::MAX`
    #[serde(alias = "record_id", default)]
    pub record_id: u32,
    #[serde(default)]
    pub sensors: Vec<SensorReading>,
    #[serde(default)]
    pub moments: Vec3,
    #[serde(default)]
    pub cop: Point2D,
    #[serde(alias = "group_id", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Frames per second as reported by the backend
    #[serde(alias = "data_rate", default, skip_serializing_if = "Option::is_none")]
    pub data_rate: Option<f64>,
}

impl RawFrame {
    /// Group this frame belongs to.
    ///
    /// Uses the explicit `groupId` when present, otherwise the `deviceId`
    /// prefix before the first `.`.
    pub fn group_key(&self) -> String {
        if let Some(group) = self.group_id.as_deref().map(str::trim) {
            if !group.is_empty() {
                return group.to_string();
            }
        }
        match self.device_id.split_once('.') {
            Some((prefix, _)) => prefix.trim().to_string(),
            None => String::new(),
        }
    }
}

/// Canonical virtual-device role recovered from a free-text identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VirtualDeviceRole {
    LaunchZone,
    LandingZoneAggregate,
    Unidentified,
}

impl VirtualDeviceRole {
    pub fn label(&self) -> &'static str {
        match self {
            VirtualDeviceRole::LaunchZone => "Launch Zone",
            VirtualDeviceRole::LandingZoneAggregate => "Landing Zone",
            VirtualDeviceRole::Unidentified => "Unidentified",
        }
    }
}

impl std::fmt::Display for VirtualDeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
