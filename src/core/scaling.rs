//! Unit and coefficient scaling shared by live conditioning and the offline
//! gain engine.

use crate::stream::types::{Point2D, SensorReading, VirtualDeviceRole};

/// The eight load cells of a plate, in archive column order.
pub const SENSOR_LAYOUT: [&str; 8] = [
    "rear-right-outer",
    "rear-right-inner",
    "rear-left-outer",
    "rear-left-inner",
    "front-left-outer",
    "front-left-inner",
    "front-right-outer",
    "front-right-inner",
];

/// Millimetres per metre.
const MM_PER_M: f64 = 1000.0;

/// Distance along +Y from the launch plate centre to the landing-zone midpoint.
pub const LANDING_MID_Y_MM: f64 = 1402.6;

/// Denominators below this are treated as zero by [`pct_change`].
const PCT_CHANGE_MIN_BASE: f64 = 1e-9;

/// Total vertical force of a frame (signed, N).
///
/// Prefers the backend's `Sum` entry so totals are never double counted.
pub fn vertical_force(sensors: &[SensorReading]) -> f64 {
    match sensors.iter().find(|s| s.is_sum()) {
        Some(sum) => sum.force.z,
        None => sensors.iter().map(|s| s.force.z).sum(),
    }
}

/// |Fz| of a frame.
pub fn vertical_force_magnitude(sensors: &[SensorReading]) -> f64 {
    vertical_force(sensors).abs()
}

/// Where a virtual device sits in the shared display frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub invert_x: bool,
    pub offset_y_mm: f64,
}

impl Placement {
    pub const IDENTITY: Placement = Placement {
        invert_x: false,
        offset_y_mm: 0.0,
    };

    pub fn for_role(role: VirtualDeviceRole) -> Self {
        match role {
            VirtualDeviceRole::LaunchZone => Placement {
                invert_x: true,
                offset_y_mm: 0.0,
            },
            VirtualDeviceRole::LandingZoneAggregate => Placement {
                invert_x: true,
                offset_y_mm: LANDING_MID_Y_MM,
            },
            VirtualDeviceRole::Unidentified => Placement::IDENTITY,
        }
    }

    pub fn apply(&self, cop_mm: Point2D) -> Point2D {
        let x = if self.invert_x { -cop_mm.x } else { cop_mm.x };
        Point2D::new(x, cop_mm.y + self.offset_y_mm)
    }
}

/// Device-local COP (metres) to display-frame millimetres for `role`.
pub fn cop_to_display_mm(cop_m: Point2D, role: VirtualDeviceRole) -> Point2D {
    let mm = Point2D::new(cop_m.x * MM_PER_M, cop_m.y * MM_PER_M);
    Placement::for_role(role).apply(mm)
}

/// Per-sensor temperature scale: `1 - (room - t) * coef`.
pub fn temperature_scale_factor(coef: f64, room_temp_f: f64, sensor_temp_f: f64) -> f64 {
    1.0 - (room_temp_f - sensor_temp_f) * coef
}

/// Sum of absolute values.
pub fn l1_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v.abs()).sum()
}

/// Apply [`temperature_scale_factor`] to each sensor's z.
pub fn scale_sensors(z: &[f64], temps_f: &[f64], coef: f64, room_temp_f: f64) -> Vec<f64> {
    z.iter()
        .zip(temps_f.iter())
        .map(|(&z, &t)| z * temperature_scale_factor(coef, room_temp_f, t))
        .collect()
}

/// Percent change from `old` to `new`. `None` when `old` is effectively zero.
pub fn pct_change(new: f64, old: f64) -> Option<f64> {
    if !old.is_finite() || !new.is_finite() || old.abs() < PCT_CHANGE_MIN_BASE {
        return None;
    }
    Some((new - old) / old * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::types::Vec3;

    #[test]
    fn test_vertical_force_prefers_sum_entry() {
        let sensors = vec![
            SensorReading::new("a", Vec3::new(0.0, 0.0, -100.0)),
            SensorReading::new("b", Vec3::new(0.0, 0.0, -50.0)),
            SensorReading::new("Sum", Vec3::new(0.0, 0.0, -149.0)),
        ];
        assert_eq!(vertical_force(&sensors), -149.0);
        assert_eq!(vertical_force_magnitude(&sensors), 149.0);

        let no_sum = &sensors[..2];
        assert_eq!(vertical_force(no_sum), -150.0);
        assert_eq!(vertical_force(&[]), 0.0);
    }

    #[test]
    fn test_cop_placement_per_role() {
        let cop = Point2D::new(0.010, -0.020);
        let launch = cop_to_display_mm(cop, VirtualDeviceRole::LaunchZone);
        assert!((launch.x + 10.0).abs() < 1e-9);
        assert!((launch.y + 20.0).abs() < 1e-9);

        let landing = cop_to_display_mm(cop, VirtualDeviceRole::LandingZoneAggregate);
        assert!((landing.x + 10.0).abs() < 1e-9);
        assert!((landing.y - (LANDING_MID_Y_MM - 20.0)).abs() < 1e-9);

        let other = cop_to_display_mm(cop, VirtualDeviceRole::Unidentified);
        assert!((other.x - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_pct_change_matches_documented_example() {
        assert!((pct_change(11.0, 10.0).unwrap() - 10.0).abs() < 1e-12);
        assert!((pct_change(22.0, 20.0).unwrap() - 10.0).abs() < 1e-12);
        assert!(pct_change(1.0, 0.0).is_none());
        assert!(pct_change(f64::NAN, 1.0).is_none());
    }

    #[test]
    fn test_scale_factor_is_identity_at_room_temperature() {
        assert_eq!(temperature_scale_factor(0.005, 76.0, 76.0), 1.0);
        // 10 F colder than room with coef 0.01 -> 10% reduction
        assert!((temperature_scale_factor(0.01, 76.0, 66.0) - 0.9).abs() < 1e-12);

        let scaled = scale_sensors(&[100.0, -100.0], &[66.0, 86.0], 0.01, 76.0);
        assert!((scaled[0] - 90.0).abs() < 1e-9);
        assert!((scaled[1] + 110.0).abs() < 1e-9);
        assert!((l1_norm(&scaled) - 200.0).abs() < 1e-9);
    }
}
