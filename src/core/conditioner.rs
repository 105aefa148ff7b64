//! Signal conditioning for live display.
//!
//! Turns a device snapshot into display-ready scalars:
//! - noise gate on |Fz| (COP held while the plate is unloaded)
//! - EWMA smoothing of COP.x, COP.y and |Fz|
//! - COP marker radius mapping
//!
//! The only state is the per-device [`SmoothingState`], owned by the
//! aggregator's `DeviceState`.

use serde::{Deserialize, Serialize};

use crate::core::dynamo::ConfigValueError;
use crate::stream::types::{Point2D, VirtualDeviceRole};

/// Incremental EWMA step. The first sample initializes the average directly.
pub fn ewma(prev: Option<f64>, new: f64, alpha: f64) -> f64 {
    match prev {
        Some(avg) => alpha * new + (1.0 - alpha) * avg,
        None => new,
    }
}

/// Per-device smoothing accumulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmoothingState {
    /// Smoothed COP (display mm); `None` until the first loaded sample
    pub cop: Option<Point2D>,
    /// Smoothed |Fz| (N); `None` until the first sample
    pub fz: Option<f64>,
}

impl SmoothingState {
    pub fn is_initialized(&self) -> bool {
        self.fz.is_some()
    }

    pub fn reset(&mut self) {
        self.cop = None;
        self.fz = None;
    }
}

/// Marker radius mapping: `clamp(k * fz, r_min, r_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadiusMapping {
    /// Pixels per Newton
    pub scale_k: f64,
    pub r_min_px: f64,
    pub r_max_px: f64,
}

impl Default for RadiusMapping {
    fn default() -> Self {
        Self {
            scale_k: 0.01,
            r_min_px: 4.0,
            r_max_px: 40.0,
        }
    }
}

impl RadiusMapping {
    pub fn radius(&self, smoothed_fz: f64) -> f64 {
        let raw = self.scale_k * smoothed_fz;
        if raw.is_nan() {
            return self.r_min_px;
        }
        raw.clamp(self.r_min_px, self.r_max_px)
    }
}

/// Conditioner parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionerConfig {
    /// EWMA decay, in (0, 1]
    pub alpha: f64,
    /// Samples with |Fz| below this are treated as zero-force (N)
    pub fz_threshold_n: f64,
    pub radius: RadiusMapping,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            fz_threshold_n: 22.0,
            radius: RadiusMapping::default(),
        }
    }
}

/// Display-ready output for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionedSample {
    pub role: VirtualDeviceRole,
    /// Smoothed COP in display mm; `None` until the plate has been loaded once
    pub cop_mm: Option<Point2D>,
    /// Smoothed |Fz| (N)
    pub fz_n: f64,
    /// Whether this frame passed the noise gate
    pub loaded: bool,
    pub radius_px: f64,
}

/// Stateless conditioner; all per-device state is passed in.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    config: ConditionerConfig,
}

impl SignalConditioner {
    pub fn new(config: ConditionerConfig) -> Result<Self, ConfigValueError> {
        validate_alpha(config.alpha)?;
        validate_scale(config.radius.scale_k)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ConditionerConfig {
        &self.config
    }

    /// Adjust the marker scale factor at runtime.
    pub fn set_scale(&mut self, scale_k: f64) -> Result<(), ConfigValueError> {
        validate_scale(scale_k)?;
        self.config.radius.scale_k = scale_k;
        Ok(())
    }

    /// Condition one sample.
    ///
    /// `cop_mm` must already be in display millimetres.
    pub fn condition(
        &self,
        role: VirtualDeviceRole,
        cop_mm: Point2D,
        fz_magnitude: f64,
        state: &mut SmoothingState,
    ) -> ConditionedSample {
        let alpha = self.config.alpha;
        let loaded = fz_magnitude.abs() >= self.config.fz_threshold_n;
        let effective_fz = if loaded { fz_magnitude.abs() } else { 0.0 };

        let fz = ewma(state.fz, effective_fz, alpha);
        state.fz = Some(fz);

        if loaded {
            let cop = match state.cop {
                Some(prev) => Point2D::new(
                    ewma(Some(prev.x), cop_mm.x, alpha),
                    ewma(Some(prev.y), cop_mm.y, alpha),
                ),
                None => cop_mm,
            };
            state.cop = Some(cop);
        }

        ConditionedSample {
            role,
            cop_mm: state.cop,
            fz_n: fz,
            loaded,
            radius_px: self.config.radius.radius(fz),
        }
    }
}

fn validate_alpha(alpha: f64) -> Result<(), ConfigValueError> {
    if alpha > 0.0 && alpha <= 1.0 {
        Ok(())
    } else {
        Err(ConfigValueError::OutOfRangeF64 {
            field: "alpha",
            value: alpha,
            min: 0.0,
            max: 1.0,
        })
    }
}

fn validate_scale(scale_k: f64) -> Result<(), ConfigValueError> {
    if scale_k.is_finite() && scale_k >= 0.0 {
        Ok(())
    } else {
        Err(ConfigValueError::OutOfRangeF64 {
            field: "scale_k",
            value: scale_k,
            min: 0.0,
            max: f64::MAX,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditioner(alpha: f64) -> SignalConditioner {
        SignalConditioner::new(ConditionerConfig {
            alpha,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_first_sample_initializes_without_lag() {
        let c = conditioner(0.2);
        let mut state = SmoothingState::default();
        let out = c.condition(
            VirtualDeviceRole::LaunchZone,
            Point2D::new(12.5, -3.0),
            800.0,
            &mut state,
        );
        assert_eq!(out.fz_n, 800.0);
        assert_eq!(out.cop_mm, Some(Point2D::new(12.5, -3.0)));
        assert!(out.loaded);
    }

    #[test]
    fn test_constant_input_converges() {
        let c = conditioner(0.2);
        let mut state = SmoothingState::default();
        c.condition(VirtualDeviceRole::LaunchZone, Point2D::new(0.0, 0.0), 100.0, &mut state);
        let mut out = None;
        for _ in 0..200 {
            out = Some(c.condition(
                VirtualDeviceRole::LaunchZone,
                Point2D::new(50.0, 25.0),
                600.0,
                &mut state,
            ));
        }
        let out = out.unwrap();
        assert!((out.fz_n - 600.0).abs() < 1e-6);
        let cop = out.cop_mm.unwrap();
        assert!((cop.x - 50.0).abs() < 1e-6);
        assert!((cop.y - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_ewma_update_rule() {
        assert_eq!(ewma(None, 5.0, 0.3), 5.0);
        assert!((ewma(Some(10.0), 20.0, 0.25) - 12.5).abs() < 1e-12);
        assert_eq!(ewma(Some(10.0), 20.0, 1.0), 20.0);
    }

    #[test]
    fn test_noise_gate_holds_cop() {
        let c = conditioner(0.5);
        let mut state = SmoothingState::default();
        c.condition(VirtualDeviceRole::LaunchZone, Point2D::new(10.0, 10.0), 500.0, &mut state);

        let out = c.condition(
            VirtualDeviceRole::LaunchZone,
            Point2D::new(-90.0, 300.0),
            5.0,
            &mut state,
        );
        assert!(!out.loaded);
        assert_eq!(out.cop_mm, Some(Point2D::new(10.0, 10.0)));
        // Gated samples feed zero force into the average
        assert!((out.fz_n - 250.0).abs() < 1e-12);
    }

    #[test]
    fn test_gated_first_sample_has_no_cop() {
        let c = conditioner(0.2);
        let mut state = SmoothingState::default();
        let out = c.condition(VirtualDeviceRole::LaunchZone, Point2D::new(1.0, 1.0), 3.0, &mut state);
        assert_eq!(out.cop_mm, None);
        assert_eq!(out.fz_n, 0.0);
        assert_eq!(out.radius_px, RadiusMapping::default().r_min_px);
    }

    #[test]
    fn test_radius_is_monotonic_and_bounded() {
        let mapping = RadiusMapping::default();
        let mut prev = f64::MIN;
        for i in 0..=1000 {
            let fz = i as f64 * 10.0;
            let r = mapping.radius(fz);
            assert!(r >= mapping.r_min_px && r <= mapping.r_max_px);
            assert!(r >= prev);
            prev = r;
        }
        assert_eq!(mapping.radius(-50.0), mapping.r_min_px);
        assert_eq!(mapping.radius(f64::NAN), mapping.r_min_px);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert!(SignalConditioner::new(ConditionerConfig {
            alpha: 0.0,
            ..Default::default()
        })
        .is_err());
        assert!(SignalConditioner::new(ConditionerConfig {
            alpha: 1.5,
            ..Default::default()
        })
        .is_err());

        let mut c = conditioner(1.0);
        assert!(c.set_scale(-1.0).is_err());
        assert!(c.set_scale(0.02).is_ok());
        assert_eq!(c.config().radius.scale_k, 0.02);
    }
}
