//! Angle Estimator: calibrated, smoothed tilt from raw IMU samples.

use std::time::Instant;

use crate::error::BalanceError;

/// Fusion strategy. `alpha` is always the weight kept on history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionMode {
    /// `filtered = raw + mounting_offset`.
    Direct,
    /// `filtered = alpha * (prev + rate * dt) + (1 - alpha) * corrected`.
    Complementary { alpha: f32 },
    /// Independent exponential smoothing of tilt and rate.
    LowPass { alpha: f32, rate_alpha: f32 },
}

impl FusionMode {
    /// Whether each tick must also read the pitch rate.
    pub fn needs_rate(&self) -> bool {
        !matches!(self, FusionMode::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltEstimate {
    /// Uncorrected sensor sample, degrees.
    pub raw_angle: f32,
    /// Calibrated and fused tilt, degrees.
    pub filtered_angle: f32,
    /// Pitch rate in deg/s when it was sampled (smoothed in low-pass mode).
    pub angular_rate: Option<f32>,
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct AngleEstimator {
    mode: FusionMode,
    mounting_offset: f32,
    angle: Option<f32>,
    rate: Option<f32>,
}

impl AngleEstimator {
    pub fn new(mode: FusionMode, mounting_offset: f32) -> Self {
        Self {
            mode,
            mounting_offset,
            angle: None,
            rate: None,
        }
    }

    pub fn mode(&self) -> FusionMode {
        self.mode
    }

    pub fn needs_rate(&self) -> bool {
        self.mode.needs_rate()
    }

    /// Fuse one sample. `dt` is the measured time since the previous call in
    /// seconds; a non-positive `dt` disables rate integration for this call.
    /// Non-finite samples are a hardware fault.
    pub fn estimate(
        &mut self,
        raw_tilt: f32,
        raw_rate: Option<f32>,
        dt: f32,
        timestamp: Instant,
    ) -> Result<TiltEstimate, BalanceError> {
        if !raw_tilt.is_finite() {
            return Err(BalanceError::HardwareFault(format!(
                "non-finite tilt sample {raw_tilt}"
            )));
        }
        if let Some(r) = raw_rate
            && !r.is_finite()
        {
            return Err(BalanceError::HardwareFault(format!(
                "non-finite rate sample {r}"
            )));
        }

        let corrected = raw_tilt + self.mounting_offset;
        let dt = if dt.is_finite() && dt > 0.0 { dt } else { 0.0 };

        let (filtered, rate) = match self.mode {
            FusionMode::Direct => (corrected, raw_rate),
            FusionMode::Complementary { alpha } => {
                let filtered = match self.angle {
                    None => corrected,
                    Some(prev) => {
                        let predicted = prev + raw_rate.unwrap_or(0.0) * dt;
                        alpha * predicted + (1.0 - alpha) * corrected
                    }
                };
                (filtered, raw_rate)
            }
            FusionMode::LowPass { alpha, rate_alpha } => {
                let filtered = match self.angle {
                    None => corrected,
                    Some(prev) => alpha * prev + (1.0 - alpha) * corrected,
                };
                let rate = match (self.rate, raw_rate) {
                    (Some(prev), Some(r)) => Some(rate_alpha * prev + (1.0 - rate_alpha) * r),
                    (None, r) => r,
                    (prev, None) => prev,
                };
                (filtered, rate)
            }
        };

        self.angle = Some(filtered);
        self.rate = rate;
        Ok(TiltEstimate {
            raw_angle: raw_tilt,
            filtered_angle: filtered,
            angular_rate: rate,
            timestamp,
        })
    }

    /// Drop fused history; the next sample re-initialises the filter.
    pub fn reset(&mut self) {
        self.angle = None;
        self.rate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn direct_applies_mounting_offset_only() {
        let mut e = AngleEstimator::new(FusionMode::Direct, -13.2);
        let est = e.estimate(15.0, None, 0.01, now()).unwrap();
        assert_eq!(est.raw_angle, 15.0);
        assert!((est.filtered_angle - 1.8).abs() < 1e-5);
        let est = e.estimate(13.2, Some(4.0), 0.01, now()).unwrap();
        assert!(est.filtered_angle.abs() < 1e-5);
        assert_eq!(est.angular_rate, Some(4.0));
    }

    #[test]
    fn complementary_initialises_to_first_sample() {
        let mut e = AngleEstimator::new(FusionMode::Complementary { alpha: 0.98 }, 0.0);
        let est = e.estimate(10.0, Some(100.0), 0.01, now()).unwrap();
        assert_eq!(est.filtered_angle, 10.0);
    }

    #[test]
    fn complementary_uses_supplied_dt() {
        let mut e = AngleEstimator::new(FusionMode::Complementary { alpha: 0.5 }, 0.0);
        e.estimate(0.0, Some(0.0), 0.0, now()).unwrap();
        // prev 0 + rate 10 * dt 0.2 = 2, blended 50/50 with raw 0 => 1
        let est = e.estimate(0.0, Some(10.0), 0.2, now()).unwrap();
        assert!((est.filtered_angle - 1.0).abs() < 1e-6);

        let mut e2 = AngleEstimator::new(FusionMode::Complementary { alpha: 0.5 }, 0.0);
        e2.estimate(0.0, Some(0.0), 0.0, now()).unwrap();
        let est2 = e2.estimate(0.0, Some(10.0), 0.02, now()).unwrap();
        assert!((est2.filtered_angle - 0.1).abs() < 1e-6);
    }

    #[test]
    fn complementary_non_positive_dt_blends_without_integration() {
        let mut e = AngleEstimator::new(FusionMode::Complementary { alpha: 0.5 }, 0.0);
        e.estimate(4.0, Some(0.0), 0.01, now()).unwrap();
        let est = e.estimate(0.0, Some(1000.0), -1.0, now()).unwrap();
        assert!((est.filtered_angle - 2.0).abs() < 1e-6);
    }

    #[test]
    fn low_pass_smooths_tilt_and_rate_independently() {
        let mut e = AngleEstimator::new(
            FusionMode::LowPass {
                alpha: 0.75,
                rate_alpha: 0.5,
            },
            0.0,
        );
        e.estimate(0.0, Some(0.0), 0.01, now()).unwrap();
        let est = e.estimate(8.0, Some(4.0), 0.01, now()).unwrap();
        assert!((est.filtered_angle - 2.0).abs() < 1e-6);
        assert_eq!(est.angular_rate, Some(2.0));
    }

    #[test]
    fn non_finite_sample_is_a_hardware_fault() {
        let mut e = AngleEstimator::new(FusionMode::Direct, 0.0);
        assert!(matches!(
            e.estimate(f32::NAN, None, 0.01, now()),
            Err(BalanceError::HardwareFault(_))
        ));
        let mut e = AngleEstimator::new(FusionMode::Complementary { alpha: 0.9 }, 0.0);
        assert!(matches!(
            e.estimate(1.0, Some(f32::INFINITY), 0.01, now()),
            Err(BalanceError::HardwareFault(_))
        ));
    }
}
