//! Dynamic loss scaling shared by several optimizer groups.
//!
//! The backward seed is multiplied by [`LossScaler::scale`]; before the
//! optimizer step the gradients are divided by it again and checked. A
//! non-finite gradient skips the step and halves the scale; a run of clean
//! steps doubles it.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Parameter;

/// Settings for [`LossScaler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub enabled: bool,
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    steps_since_growth: usize,
    enabled: bool,
    overflow_count: usize,
}

impl LossScaler {
    pub fn new(config: &ScalerConfig) -> Self {
        Self {
            scale: if config.enabled {
                config.initial_scale
            } else {
                1.0
            },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval.max(1),
            steps_since_growth: 0,
            enabled: config.enabled,
            overflow_count: 0,
        }
    }

    /// Scale fixed at 1 that never skips a step.
    pub fn disabled() -> Self {
        Self::new(&ScalerConfig::default())
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Divide every gradient by the scale.
    ///
    /// Returns `false` if any gradient is non-finite afterwards; the caller
    /// must then skip the optimizer step.
    pub fn unscale(&self, params: &mut [&mut Parameter]) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for p in params.iter_mut() {
            if let Some(grad) = &mut p.grad {
                if self.enabled {
                    for g in grad.data_mut() {
                        *g *= inv;
                    }
                }
                finite &= grad.is_finite();
            }
        }
        finite || !self.enabled
    }

    /// Record the outcome of a step and adjust the scale.
    pub fn update(&mut self, grads_finite: bool) {
        if !self.enabled {
            return;
        }
        if grads_finite {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
                debug!("loss scale grown to {}", self.scale);
            }
        } else {
            self.overflow_count += 1;
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
            debug!("non-finite gradients, loss scale backed off to {}", self.scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Tensor;

    fn enabled(interval: usize) -> LossScaler {
        LossScaler::new(&ScalerConfig {
            enabled: true,
            initial_scale: 8.0,
            growth_interval: interval,
            ..ScalerConfig::default()
        })
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let s = LossScaler::disabled();
        assert_eq!(s.scale(), 1.0);
        let mut p = Parameter::new(Tensor::from_slice(&[1.0]));
        p.grad = Some(Tensor::from_slice(&[f64::NAN]));
        assert!(s.unscale(&mut [&mut p]));
    }

    #[test]
    fn unscale_divides_gradients() {
        let s = enabled(10);
        let mut p = Parameter::new(Tensor::from_slice(&[0.0, 0.0]));
        p.grad = Some(Tensor::from_slice(&[8.0, -16.0]));
        assert!(s.unscale(&mut [&mut p]));
        assert_eq!(p.grad.unwrap().data(), &[1.0, -2.0]);
    }

    #[test]
    fn overflow_backs_off_and_floors_at_one() {
        let mut s = enabled(10);
        let mut p = Parameter::new(Tensor::from_slice(&[0.0]));
        p.grad = Some(Tensor::from_slice(&[f64::INFINITY]));
        let ok = s.unscale(&mut [&mut p]);
        assert!(!ok);
        s.update(ok);
        assert_eq!(s.scale(), 4.0);
        for _ in 0..5 {
            s.update(false);
        }
        assert_eq!(s.scale(), 1.0);
        assert_eq!(s.overflow_count(), 6);
    }

    #[test]
    fn grows_after_interval() {
        let mut s = enabled(3);
        s.update(true);
        s.update(true);
        assert_eq!(s.scale(), 8.0);
        s.update(true);
        assert_eq!(s.scale(), 16.0);
    }
}
