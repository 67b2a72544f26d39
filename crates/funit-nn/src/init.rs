//! Network-wide weight initialisation and parameter averaging.

use serde::{Deserialize, Serialize};

use crate::parameter::{fan_in, fan_out, normal_tensor};
use crate::Module;

/// How weights are re-drawn by [`apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Init {
    /// `N(0, 2 / fan_in)`.
    #[default]
    Kaiming,
    /// `N(0, 2 * 2 / (fan_in + fan_out))`, i.e. gain `sqrt(2)`.
    Xavier,
    /// `N(0, 0.02^2)`.
    Gaussian,
    Zeros,
}

/// Re-initialise every weight (`*weight`, at least 2-D) and zero every bias.
///
/// Each parameter gets its own seed derived from `seed` and its position.
pub fn apply(module: &mut dyn Module, init: Init, seed: u64) {
    for (i, (name, p)) in module.named_parameters_mut().into_iter().enumerate() {
        let shape = p.shape().clone();
        if name.ends_with("bias") {
            p.data = p.data.zeros_like();
        } else if name.ends_with("weight") && shape.ndim() >= 2 {
            let std = match init {
                Init::Kaiming => (2.0 / fan_in(&shape) as f64).sqrt(),
                Init::Xavier => (4.0 / (fan_in(&shape) + fan_out(&shape)) as f64).sqrt(),
                Init::Gaussian => 0.02,
                Init::Zeros => 0.0,
            };
            let param_seed = seed.wrapping_mul(0x9E37_79B9).wrapping_add(i as u64);
            p.data = normal_tensor(shape, std, param_seed);
        }
    }
}

/// Exponential moving average of parameters:
/// `target = beta * target + (1 - beta) * source`.
///
/// Both modules must have the same architecture; parameters are matched by
/// position.
pub fn ema_update(target: &mut dyn Module, source: &dyn Module, beta: f64) {
    let src = source.parameters();
    let dst = target.parameters_mut();
    assert_eq!(
        src.len(),
        dst.len(),
        "EMA between modules with different parameter counts"
    );
    for (t, s) in dst.into_iter().zip(src) {
        assert_eq!(t.shape(), s.shape(), "EMA parameter shape mismatch");
        for (tv, sv) in t.data.data_mut().iter_mut().zip(s.data.data()) {
            *tv = beta * *tv + (1.0 - beta) * sv;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Conv2d, Linear};

    #[test]
    fn apply_zeroes_biases_and_redraws_weights() {
        let mut conv = Conv2d::new(2, 4, 3, 1, true, 1);
        if let Some(b) = &mut conv.bias {
            b.data = b.data.add_scalar(1.0);
        }
        let before = conv.weight.data.clone();
        apply(&mut conv, Init::Gaussian, 9);
        assert_ne!(conv.weight.data, before);
        assert!(conv.weight.data.max_abs() < 0.2);
        assert!(conv.bias.as_ref().unwrap().data.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn zeros_init_clears_weights() {
        let mut fc = Linear::new(3, 2, 4);
        apply(&mut fc, Init::Zeros, 0);
        assert_eq!(fc.weight.data.max_abs(), 0.0);
    }

    #[test]
    fn ema_moves_toward_source() {
        let mut target = Linear::new(2, 2, 1);
        let source = Linear::new(2, 2, 2);
        let t0 = target.weight.data.get(&[0, 0]);
        let s0 = source.weight.data.get(&[0, 0]);
        ema_update(&mut target, &source, 0.75);
        let expected = 0.75 * t0 + 0.25 * s0;
        assert!((target.weight.data.get(&[0, 0]) - expected).abs() < 1e-12);
    }

    #[test]
    fn ema_with_beta_zero_copies() {
        let mut target = Linear::new(3, 1, 5);
        let source = Linear::new(3, 1, 6);
        ema_update(&mut target, &source, 0.0);
        assert_eq!(target.state_dict(), source.state_dict());
    }
}
