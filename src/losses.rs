//! Scalar losses and their gradients.
//!
//! Every function returns the loss value together with the gradient of that
//! value w.r.t. its (first) tensor argument, ready to seed a backward pass.

use funit_nn::Rng;
use funit_tensor::{ops, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::networks::GpPatchMcResDis;

/// Critic objective for the discriminator step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisLoss {
    /// `mean(D(fake)) - mean(D(real))`.
    #[default]
    Wasserstein,
    /// `mean(relu(1 - D(real))) + mean(relu(1 + D(fake)))`.
    Hinge,
}

/// Regulariser added to the discriminator loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GradientPenalty {
    None,
    /// WGAN-GP: `weight * mean_b (||grad_x D(x_hat_b)||_2 - 1)^2` on random
    /// interpolates between real and fake images.
    Interpolated { weight: f64 },
    /// R1: `weight * sum(grad_x mean D(x))^2 / B` on real images.
    R1 { weight: f64 },
}

impl Default for GradientPenalty {
    fn default() -> Self {
        Self::Interpolated { weight: 10.0 }
    }
}

impl GradientPenalty {
    /// Accumulate `grad_scale` times the penalty's parameter gradient into
    /// `dis` and return the penalty value.
    pub fn apply(
        self,
        dis: &mut GpPatchMcResDis,
        real: &Tensor,
        fake: &Tensor,
        labels: &[usize],
        rng: &mut Rng,
        grad_scale: f64,
    ) -> f64 {
        match self {
            Self::None => 0.0,
            Self::Interpolated { weight } => {
                dis.calc_gradient_penalty(real, fake, labels, weight, rng, grad_scale)
            }
            Self::R1 { weight } => dis.calc_grad2(real, labels, weight, grad_scale),
        }
    }
}

/// An adversarial term: value, fraction of "correct" responses, and the
/// gradient w.r.t. the response map.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvTerm {
    pub loss: f64,
    pub acc: f64,
    pub grad: Tensor,
}

/// Mean absolute error between `predict` and `target`.
///
/// Image predictions whose spatial size differs from the target are first
/// resized (nearest neighbour) to the target's size; the returned gradient is
/// w.r.t. the un-resized prediction.
pub fn recon_criterion(predict: &Tensor, target: &Tensor) -> (f64, Tensor) {
    let resized = predict.ndim() == 4 && predict.dims()[2..] != target.dims()[2..];
    let pred = if resized {
        debug!(
            "reconstruction target {} and prediction {} differ in size, resizing prediction",
            target.shape(),
            predict.shape()
        );
        let (_, _, h, w) = target.shape().as_nchw();
        ops::resize_nearest(predict, h, w)
    } else {
        predict.clone()
    };
    assert_eq!(
        pred.shape(),
        target.shape(),
        "recon_criterion: incompatible shapes"
    );

    let diff = pred.sub(target);
    let n = diff.numel() as f64;
    let loss = diff.abs().sum() / n;
    let grad = diff.map(|d| {
        if d > 0.0 {
            1.0 / n
        } else if d < 0.0 {
            -1.0 / n
        } else {
            0.0
        }
    });
    let grad = if resized {
        ops::resize_nearest_backward(&grad, predict.shape())
    } else {
        grad
    };
    (loss, grad)
}

/// `mean(relu(1 - r))`; correct when `r >= 0`.
pub fn dis_real_loss(resp: &Tensor) -> AdvTerm {
    let n = resp.numel() as f64;
    AdvTerm {
        loss: resp.map(|r| (1.0 - r).max(0.0)).mean(),
        acc: resp.fraction(|r| r >= 0.0),
        grad: resp.map(|r| if 1.0 - r > 0.0 { -1.0 / n } else { 0.0 }),
    }
}

/// `mean(relu(1 + f))`; correct when `f < 0`.
pub fn dis_fake_loss(resp: &Tensor) -> AdvTerm {
    let n = resp.numel() as f64;
    AdvTerm {
        loss: resp.map(|f| (1.0 + f).max(0.0)).mean(),
        acc: resp.fraction(|f| f < 0.0),
        grad: resp.map(|f| if 1.0 + f > 0.0 { 1.0 / n } else { 0.0 }),
    }
}

/// `-mean(f)`; correct when `f >= 0`.
pub fn gen_loss(resp: &Tensor) -> AdvTerm {
    let n = resp.numel() as f64;
    AdvTerm {
        loss: -resp.mean(),
        acc: resp.fraction(|f| f >= 0.0),
        grad: Tensor::full(resp.shape().clone(), -1.0 / n),
    }
}

/// Critic loss `mean(fake) - mean(real)` with gradients `(d_real, d_fake)`.
///
/// This is the negation of the `mean(real) - mean(fake)` the published FUNIT
/// trainer reports, so the critic minimises it like every other loss here.
pub fn wasserstein_loss(resp_real: &Tensor, resp_fake: &Tensor) -> (f64, Tensor, Tensor) {
    let loss = resp_fake.mean() - resp_real.mean();
    let grad_real = Tensor::full(resp_real.shape().clone(), -1.0 / resp_real.numel() as f64);
    let grad_fake = Tensor::full(resp_fake.shape().clone(), 1.0 / resp_fake.numel() as f64);
    (loss, grad_real, grad_fake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Shape;

    #[test]
    fn recon_same_size() {
        let p = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let t = Tensor::from_slice(&[1.0, 0.0, 5.0, 4.0]);
        let (loss, grad) = recon_criterion(&p, &t);
        assert!((loss - 1.0).abs() < 1e-12);
        assert_eq!(grad.data(), &[0.0, 0.25, -0.25, 0.0]);
    }

    #[test]
    fn recon_resizes_prediction_and_maps_gradient_back() {
        // 4x4 prediction against a 2x2 target: nearest picks rows/cols 0 and 2.
        let p = Tensor::from_fn(Shape::nchw(1, 1, 4, 4), |i| (i[2] * 4 + i[3]) as f64);
        let t = Tensor::zeros(Shape::nchw(1, 1, 2, 2));
        let (loss, grad) = recon_criterion(&p, &t);
        assert!((loss - (0.0 + 2.0 + 8.0 + 10.0) / 4.0).abs() < 1e-12);
        assert_eq!(grad.shape(), p.shape());
        assert!((grad.get(&[0, 0, 2, 2]) - 0.25).abs() < 1e-12);
        assert_eq!(grad.get(&[0, 0, 1, 1]), 0.0);
        // the zero-difference pixel gets no gradient
        assert_eq!(grad.get(&[0, 0, 0, 0]), 0.0);
    }

    #[test]
    fn hinge_terms_and_accuracies() {
        let resp = Tensor::from_slice(&[-2.0, -0.5, 0.5, 2.0]);
        let real = dis_real_loss(&resp);
        assert!((real.loss - (3.0 + 1.5 + 0.5 + 0.0) / 4.0).abs() < 1e-12);
        assert!((real.acc - 0.5).abs() < 1e-12);
        assert_eq!(real.grad.data(), &[-0.25, -0.25, -0.25, 0.0]);

        let fake = dis_fake_loss(&resp);
        assert!((fake.loss - (0.0 + 0.5 + 1.5 + 3.0) / 4.0).abs() < 1e-12);
        assert!((fake.acc - 0.5).abs() < 1e-12);
        assert_eq!(fake.grad.data(), &[0.0, 0.25, 0.25, 0.25]);
    }

    #[test]
    fn generator_term() {
        let resp = Tensor::from_slice(&[-1.0, 0.0, 3.0]);
        let g = gen_loss(&resp);
        assert!((g.loss + 2.0 / 3.0).abs() < 1e-12);
        assert!((g.acc - 2.0 / 3.0).abs() < 1e-12);
        assert!(g.grad.data().iter().all(|&v| (v + 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn wasserstein_sign_rewards_high_real_scores() {
        let real = Tensor::from_slice(&[2.0, 2.0]);
        let fake = Tensor::from_slice(&[-1.0, -1.0, -1.0]);
        let (loss, gr, gf) = wasserstein_loss(&real, &fake);
        assert!((loss + 3.0).abs() < 1e-12);
        assert!(gr.data().iter().all(|&v| v == -0.5));
        assert!(gf.data().iter().all(|&v| (v - 1.0 / 3.0).abs() < 1e-12));
    }

    #[test]
    fn penalty_yaml_shape() {
        let gp: GradientPenalty = serde_yaml::from_str("kind: r1\nweight: 2.5\n").unwrap();
        assert_eq!(gp, GradientPenalty::R1 { weight: 2.5 });
        let none: GradientPenalty = serde_yaml::from_str("kind: none\n").unwrap();
        assert_eq!(none, GradientPenalty::None);
    }
}
