//! Per-instance normalisation layers.
//!
//! Both layers normalise every `(sample, channel)` plane with its own mean and
//! biased variance. [`AdaptiveInstanceNorm2d`] then applies a per-sample
//! affine transform whose parameters are assigned from outside the layer (by
//! the generator's style MLP) instead of being learned by the layer itself.

use crate::{Module, Parameter};
use funit_tensor::Tensor;

const EPS: f64 = 1e-5;

/// Normalised planes plus `1 / sqrt(var + eps)` per plane.
struct PlaneStats {
    x_hat: Tensor,
    inv_std: Vec<f64>,
}

fn normalize_planes(input: &Tensor, eps: f64) -> PlaneStats {
    let (n, c, h, w) = input.shape().as_nchw();
    let hw = h * w;
    let x = input.data();
    let mut out = Vec::with_capacity(x.len());
    let mut inv_std = Vec::with_capacity(n * c);

    for plane in x.chunks_exact(hw) {
        let mean = plane.iter().sum::<f64>() / hw as f64;
        let var = plane.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / hw as f64;
        let inv = 1.0 / (var + eps).sqrt();
        out.extend(plane.iter().map(|v| (v - mean) * inv));
        inv_std.push(inv);
    }
    PlaneStats {
        x_hat: Tensor::new(out, input.shape().clone()),
        inv_std,
    }
}

/// Gradient through the normalisation given the gradient w.r.t. `x_hat`.
fn normalize_planes_backward(grad_x_hat: &Tensor, stats: &PlaneStats) -> Tensor {
    let (_, _, h, w) = grad_x_hat.shape().as_nchw();
    let hw = h * w;
    let m = hw as f64;
    let mut out = Vec::with_capacity(grad_x_hat.numel());

    for ((g, xh), &inv) in grad_x_hat
        .data()
        .chunks_exact(hw)
        .zip(stats.x_hat.data().chunks_exact(hw))
        .zip(&stats.inv_std)
    {
        let g_mean = g.iter().sum::<f64>() / m;
        let gx_mean = g.iter().zip(xh).map(|(a, b)| a * b).sum::<f64>() / m;
        out.extend(
            g.iter()
                .zip(xh)
                .map(|(gv, xv)| inv * (gv - g_mean - xv * gx_mean)),
        );
    }
    Tensor::new(out, grad_x_hat.shape().clone())
}

/// Instance normalisation without affine parameters.
pub struct InstanceNorm2d {
    pub num_features: usize,
    pub eps: f64,
    cached: Option<PlaneStats>,
}

impl InstanceNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: EPS,
            cached: None,
        }
    }
}

impl Module for InstanceNorm2d {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let stats = normalize_planes(input, self.eps);
        let out = stats.x_hat.clone();
        self.cached = Some(stats);
        out
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let stats = self
            .cached
            .as_ref()
            .expect("must call forward before backward");
        normalize_planes_backward(grad_output, stats)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Instance normalisation followed by an externally assigned per-sample affine.
///
/// Call [`assign`](Self::assign) with `[batch, num_features]` weight and bias
/// before `forward`; after `backward`, [`param_grads`](Self::param_grads)
/// holds the gradients w.r.t. those assigned tensors.
pub struct AdaptiveInstanceNorm2d {
    pub num_features: usize,
    pub eps: f64,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    cached: Option<PlaneStats>,
    grads: Option<(Tensor, Tensor)>,
}

impl AdaptiveInstanceNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: EPS,
            weight: None,
            bias: None,
            cached: None,
            grads: None,
        }
    }

    /// Set the affine parameters, each `[batch, num_features]`.
    pub fn assign(&mut self, weight: Tensor, bias: Tensor) {
        assert_eq!(weight.ndim(), 2, "AdaIN weight must be [batch, features]");
        assert_eq!(weight.shape()[1], self.num_features);
        assert_eq!(weight.shape(), bias.shape(), "AdaIN weight/bias shapes differ");
        self.weight = Some(weight);
        self.bias = Some(bias);
        self.grads = None;
    }

    /// Gradients `(d_weight, d_bias)` from the last backward pass.
    pub fn param_grads(&self) -> Option<(&Tensor, &Tensor)> {
        self.grads.as_ref().map(|(w, b)| (w, b))
    }
}

impl Module for AdaptiveInstanceNorm2d {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let (n, c, h, w) = input.shape().as_nchw();
        let (weight, bias) = match (&self.weight, &self.bias) {
            (Some(w), Some(b)) => (w, b),
            _ => panic!("AdaIN parameters must be assigned before forward"),
        };
        assert_eq!(c, self.num_features, "AdaIN channel count mismatch");
        assert_eq!(
            weight.shape()[0],
            n,
            "AdaIN parameters assigned for a different batch size"
        );

        let stats = normalize_planes(input, self.eps);
        let hw = h * w;
        let mut out = Vec::with_capacity(input.numel());
        for (plane, xh) in stats.x_hat.data().chunks_exact(hw).enumerate() {
            let (g, b) = (weight.data()[plane], bias.data()[plane]);
            out.extend(xh.iter().map(|v| v * g + b));
        }
        self.cached = Some(stats);
        Tensor::new(out, input.shape().clone())
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let stats = self
            .cached
            .as_ref()
            .expect("must call forward before backward");
        let weight = self
            .weight
            .as_ref()
            .expect("AdaIN parameters must be assigned before backward");
        let (_, _, h, w) = grad_output.shape().as_nchw();
        let hw = h * w;

        let planes = weight.numel();
        let mut grad_w = Vec::with_capacity(planes);
        let mut grad_b = Vec::with_capacity(planes);
        let mut grad_x_hat = Vec::with_capacity(grad_output.numel());
        for (plane, (g, xh)) in grad_output
            .data()
            .chunks_exact(hw)
            .zip(stats.x_hat.data().chunks_exact(hw))
            .enumerate()
        {
            grad_w.push(g.iter().zip(xh).map(|(a, b)| a * b).sum::<f64>());
            grad_b.push(g.iter().sum::<f64>());
            let scale = weight.data()[plane];
            grad_x_hat.extend(g.iter().map(|v| v * scale));
        }

        let grad_x_hat = Tensor::new(grad_x_hat, grad_output.shape().clone());
        let grad_input = normalize_planes_backward(&grad_x_hat, stats);
        self.grads = Some((
            Tensor::new(grad_w, weight.shape().clone()),
            Tensor::new(grad_b, weight.shape().clone()),
        ));
        grad_input
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}
