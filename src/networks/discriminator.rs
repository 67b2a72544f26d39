use funit_nn::{
    prefixed, prefixed_mut, ActFirstResBlock, Activation, AvgPool2d, Conv2dBlock, ConvSpec,
    Module, NormKind, Pad2d, Parameter, Rng, Sequential,
};
use funit_tensor::{ops, PadMode, Shape, Tensor};
use tracing::debug;

use super::Seeds;
use crate::config::DisConfig;
use crate::losses::{self, AdvTerm};

const MAX_CHANNELS: usize = 1024;

/// Largest input perturbation used when differentiating an input gradient
/// w.r.t. the parameters. The activations are frozen during those passes,
/// so the difference is exact and the step only has to avoid cancellation.
const HVP_STEP: f64 = 1.0;

/// Patch-based multi-class discriminator.
///
/// A residual feature extractor followed by a 1×1 classifier with one output
/// channel per class; the response for a sample is the channel of its own
/// label, one score per patch.
pub struct GpPatchMcResDis {
    cnn_f: Sequential,
    cnn_c: Conv2dBlock,
    num_classes: usize,
    labels: Option<Vec<usize>>,
}

impl GpPatchMcResDis {
    pub fn new(config: &DisConfig, seed: u64) -> Self {
        assert!(
            config.n_res_blks >= 2 && config.n_res_blks % 2 == 0,
            "n_res_blks must be a positive multiple of 2"
        );
        let mut seeds = Seeds::new(seed ^ 0xD15C);
        let block = |fin, fout, seeds: &mut Seeds| {
            ActFirstResBlock::new(fin, fout, Activation::LRelu, NormKind::None, seeds.next())
        };

        let mut nf = config.nf;
        let mut cnn_f = Sequential::new(Vec::new());
        let first = ConvSpec::new(config.kernel_size_7, 1, 3)
            .pad_mode(PadMode::Reflect)
            .activation(Activation::None);
        cnn_f.push(Conv2dBlock::new(config.input_nc, nf, first, seeds.next()));
        for _ in 0..config.n_res_blks / 2 - 1 {
            let nf_out = (nf * 2).min(MAX_CHANNELS);
            cnn_f.push(block(nf, nf, &mut seeds));
            cnn_f.push(block(nf, nf_out, &mut seeds));
            cnn_f.push(Pad2d::reflect(1));
            cnn_f.push(AvgPool2d::new(3, 2));
            nf = nf_out;
        }
        let nf_out = (nf * 2).min(MAX_CHANNELS);
        cnn_f.push(block(nf, nf, &mut seeds));
        cnn_f.push(block(nf, nf_out, &mut seeds));

        let classifier = ConvSpec::new(1, 1, 0)
            .activation(Activation::LRelu)
            .activation_first();
        let cnn_c = Conv2dBlock::new(nf_out, config.num_classes, classifier, seeds.next());

        Self {
            cnn_f,
            cnn_c,
            num_classes: config.num_classes,
            labels: None,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Per-patch scores of each sample's own class, `[B, H', W']`, and the
    /// feature map `[B, C', H', W']` they were computed from.
    pub fn forward_labeled(&mut self, x: &Tensor, labels: &[usize]) -> (Tensor, Tensor) {
        assert_eq!(
            x.shape()[0],
            labels.len(),
            "discriminator needs one label per image"
        );
        let feat = self.cnn_f.forward(x);
        let out = self.cnn_c.forward(&feat);
        self.labels = Some(labels.to_vec());
        (ops::select_channel(&out, labels), feat)
    }

    /// Back-propagate a gradient on the response map, plus optionally one on
    /// the feature map, through the last [`forward_labeled`](Self::forward_labeled).
    /// Returns the gradient w.r.t. the input images.
    pub fn backward_labeled(&mut self, grad_resp: &Tensor, grad_feat: Option<&Tensor>) -> Tensor {
        let labels = self
            .labels
            .as_ref()
            .expect("must call forward_labeled before backward_labeled");
        let grad_out = ops::select_channel_backward(grad_resp, labels, self.num_classes);
        let mut grad = self.cnn_c.backward(&grad_out);
        if let Some(g) = grad_feat {
            grad = grad.add(g);
        }
        self.cnn_f.backward(&grad)
    }

    /// Hinge loss on real images. Returns the term and the response map.
    pub fn calc_dis_real_loss(&mut self, input_real: &Tensor, labels: &[usize]) -> (AdvTerm, Tensor) {
        let (resp, _) = self.forward_labeled(input_real, labels);
        (losses::dis_real_loss(&resp), resp)
    }

    /// Hinge loss on generated images. Returns the term and the response map.
    pub fn calc_dis_fake_loss(&mut self, input_fake: &Tensor, labels: &[usize]) -> (AdvTerm, Tensor) {
        let (resp, _) = self.forward_labeled(input_fake, labels);
        (losses::dis_fake_loss(&resp), resp)
    }

    /// Generator's adversarial term on generated images, with the feature map.
    pub fn calc_gen_loss(&mut self, input_fake: &Tensor, labels: &[usize]) -> (AdvTerm, Tensor) {
        let (resp, feat) = self.forward_labeled(input_fake, labels);
        (losses::gen_loss(&resp), feat)
    }

    /// Critic loss `mean(fake) - mean(real)` and its response gradients.
    pub fn calc_wasserstein_loss(&self, resp_real: &Tensor, resp_fake: &Tensor) -> (f64, Tensor, Tensor) {
        losses::wasserstein_loss(resp_real, resp_fake)
    }

    /// R1 regulariser `weight * sum(grad_x mean D(x))^2 / B`.
    ///
    /// Accumulates `grad_scale` times its parameter gradient and returns the
    /// unscaled value.
    pub fn calc_grad2(&mut self, x: &Tensor, labels: &[usize], weight: f64, grad_scale: f64) -> f64 {
        let batch = x.shape()[0] as f64;
        let (g, seed) = self.input_gradient_with(x, labels, |numel| 1.0 / numel as f64);
        let reg = weight * g.data().iter().map(|v| v * v).sum::<f64>() / batch;
        let direction = g.scale(2.0 * weight / batch);
        self.directional_backward(x, labels, &direction, seed, grad_scale);
        reg
    }

    /// WGAN-GP penalty `weight * mean_b (||grad_x sum D(x_hat)||_b - 1)^2` on
    /// per-sample random interpolates between `real` and `fake`.
    ///
    /// `fake` is resized to the real images' size first. Accumulates
    /// `grad_scale` times the parameter gradient and returns the unscaled
    /// value.
    pub fn calc_gradient_penalty(
        &mut self,
        real: &Tensor,
        fake: &Tensor,
        labels: &[usize],
        weight: f64,
        rng: &mut Rng,
        grad_scale: f64,
    ) -> f64 {
        let (n, c, h, w) = real.shape().as_nchw();
        let fake = if fake.dims()[2..] != real.dims()[2..] {
            debug!(
                "resizing generated images {} to {} for the gradient penalty",
                fake.shape(),
                real.shape()
            );
            ops::resize_nearest(fake, h, w)
        } else {
            fake.clone()
        };
        let alpha: Vec<f64> = (0..n).map(|_| rng.next_f64()).collect();
        let alpha = Tensor::new(alpha, Shape::nchw(n, 1, 1, 1));
        let interpolates = real.mul(&alpha).add(&fake.mul(&alpha.neg().add_scalar(1.0)));

        let g = self.input_gradient(&interpolates, labels, 1.0);
        let per_sample = c * h * w;
        let mut penalty = 0.0;
        let mut direction = Vec::with_capacity(g.numel());
        for sample in g.data().chunks_exact(per_sample) {
            let norm = sample.iter().map(|v| v * v).sum::<f64>().sqrt();
            penalty += (norm - 1.0) * (norm - 1.0);
            let coeff = if norm > 0.0 {
                weight / n as f64 * 2.0 * (norm - 1.0) / norm
            } else {
                0.0
            };
            direction.extend(sample.iter().map(|v| coeff * v));
        }
        let direction = Tensor::new(direction, g.shape().clone());
        self.directional_backward(&interpolates, labels, &direction, 1.0, grad_scale);
        weight * penalty / n as f64
    }

    /// Gradient of `seed * sum(D(x))` w.r.t. `x`, leaving parameter
    /// gradients as they were.
    pub fn input_gradient(&mut self, x: &Tensor, labels: &[usize], seed: f64) -> Tensor {
        self.input_gradient_with(x, labels, |_| seed).0
    }

    /// [`input_gradient`](Self::input_gradient) with the seed chosen from the
    /// number of response entries; returns the seed used.
    fn input_gradient_with(
        &mut self,
        x: &Tensor,
        labels: &[usize],
        seed_for: impl Fn(usize) -> f64,
    ) -> (Tensor, f64) {
        let saved: Vec<Option<Tensor>> = self.parameters().iter().map(|p| p.grad.clone()).collect();
        let (resp, _) = self.forward_labeled(x, labels);
        let seed = seed_for(resp.numel());
        let grad = self.backward_labeled(&Tensor::full(resp.shape().clone(), seed), None);
        for (p, g) in self.parameters_mut().into_iter().zip(saved) {
            p.grad = g;
        }
        (grad, seed)
    }

    /// Accumulate `scale * d/dtheta <v, grad_x (seed * sum D(x))>` as a
    /// central difference of parameter gradients at `x ± eps v`.
    ///
    /// The leaky ReLUs keep the regions they chose at `x`, which makes the
    /// network affine in its input for both passes and the difference exact.
    fn directional_backward(&mut self, x: &Tensor, labels: &[usize], v: &Tensor, seed: f64, scale: f64) {
        let max = v.max_abs();
        if max == 0.0 || !max.is_finite() {
            return;
        }
        let eps = HVP_STEP / max;
        self.forward_labeled(x, labels);
        self.freeze_activations(true);
        for sign in [1.0, -1.0] {
            let shifted = x.add(&v.scale(sign * eps));
            let (resp, _) = self.forward_labeled(&shifted, labels);
            let g = Tensor::full(resp.shape().clone(), sign * seed * scale / (2.0 * eps));
            self.backward_labeled(&g, None);
        }
        self.freeze_activations(false);
    }
}

impl Module for GpPatchMcResDis {
    /// Class scores for every class, `[B, num_classes, H', W']`.
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let feat = self.cnn_f.forward(input);
        self.cnn_c.forward(&feat)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let grad_feat = self.cnn_c.backward(grad_output);
        self.cnn_f.backward(&grad_feat)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("cnn_f", &self.cnn_f);
        params.extend(prefixed("cnn_c", &self.cnn_c));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = prefixed_mut("cnn_f", &mut self.cnn_f);
        params.extend(prefixed_mut("cnn_c", &mut self.cnn_c));
        params
    }

    fn freeze_activations(&mut self, frozen: bool) {
        self.cnn_f.freeze_activations(frozen);
        self.cnn_c.freeze_activations(frozen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(n_res_blks: usize) -> DisConfig {
        DisConfig {
            nf: 2,
            n_res_blks,
            num_classes: 3,
            input_nc: 3,
            kernel_size_7: 3,
        }
    }

    fn images(n: usize, size: usize, seed: u64) -> Tensor {
        let mut rng = Rng::new(seed);
        let data = (0..n * 3 * size * size).map(|_| 2.0 * rng.next_f64() - 1.0).collect();
        Tensor::new(data, Shape::nchw(n, 3, size, size))
    }

    #[test]
    fn response_selects_own_class() {
        let mut dis = GpPatchMcResDis::new(&tiny(4), 1);
        let x = images(2, 8, 2);
        let all = dis.forward(&x);
        assert_eq!(all.dims()[..2], [2, 3]);
        let (resp, feat) = dis.forward_labeled(&x, &[2, 0]);
        assert_eq!(resp.dims(), &[2, all.dims()[2], all.dims()[3]]);
        assert_eq!(feat.shape()[1], 8);
        assert_eq!(resp.get(&[0, 1, 1]), all.get(&[0, 2, 1, 1]));
        assert_eq!(resp.get(&[1, 0, 0]), all.get(&[1, 0, 0, 0]));
    }

    #[test]
    fn downsampling_stages_follow_block_count() {
        let x = images(1, 8, 3);
        // 8 + 2 * 3 - 3 + 1 = 12, then each stage pools (12 + 2 - 3) / 2 + 1 = 6
        let mut two = GpPatchMcResDis::new(&tiny(2), 4);
        assert_eq!(two.forward(&x).dims(), &[1, 3, 12, 12]);
        let mut four = GpPatchMcResDis::new(&tiny(4), 4);
        assert_eq!(four.forward(&x).dims(), &[1, 3, 6, 6]);
    }

    #[test]
    fn input_gradient_keeps_parameter_gradients() {
        let mut dis = GpPatchMcResDis::new(&tiny(2), 5);
        let x = images(2, 6, 6);
        let (resp, _) = dis.forward_labeled(&x, &[0, 1]);
        dis.backward_labeled(&Tensor::ones(resp.shape().clone()), None);
        let before: Vec<Tensor> = dis.parameters().iter().map(|p| p.grad.clone().unwrap()).collect();

        let g = dis.input_gradient(&x, &[1, 1], 1.0);
        assert_eq!(g.shape(), x.shape());
        for (p, b) in dis.parameters().iter().zip(&before) {
            assert_eq!(p.grad.as_ref().unwrap().data(), b.data());
        }
    }

    #[test]
    fn zero_weight_penalties_leave_gradients_empty() {
        let mut dis = GpPatchMcResDis::new(&tiny(2), 7);
        let real = images(2, 6, 8);
        let fake = images(2, 10, 9);
        let mut rng = Rng::new(1);
        let gp = dis.calc_gradient_penalty(&real, &fake, &[0, 2], 0.0, &mut rng, 1.0);
        let r1 = dis.calc_grad2(&real, &[0, 2], 0.0, 1.0);
        assert_eq!(gp, 0.0);
        assert_eq!(r1, 0.0);
        assert!(dis.parameters().iter().all(|p| p.grad.is_none()));
    }

    #[test]
    fn penalty_passes_release_frozen_activations() {
        let mut dis = GpPatchMcResDis::new(&tiny(2), 10);
        let x = images(2, 6, 11);
        let expected = dis.forward(&x);

        let real = images(2, 6, 12);
        let fake = images(2, 6, 13);
        dis.calc_gradient_penalty(&real, &fake, &[1, 0], 10.0, &mut Rng::new(3), 1.0);
        dis.calc_grad2(&real, &[1, 0], 10.0, 1.0);
        assert_eq!(dis.forward(&x), expected);
    }

    #[test]
    fn directional_gradient_is_linear_in_the_direction() {
        let x = images(2, 6, 14);
        let labels = [2, 1];
        let a = images(2, 6, 15);
        let b = images(2, 6, 16).scale(3.0);
        let run = |v: &Tensor| {
            let mut dis = GpPatchMcResDis::new(&tiny(2), 17);
            dis.directional_backward(&x, &labels, v, 1.0, 1.0);
            dis.parameters()
                .iter()
                .map(|p| p.grad.clone().unwrap())
                .collect::<Vec<_>>()
        };
        let (ga, gb, gab) = (run(&a), run(&b), run(&a.add(&b)));
        for ((ga, gb), gab) in ga.iter().zip(&gb).zip(&gab) {
            for j in 0..ga.numel() {
                let sum = ga.data()[j] + gb.data()[j];
                let joint = gab.data()[j];
                assert!((sum - joint).abs() < 1e-7 * (1.0 + joint.abs()), "{sum} vs {joint}");
            }
        }
    }
}
