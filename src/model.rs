//! The FUNIT model: generator, discriminator and the averaged generator, with
//! one function per training step.

use funit_data::Batch;
use funit_nn::{ema_update, init, Module, Rng};
use funit_tensor::{ops, Tensor};

use crate::config::FunitConfig;
use crate::error::{FunitError, Result};
use crate::losses::{recon_criterion, DisLoss};
use crate::networks::{FewShotGen, GpPatchMcResDis};

/// Loss terms of a generator step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenLosses {
    pub total: f64,
    pub adv: f64,
    pub x_rec: f64,
    pub c_rec: f64,
    pub m_rec: f64,
    pub acc: f64,
}

/// Loss terms of a discriminator step. `fake` and `real` are the hinge terms,
/// reported whichever objective is trained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisLosses {
    pub total: f64,
    pub fake: f64,
    pub real: f64,
    pub wasserstein: f64,
    pub penalty: f64,
    pub acc: f64,
}

/// Images produced by [`FunitModel::test`]: inputs, reconstructions and
/// translations from the training generator (`*_current`) and from the
/// averaged one.
#[derive(Debug, Clone)]
pub struct TestImages {
    pub xa: Tensor,
    pub xr_current: Tensor,
    pub xt_current: Tensor,
    pub xb: Tensor,
    pub xr: Tensor,
    pub xt: Tensor,
}

impl TestImages {
    /// Rows in display order.
    pub fn rows(&self) -> [&Tensor; 6] {
        [
            &self.xa,
            &self.xr_current,
            &self.xt_current,
            &self.xb,
            &self.xr,
            &self.xt,
        ]
    }
}

pub struct FunitModel {
    pub gen: FewShotGen,
    pub dis: GpPatchMcResDis,
    /// Exponential moving average of `gen`, used for evaluation.
    pub gen_test: FewShotGen,
    training: bool,
}

impl FunitModel {
    pub fn new(config: &FunitConfig) -> Result<Self> {
        let mut gen = FewShotGen::new(&config.gen, config.seed);
        let mut dis = GpPatchMcResDis::new(&config.dis, config.seed);
        init::apply(&mut gen, config.init, config.seed);
        init::apply(&mut dis, config.init, config.seed.wrapping_add(1));
        let mut gen_test = FewShotGen::new(&config.gen, config.seed);
        gen_test.load_state_dict(&gen.state_dict())?;
        Ok(Self {
            gen,
            dis,
            gen_test,
            training: true,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.gen.set_training(training);
        self.dis.set_training(training);
        self.gen_test.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// `gen_test <- beta * gen_test + (1 - beta) * gen`.
    pub fn update_average(&mut self, beta: f64) {
        ema_update(&mut self.gen_test, &self.gen, beta);
    }

    /// Forward and backward for one generator step.
    ///
    /// Translates the content images `co` into the classes of `cl` and
    /// reconstructs `co` from its own class code. Generator gradients are
    /// reset and then accumulated, multiplied by `loss_scale`; the
    /// discriminator's gradients from this pass are left for the next
    /// [`dis_update`](Self::dis_update) to clear.
    pub fn gen_update(
        &mut self,
        co: &Batch,
        cl: &Batch,
        hp: &FunitConfig,
        it: usize,
        loss_scale: f64,
    ) -> Result<GenLosses> {
        check_pair(co, cl)?;
        self.check_labels(co)?;
        self.check_labels(cl)?;
        self.gen.zero_grad();
        let (xa, la) = (&co.images, &co.labels);
        let (xb, lb) = (&cl.images, &cl.labels);
        let b = co.len();

        // Both decodes run as one batch: translations first, then
        // reconstructions, sharing the content code.
        let c_xa = self.gen.enc_content(xa);
        let codes = self.gen.enc_class_model(&Tensor::cat(&[xa, xb]));
        let (s_xa, s_xb) = codes.split_at(b);
        let decoded = self
            .gen
            .decode(&Tensor::cat(&[&c_xa, &c_xa]), &Tensor::cat(&[&s_xb, &s_xa]));
        let (x_t, x_r) = decoded.split_at(b);
        let labels: Vec<usize> = lb.iter().chain(la).copied().collect();

        let (_, real_feat) = self.dis.forward_labeled(&Tensor::cat(&[xb, xa]), &labels);
        let (fm_xb, fm_xa) = ops::spatial_mean(&real_feat).split_at(b);

        let (adv, fake_feat) = self.dis.calc_gen_loss(&decoded, &labels);
        let (fm_t, fm_r) = ops::spatial_mean(&fake_feat).split_at(b);
        let (m_rec, grad_m) = recon_criterion(&fm_t, &fm_xb);
        let (c_rec, grad_c) = recon_criterion(&fm_r, &fm_xa);
        let (x_rec, grad_x) = recon_criterion(&x_r, xa);

        let with_adv = it % hp.gen.update_every == 0;
        let mut total = hp.r_w * x_rec + hp.fm_w * (c_rec + m_rec);
        if with_adv {
            total += hp.gan_w * adv.loss;
        }

        let adv_scale = if with_adv { hp.gan_w * loss_scale } else { 0.0 };
        let grad_feat = ops::spatial_mean_backward(&Tensor::cat(&[&grad_m, &grad_c]), fake_feat.shape())
            .scale(hp.fm_w * loss_scale);
        let grad_images = self
            .dis
            .backward_labeled(&adv.grad.scale(adv_scale), Some(&grad_feat))
            .add(&Tensor::cat(&[
                &x_t.zeros_like(),
                &grad_x.scale(hp.r_w * loss_scale),
            ]));

        let (grad_content, grad_codes) = self.gen.decode_backward(&grad_images);
        let (grad_c_t, grad_c_r) = grad_content.split_at(b);
        self.gen.enc_content_backward(&grad_c_t.add(&grad_c_r));
        let (grad_s_xb, grad_s_xa) = grad_codes.split_at(b);
        self.gen
            .enc_class_model_backward(&Tensor::cat(&[&grad_s_xa, &grad_s_xb]));

        Ok(GenLosses {
            total,
            adv: adv.loss,
            x_rec,
            c_rec,
            m_rec,
            acc: adv.acc,
        })
    }

    /// Forward and backward for one discriminator step.
    ///
    /// The translation is computed without touching generator gradients.
    /// Discriminator gradients are reset and then accumulated, multiplied by
    /// `loss_scale`.
    ///
    /// Unlike the published FUNIT trainer, the adversarial term is weighted by
    /// `gan_w` and the Wasserstein critic minimises `mean(fake) - mean(real)`;
    /// the penalty carries its own weight.
    pub fn dis_update(
        &mut self,
        co: &Batch,
        cl: &Batch,
        hp: &FunitConfig,
        rng: &mut Rng,
        loss_scale: f64,
    ) -> Result<DisLosses> {
        check_pair(co, cl)?;
        self.check_labels(cl)?;
        self.dis.zero_grad();
        let (xb, lb) = (&cl.images, &cl.labels);

        let c_xa = self.gen.enc_content(&co.images);
        let s_xb = self.gen.enc_class_model(xb);
        let x_t = self.gen.decode(&c_xa, &s_xb);

        let penalty = hp
            .gradient_penalty
            .apply(&mut self.dis, xb, &x_t, lb, rng, loss_scale);

        let adv_scale = hp.gan_w * loss_scale;
        let (real, resp_r) = self.dis.calc_dis_real_loss(xb, lb);
        let grad_r = match hp.dis_loss {
            DisLoss::Wasserstein => {
                Tensor::full(resp_r.shape().clone(), -1.0 / resp_r.numel() as f64)
            }
            DisLoss::Hinge => real.grad.clone(),
        };
        self.dis.backward_labeled(&grad_r.scale(adv_scale), None);

        let (fake, resp_f) = self.dis.calc_dis_fake_loss(&x_t, lb);
        let (wasserstein, _, grad_f) = self.dis.calc_wasserstein_loss(&resp_r, &resp_f);
        let grad_f = match hp.dis_loss {
            DisLoss::Wasserstein => grad_f,
            DisLoss::Hinge => fake.grad.clone(),
        };
        self.dis.backward_labeled(&grad_f.scale(adv_scale), None);

        let adversarial = match hp.dis_loss {
            DisLoss::Wasserstein => wasserstein,
            DisLoss::Hinge => real.loss + fake.loss,
        };
        Ok(DisLosses {
            total: hp.gan_w * adversarial + penalty,
            fake: fake.loss,
            real: real.loss,
            wasserstein,
            penalty,
            acc: 0.5 * (fake.acc + real.acc),
        })
    }

    /// Reconstructions and translations from both generators, computed in
    /// evaluation mode.
    pub fn test(&mut self, co: &Batch, cl: &Batch) -> Result<TestImages> {
        check_pair(co, cl)?;
        let was_training = self.training;
        self.set_training(false);
        let (xa, xb) = (&co.images, &cl.images);

        let (xr_current, xt_current) = reconstruct_and_translate(&mut self.gen, xa, xb);
        let (xr, xt) = reconstruct_and_translate(&mut self.gen_test, xa, xb);

        self.set_training(was_training);
        Ok(TestImages {
            xa: xa.clone(),
            xr_current,
            xt_current,
            xb: xb.clone(),
            xr,
            xt,
        })
    }

    /// Translate `co` using class codes averaged over consecutive groups of
    /// `k` images of `cl`.
    pub fn translate_k_shot(&mut self, co: &Batch, cl: &Batch, k: usize) -> Result<Tensor> {
        self.set_training(false);
        let class_code = self.compute_k_style(&cl.images, k)?;
        self.translate_simple(&co.images, &class_code)
    }

    /// Class codes `[N / k, latent_dim, 1, 1]`, each the mean over `k`
    /// consecutive images. Trailing images that do not fill a group are
    /// ignored.
    pub fn compute_k_style(&mut self, style_batch: &Tensor, k: usize) -> Result<Tensor> {
        self.set_training(false);
        let n = style_batch.shape()[0];
        if k == 0 || n < k {
            return Err(FunitError::Shape(format!(
                "cannot form groups of {k} from {n} style images"
            )));
        }
        let codes = self.gen_test.enc_class_model(style_batch);
        let groups = n / k;
        let latent = codes.numel() / n;
        let mut out = vec![0.0; groups * latent];
        for (i, code) in codes.data().chunks_exact(latent).take(groups * k).enumerate() {
            let dst = &mut out[(i / k) * latent..(i / k + 1) * latent];
            for (d, v) in dst.iter_mut().zip(code) {
                *d += v / k as f64;
            }
        }
        Ok(Tensor::new(out, codes.shape().with_batch(groups)))
    }

    /// Decode `content_image` with a precomputed class code, which holds
    /// either one code for the whole batch or one per content image.
    pub fn translate_simple(&mut self, content_image: &Tensor, class_code: &Tensor) -> Result<Tensor> {
        self.set_training(false);
        let n = content_image.shape()[0];
        let m = class_code.shape()[0];
        if m != 1 && m != n {
            return Err(FunitError::Shape(format!(
                "{m} class codes cannot style {n} content images"
            )));
        }
        let latent = self.gen_test.latent_dim();
        if class_code.numel() != m * latent {
            return Err(FunitError::Shape(format!(
                "class code {} does not hold {latent}-dimensional codes",
                class_code.shape()
            )));
        }
        let content = self.gen_test.enc_content(content_image);
        Ok(self.gen_test.decode(&content, class_code))
    }

    fn check_labels(&self, batch: &Batch) -> Result<()> {
        let classes = self.dis.num_classes();
        match batch.labels.iter().find(|&&l| l >= classes) {
            Some(label) => Err(FunitError::Config(format!(
                "label {label} is out of range for a discriminator with {classes} classes"
            ))),
            None => Ok(()),
        }
    }
}

fn reconstruct_and_translate(gen: &mut FewShotGen, xa: &Tensor, xb: &Tensor) -> (Tensor, Tensor) {
    let c_xa = gen.enc_content(xa);
    let s_xa = gen.enc_class_model(xa);
    let s_xb = gen.enc_class_model(xb);
    let xt = gen.decode(&c_xa, &s_xb);
    let xr = gen.decode(&c_xa, &s_xa);
    (xr, xt)
}

fn check_pair(co: &Batch, cl: &Batch) -> Result<()> {
    if co.is_empty() || co.len() != cl.len() {
        return Err(FunitError::Shape(format!(
            "content and class batches must be non-empty and equal in size, got {} and {}",
            co.len(),
            cl.len()
        )));
    }
    if co.images.shape()[0] != co.len() || cl.images.shape()[0] != cl.len() {
        return Err(FunitError::Shape(String::from(
            "batch images and labels disagree in count",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Shape;

    fn tiny() -> FunitConfig {
        let mut config = FunitConfig::default();
        config.gen.nf = 2;
        config.gen.nf_mlp = 4;
        config.gen.n_downs_class = 2;
        config.gen.n_downs_content = 1;
        config.gen.n_res_blks = 1;
        config.gen.latent_dim = 3;
        config.dis.nf = 2;
        config.dis.n_res_blks = 2;
        config.dis.num_classes = 2;
        config
    }

    fn batch(n: usize, fill: f64, label: usize) -> Batch {
        Batch {
            images: Tensor::from_fn(Shape::nchw(n, 3, 8, 8), |i| {
                fill * ((i[0] + i[1] + i[2] * 8 + i[3]) % 5) as f64 / 5.0
            }),
            labels: vec![label; n],
        }
    }

    #[test]
    fn gen_test_starts_as_copy() {
        let model = FunitModel::new(&tiny()).unwrap();
        assert_eq!(model.gen.state_dict(), model.gen_test.state_dict());
    }

    #[test]
    fn k_style_groups_and_drops_remainder() {
        let mut model = FunitModel::new(&tiny()).unwrap();
        let styles = batch(5, 0.7, 0).images;
        let codes = model.gen_test.enc_class_model(&styles);
        let grouped = model.compute_k_style(&styles, 2).unwrap();
        assert_eq!(grouped.dims(), &[2, 3, 1, 1]);
        for l in 0..3 {
            let expected = 0.5 * (codes.get(&[2, l, 0, 0]) + codes.get(&[3, l, 0, 0]));
            assert!((grouped.get(&[1, l, 0, 0]) - expected).abs() < 1e-12);
        }
        assert!(model.compute_k_style(&styles, 0).is_err());
        assert!(model.compute_k_style(&styles, 6).is_err());
    }

    #[test]
    fn k_shot_code_count_must_fit_content() {
        let mut model = FunitModel::new(&tiny()).unwrap();
        let co = batch(3, 1.0, 0);
        let one = model.translate_k_shot(&co, &batch(4, -1.0, 1), 4).unwrap();
        assert_eq!(one.shape()[0], 3);
        let err = model.translate_k_shot(&co, &batch(4, -1.0, 1), 2).unwrap_err();
        assert!(matches!(err, FunitError::Shape(_)));
    }

    #[test]
    fn mismatched_batches_rejected() {
        let mut model = FunitModel::new(&tiny()).unwrap();
        let hp = tiny();
        let err = model
            .gen_update(&batch(2, 1.0, 0), &batch(3, 1.0, 1), &hp, 0, 1.0)
            .unwrap_err();
        assert!(matches!(err, FunitError::Shape(_)));
    }

    #[test]
    fn labels_beyond_discriminator_classes_rejected() {
        let mut model = FunitModel::new(&tiny()).unwrap();
        let hp = tiny();
        let (co, cl) = (batch(2, 1.0, 0), batch(2, -1.0, 2));
        let err = model
            .dis_update(&co, &cl, &hp, &mut Rng::new(1), 1.0)
            .unwrap_err();
        assert!(matches!(err, FunitError::Config(_)));
        let err = model.gen_update(&cl, &co, &hp, 0, 1.0).unwrap_err();
        assert!(matches!(err, FunitError::Config(_)));
        assert!(model.gen_update(&co, &batch(2, -1.0, 1), &hp, 0, 1.0).is_ok());
    }

    #[test]
    fn test_restores_training_mode() {
        let mut model = FunitModel::new(&tiny()).unwrap();
        let images = model.test(&batch(2, 1.0, 0), &batch(2, -1.0, 1)).unwrap();
        assert!(model.is_training());
        assert_eq!(images.rows().len(), 6);
        // gen_test is still an exact copy, so both generators agree
        assert_eq!(images.xt.data(), images.xt_current.data());
    }
}
