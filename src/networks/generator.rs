use funit_nn::{
    prefixed, prefixed_mut, Activation, AdaptiveInstanceNorm2d, Conv2d, Conv2dBlock, ConvSpec,
    Flatten, GlobalAvgPool, LinearBlock, Module, NormKind, Parameter, ResBlocks, Sequential,
    Upsample,
};
use funit_tensor::{PadMode, Shape, Tensor};

use super::Seeds;
use crate::config::GenConfig;

const CALL_FORWARD_FIRST: &str = "must call forward before backward";

/// Downsampling encoder from an image to a class code `[B, latent_dim, 1, 1]`.
pub struct ClassModelEncoder {
    model: Sequential,
    pub output_dim: usize,
}

impl ClassModelEncoder {
    fn new(
        downs: usize,
        input_nc: usize,
        nf: usize,
        latent_dim: usize,
        ks7: usize,
        ks4: usize,
        seeds: &mut Seeds,
    ) -> Self {
        let spec7 = ConvSpec::new(ks7, 1, 3).pad_mode(PadMode::Reflect);
        let spec4 = ConvSpec::new(ks4, 2, 1).pad_mode(PadMode::Reflect);

        let mut model = Sequential::new(Vec::new());
        model.push(Conv2dBlock::new(input_nc, nf, spec7, seeds.next()));
        let mut dim = nf;
        for _ in 0..2 {
            model.push(Conv2dBlock::new(dim, 2 * dim, spec4, seeds.next()));
            dim *= 2;
        }
        for _ in 0..downs.saturating_sub(2) {
            model.push(Conv2dBlock::new(dim, dim, spec4, seeds.next()));
        }
        model.push(GlobalAvgPool::new());
        model.push(Conv2d::new(dim, latent_dim, 1, 1, true, seeds.next()));
        Self {
            model,
            output_dim: latent_dim,
        }
    }
}

impl Module for ClassModelEncoder {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.model.forward(input)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        self.model.backward(grad_output)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        prefixed("model", &self.model)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        prefixed_mut("model", &mut self.model)
    }
}

/// Instance-normalised encoder from an image to a spatial content code.
pub struct ContentEncoder {
    model: Sequential,
    pub output_dim: usize,
}

impl ContentEncoder {
    fn new(
        downs: usize,
        n_res: usize,
        input_nc: usize,
        nf: usize,
        ks7: usize,
        ks4: usize,
        seeds: &mut Seeds,
    ) -> Self {
        let spec = |k, s, p| {
            ConvSpec::new(k, s, p)
                .pad_mode(PadMode::Reflect)
                .norm(NormKind::Instance)
        };

        let mut model = Sequential::new(Vec::new());
        model.push(Conv2dBlock::new(input_nc, nf, spec(ks7, 1, 3), seeds.next()));
        let mut dim = nf;
        for _ in 0..downs {
            model.push(Conv2dBlock::new(dim, 2 * dim, spec(ks4, 2, 1), seeds.next()));
            dim *= 2;
        }
        model.push(ResBlocks::new(
            n_res,
            dim,
            NormKind::Instance,
            Activation::Relu,
            PadMode::Reflect,
            seeds.next(),
        ));
        Self {
            model,
            output_dim: dim,
        }
    }
}

impl Module for ContentEncoder {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.model.forward(input)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        self.model.backward(grad_output)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        prefixed("model", &self.model)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        prefixed_mut("model", &mut self.model)
    }
}

/// AdaIN residual blocks followed by upsampling convolutions back to image
/// space. The AdaIN parameters must be assigned before every forward.
pub struct Decoder {
    res: ResBlocks,
    model: Sequential,
    num_adain_params: usize,
}

impl Decoder {
    fn new(
        ups: usize,
        n_res: usize,
        dim: usize,
        output_nc: usize,
        ks5: usize,
        ks7: usize,
        seeds: &mut Seeds,
    ) -> Self {
        let res = ResBlocks::new(
            n_res,
            dim,
            NormKind::AdaIn,
            Activation::Relu,
            PadMode::Reflect,
            seeds.next(),
        );
        // two AdaIN layers of `dim` features per block, each taking a bias
        // and a weight vector
        let num_adain_params = n_res * 2 * 2 * dim;

        let mut model = Sequential::new(Vec::new());
        let mut dim = dim;
        for _ in 0..ups {
            model.push(Upsample::new(2));
            let spec = ConvSpec::new(ks5, 1, 2)
                .pad_mode(PadMode::Reflect)
                .norm(NormKind::Instance);
            model.push(Conv2dBlock::new(dim, dim / 2, spec, seeds.next()));
            dim /= 2;
        }
        let out = ConvSpec::new(ks7, 1, 3)
            .pad_mode(PadMode::Reflect)
            .activation(Activation::Tanh);
        model.push(Conv2dBlock::new(dim, output_nc, out, seeds.next()));

        Self {
            res,
            model,
            num_adain_params,
        }
    }

    /// Length of the parameter vector [`assign_adain_params`] consumes.
    pub fn num_adain_params(&self) -> usize {
        self.num_adain_params
    }

    /// AdaIN layers in forward order.
    pub fn adain_layers_mut(&mut self) -> Vec<&mut AdaptiveInstanceNorm2d> {
        self.res.adain_layers_mut()
    }
}

impl Module for Decoder {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.model.forward(&self.res.forward(input))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        self.res.backward(&self.model.backward(grad_output))
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("res", &self.res);
        params.extend(prefixed("model", &self.model));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = prefixed_mut("res", &mut self.res);
        params.extend(prefixed_mut("model", &mut self.model));
        params
    }
}

/// Maps a class code to the decoder's AdaIN parameters.
pub struct Mlp {
    model: Sequential,
}

impl Mlp {
    fn new(input_dim: usize, output_dim: usize, dim: usize, n_blk: usize, seeds: &mut Seeds) -> Self {
        let mut model = Sequential::new(Vec::new());
        model.push(Flatten::new());
        model.push(LinearBlock::new(input_dim, dim, Activation::Relu, seeds.next()));
        for _ in 0..n_blk.saturating_sub(2) {
            model.push(LinearBlock::new(dim, dim, Activation::Relu, seeds.next()));
        }
        model.push(LinearBlock::new(dim, output_dim, Activation::None, seeds.next()));
        Self { model }
    }
}

impl Module for Mlp {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.model.forward(input)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        self.model.backward(grad_output)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        prefixed("model", &self.model)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        prefixed_mut("model", &mut self.model)
    }
}

/// Copy `[n, k]` columns `start..start + len` into a `[n, len]` tensor.
fn columns(t: &Tensor, start: usize, len: usize) -> Tensor {
    let (n, k) = (t.shape()[0], t.shape()[1]);
    let mut out = Vec::with_capacity(n * len);
    for row in t.data().chunks_exact(k) {
        out.extend_from_slice(&row[start..start + len]);
    }
    Tensor::new(out, Shape::from_slice(&[n, len]))
}

/// Split a `[n, P]` parameter matrix across AdaIN layers in order: for a
/// layer of `C` features the next `C` columns are its bias and the `C` after
/// that its weight.
fn assign_adain_params(params: &Tensor, layers: Vec<&mut AdaptiveInstanceNorm2d>) {
    let mut offset = 0;
    for layer in layers {
        let c = layer.num_features;
        let bias = columns(params, offset, c);
        let weight = columns(params, offset + c, c);
        layer.assign(weight, bias);
        offset += 2 * c;
    }
    assert_eq!(
        offset,
        params.shape()[1],
        "AdaIN parameter count does not match the decoder"
    );
}

/// Gather the AdaIN gradients back into a `[n, P]` matrix laid out like the
/// parameters handed to [`assign_adain_params`].
fn collect_adain_grads(layers: Vec<&mut AdaptiveInstanceNorm2d>, n: usize, p: usize) -> Tensor {
    let mut out = vec![0.0; n * p];
    let mut offset = 0;
    for layer in layers {
        let c = layer.num_features;
        let (grad_w, grad_b) = layer.param_grads().expect(CALL_FORWARD_FIRST);
        for b in 0..n {
            let row = &mut out[b * p..(b + 1) * p];
            row[offset..offset + c].copy_from_slice(&grad_b.data()[b * c..(b + 1) * c]);
            row[offset + c..offset + 2 * c].copy_from_slice(&grad_w.data()[b * c..(b + 1) * c]);
        }
        offset += 2 * c;
    }
    Tensor::new(out, Shape::from_slice(&[n, p]))
}

/// Few-shot generator: a content encoder, a class-model encoder, an MLP
/// producing AdaIN parameters from the class code, and an AdaIN decoder.
///
/// `forward` reconstructs its input (content and class code from the same
/// images); training code drives the parts individually through
/// [`enc_content`](Self::enc_content), [`enc_class_model`](Self::enc_class_model)
/// and [`decode`](Self::decode) and their backward counterparts.
pub struct FewShotGen {
    enc_class_model: ClassModelEncoder,
    enc_content: ContentEncoder,
    dec: Decoder,
    mlp: Mlp,
    /// Batch size of the class code given to the last `decode`, when it was
    /// broadcast over a larger content batch.
    broadcast_code: Option<usize>,
}

impl FewShotGen {
    pub fn new(config: &GenConfig, seed: u64) -> Self {
        let mut seeds = Seeds::new(seed);
        let enc_class_model = ClassModelEncoder::new(
            config.n_downs_class,
            config.input_nc,
            config.nf,
            config.latent_dim,
            config.kernel_size_7,
            config.kernel_size_4,
            &mut seeds,
        );
        let enc_content = ContentEncoder::new(
            config.n_downs_content,
            config.n_res_blks,
            config.input_nc,
            config.nf,
            config.kernel_size_7,
            config.kernel_size_4,
            &mut seeds,
        );
        let dec = Decoder::new(
            config.n_downs_content,
            config.n_res_blks,
            enc_content.output_dim,
            config.output_nc,
            config.kernel_size_5,
            config.kernel_size_7,
            &mut seeds,
        );
        let mlp = Mlp::new(
            config.latent_dim,
            dec.num_adain_params(),
            config.nf_mlp,
            config.n_mlp_blks,
            &mut seeds,
        );
        Self {
            enc_class_model,
            enc_content,
            dec,
            mlp,
            broadcast_code: None,
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.enc_class_model.output_dim
    }

    pub fn content_dim(&self) -> usize {
        self.enc_content.output_dim
    }

    pub fn enc_content(&mut self, x: &Tensor) -> Tensor {
        self.enc_content.forward(x)
    }

    pub fn enc_content_backward(&mut self, grad_content: &Tensor) -> Tensor {
        self.enc_content.backward(grad_content)
    }

    pub fn enc_class_model(&mut self, x: &Tensor) -> Tensor {
        self.enc_class_model.forward(x)
    }

    pub fn enc_class_model_backward(&mut self, grad_code: &Tensor) -> Tensor {
        self.enc_class_model.backward(grad_code)
    }

    /// Decode a content code with the style of `class_code`.
    ///
    /// `class_code` has either the content's batch size or a batch of one,
    /// in which case the single code styles every content sample.
    pub fn decode(&mut self, content: &Tensor, class_code: &Tensor) -> Tensor {
        let n = content.shape()[0];
        let m = class_code.shape()[0];
        let code = if m == n {
            self.broadcast_code = None;
            class_code.clone()
        } else {
            assert_eq!(m, 1, "class code batch {m} cannot style {n} content codes");
            self.broadcast_code = Some(m);
            let reps: Vec<&Tensor> = std::iter::repeat(class_code).take(n).collect();
            Tensor::cat(&reps)
        };
        let adain_params = self.mlp.forward(&code);
        assign_adain_params(&adain_params, self.dec.adain_layers_mut());
        self.dec.forward(content)
    }

    /// Gradients `(d_content, d_class_code)` of the last [`decode`](Self::decode).
    pub fn decode_backward(&mut self, grad_images: &Tensor) -> (Tensor, Tensor) {
        let grad_content = self.dec.backward(grad_images);
        let n = grad_content.shape()[0];
        let p = self.dec.num_adain_params();
        let grad_params = collect_adain_grads(self.dec.adain_layers_mut(), n, p);
        let grad_code = self.mlp.backward(&grad_params);
        let grad_code = match self.broadcast_code {
            Some(m) => grad_code
                .sum_axis(0)
                .reshape(grad_code.shape().with_batch(m)),
            None => grad_code,
        };
        (grad_content, grad_code)
    }

    /// Content code of `one_image` and the mean class code of `model_set`.
    pub fn encode(&mut self, one_image: &Tensor, model_set: &Tensor) -> (Tensor, Tensor) {
        let content = self.enc_content(one_image);
        let class_codes = self.enc_class_model(model_set);
        let class_code = class_codes
            .mean_axis(0)
            .reshape(class_codes.shape().with_batch(1));
        (content, class_code)
    }

    /// Render `one_image` in the style of the class shown by `model_set`.
    pub fn translate(&mut self, one_image: &Tensor, model_set: &Tensor) -> Tensor {
        let (content, class_code) = self.encode(one_image, model_set);
        self.decode(&content, &class_code)
    }
}

impl Module for FewShotGen {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let content = self.enc_content(input);
        let class_code = self.enc_class_model(input);
        self.decode(&content, &class_code)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let (grad_content, grad_code) = self.decode_backward(grad_output);
        let through_content = self.enc_content_backward(&grad_content);
        let through_class = self.enc_class_model_backward(&grad_code);
        through_content.add(&through_class)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("enc_class_model", &self.enc_class_model);
        params.extend(prefixed("enc_content", &self.enc_content));
        params.extend(prefixed("dec", &self.dec));
        params.extend(prefixed("mlp", &self.mlp));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = prefixed_mut("enc_class_model", &mut self.enc_class_model);
        params.extend(prefixed_mut("enc_content", &mut self.enc_content));
        params.extend(prefixed_mut("dec", &mut self.dec));
        params.extend(prefixed_mut("mlp", &mut self.mlp));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> GenConfig {
        GenConfig {
            nf: 2,
            nf_mlp: 4,
            n_downs_class: 2,
            n_downs_content: 1,
            n_mlp_blks: 3,
            n_res_blks: 1,
            latent_dim: 3,
            input_nc: 3,
            output_nc: 3,
            ..GenConfig::default()
        }
    }

    #[test]
    fn adain_params_split_bias_then_weight() {
        let mut layers = vec![
            AdaptiveInstanceNorm2d::new(2),
            AdaptiveInstanceNorm2d::new(1),
        ];
        let params = Tensor::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            Shape::from_slice(&[1, 6]),
        );
        assign_adain_params(&params, layers.iter_mut().collect());

        // constant planes normalise to zero, so the output is the bias
        let x = Tensor::full(Shape::nchw(1, 2, 2, 2), 7.0);
        let y = layers[0].forward(&x);
        assert_eq!(&y.data()[..4], &[1.0; 4]);
        assert_eq!(&y.data()[4..], &[2.0; 4]);
        let y = layers[1].forward(&Tensor::zeros(Shape::nchw(1, 1, 2, 2)));
        assert!(y.data().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn shapes_follow_configuration() {
        let mut gen = FewShotGen::new(&tiny(), 1);
        let x = Tensor::full(Shape::nchw(2, 3, 8, 8), 0.1);
        let code = gen.enc_class_model(&x);
        assert_eq!(code.dims(), &[2, 3, 1, 1]);
        let content = gen.enc_content(&x);
        assert_eq!(content.dims(), &[2, 4, 6, 6]);
        assert_eq!(gen.dec.num_adain_params(), 16);
        let y = gen.decode(&content, &code);
        // kernel 3 with the wide paddings grows the image
        assert_eq!(y.dims(), &[2, 3, 18, 18]);
        assert!(y.data().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn single_code_styles_whole_batch() {
        let mut gen = FewShotGen::new(&tiny(), 2);
        let content = gen.enc_content(&Tensor::full(Shape::nchw(3, 3, 8, 8), -0.2));
        let code = Tensor::new(vec![0.5, -1.0, 2.0], Shape::nchw(1, 3, 1, 1));
        let y = gen.decode(&content, &code);
        assert_eq!(y.shape()[0], 3);

        let (grad_content, grad_code) = gen.decode_backward(&Tensor::ones(y.shape().clone()));
        assert_eq!(grad_content.shape(), content.shape());
        assert_eq!(grad_code.dims(), &[1, 3, 1, 1]);
    }

    #[test]
    fn encode_averages_the_model_set() {
        let mut gen = FewShotGen::new(&tiny(), 3);
        let image = Tensor::full(Shape::nchw(1, 3, 8, 8), 0.3);
        let set = Tensor::from_fn(Shape::nchw(4, 3, 8, 8), |i| {
            ((i[0] * 5 + i[2] * 3 + i[3]) % 7) as f64 / 7.0
        });
        let codes = gen.enc_class_model(&set);
        let (_, mean) = gen.encode(&image, &set);
        for l in 0..3 {
            let expected = (0..4).map(|b| codes.get(&[b, l, 0, 0])).sum::<f64>() / 4.0;
            assert!((mean.get(&[0, l, 0, 0]) - expected).abs() < 1e-12);
        }
        let out = gen.translate(&image, &set);
        assert_eq!(out.shape()[0], 1);
    }

    #[test]
    fn parameter_names_are_grouped_by_subnetwork() {
        let gen = FewShotGen::new(&tiny(), 4);
        let names: Vec<String> = gen.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&String::from("enc_class_model.model.0.conv.weight")));
        assert!(names.contains(&String::from("enc_content.model.2.0.conv0.conv.weight")));
        assert!(names.contains(&String::from("dec.res.0.conv1.conv.bias")));
        assert!(names.contains(&String::from("mlp.model.1.fc.weight")));
    }
}
