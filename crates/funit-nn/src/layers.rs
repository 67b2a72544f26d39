use crate::{Module, Parameter};
use funit_tensor::ops::{self, PadMode};
use funit_tensor::{Shape, Tensor};

const CALL_FORWARD_FIRST: &str = "must call forward before backward";

/// Fully-connected layer on `[batch, in] -> [batch, out]`: `y = x W^T + b`.
pub struct Linear {
    pub weight: Parameter, // [out_features, in_features]
    pub bias: Parameter,   // [out_features]
    cached_input: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        Self {
            weight: Parameter::randn(Shape::from_slice(&[out_features, in_features]), seed),
            bias: Parameter::zeros(Shape::from_slice(&[out_features])),
            cached_input: None,
        }
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        assert_eq!(input.ndim(), 2, "Linear input must be [batch, features]");
        self.cached_input = Some(input.clone());
        input
            .matmul(&self.weight.data.transpose())
            .add(&self.bias.data)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let input = self.cached_input.as_ref().expect(CALL_FORWARD_FIRST);

        // grad_w = grad_output^T @ input: [out, batch] @ [batch, in]
        let grad_w = grad_output.transpose().matmul(input);
        self.weight.accumulate_grad(&grad_w);
        self.bias.accumulate_grad(&grad_output.sum_axis(0));

        grad_output.matmul(&self.weight.data)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        vec![
            (String::from("weight"), &self.weight),
            (String::from("bias"), &self.bias),
        ]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        vec![
            (String::from("weight"), &mut self.weight),
            (String::from("bias"), &mut self.bias),
        ]
    }
}

/// 2-D convolution over the valid region; pad explicitly with [`Pad2d`].
pub struct Conv2d {
    pub weight: Parameter, // [out, in, k, k]
    pub bias: Option<Parameter>,
    kernel: usize,
    stride: usize,
    cached_input: Option<Tensor>,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        bias: bool,
        seed: u64,
    ) -> Self {
        Self {
            weight: Parameter::randn(
                Shape::nchw(out_channels, in_channels, kernel, kernel),
                seed,
            ),
            bias: bias.then(|| Parameter::zeros(Shape::from_slice(&[out_channels]))),
            kernel,
            stride,
            cached_input: None,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Conv2d {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let out = ops::conv2d(
            input,
            &self.weight.data,
            self.bias.as_ref().map(|b| &b.data),
            self.stride,
        );
        self.cached_input = Some(input.clone());
        out
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let input = self.cached_input.as_ref().expect(CALL_FORWARD_FIRST);
        let grad_w = ops::conv2d_backward_weight(grad_output, input, self.kernel, self.stride);
        self.weight.accumulate_grad(&grad_w);
        if let Some(bias) = &mut self.bias {
            bias.accumulate_grad(&ops::channel_sum(grad_output));
        }
        ops::conv2d_backward_input(grad_output, &self.weight.data, input.shape(), self.stride)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = vec![(String::from("weight"), &self.weight)];
        if let Some(b) = &self.bias {
            params.push((String::from("bias"), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = vec![(String::from("weight"), &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push((String::from("bias"), b));
        }
        params
    }
}

/// Pads height and width by a fixed amount.
pub struct Pad2d {
    pub pad: usize,
    pub mode: PadMode,
}

impl Pad2d {
    pub fn new(pad: usize, mode: PadMode) -> Self {
        Self { pad, mode }
    }

    pub fn reflect(pad: usize) -> Self {
        Self::new(pad, PadMode::Reflect)
    }
}

impl Module for Pad2d {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        ops::pad2d(input, self.pad, self.mode)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        ops::pad2d_backward(grad_output, self.pad, self.mode)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// ReLU activation layer.
#[derive(Default)]
pub struct ReLU {
    cached_input: Option<Tensor>,
    frozen: Option<Tensor>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for ReLU {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.cached_input = Some(input.clone());
        match &self.frozen {
            Some(gate) => input.zip_with(gate, |v, x| if x > 0.0 { v } else { 0.0 }),
            None => input.relu(),
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let gate = match &self.frozen {
            Some(gate) => gate,
            None => self.cached_input.as_ref().expect(CALL_FORWARD_FIRST),
        };
        grad_output.zip_with(gate, |g, x| if x > 0.0 { g } else { 0.0 })
    }

    fn freeze_activations(&mut self, frozen: bool) {
        self.frozen = if frozen {
            self.cached_input.clone()
        } else {
            None
        };
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Leaky ReLU with a fixed negative slope.
pub struct LeakyReLU {
    pub slope: f64,
    cached_input: Option<Tensor>,
    frozen: Option<Tensor>,
}

impl LeakyReLU {
    pub fn new(slope: f64) -> Self {
        Self {
            slope,
            cached_input: None,
            frozen: None,
        }
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl Module for LeakyReLU {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.cached_input = Some(input.clone());
        match &self.frozen {
            Some(gate) => {
                let slope = self.slope;
                input.zip_with(gate, |v, x| if x > 0.0 { v } else { v * slope })
            }
            None => input.leaky_relu(self.slope),
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let gate = match &self.frozen {
            Some(gate) => gate,
            None => self.cached_input.as_ref().expect(CALL_FORWARD_FIRST),
        };
        let slope = self.slope;
        grad_output.zip_with(gate, |g, x| if x > 0.0 { g } else { g * slope })
    }

    fn freeze_activations(&mut self, frozen: bool) {
        self.frozen = if frozen {
            self.cached_input.clone()
        } else {
            None
        };
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Tanh activation layer.
#[derive(Default)]
pub struct Tanh {
    cached_output: Option<Tensor>,
}

impl Tanh {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Tanh {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let output = input.tanh();
        self.cached_output = Some(output.clone());
        output
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let output = self.cached_output.as_ref().expect(CALL_FORWARD_FIRST);
        // d/dx tanh(x) = 1 - tanh(x)^2
        grad_output.zip_with(output, |g, t| g * (1.0 - t * t))
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Nearest-neighbour upsampling by an integer factor.
pub struct Upsample {
    pub scale: usize,
    cached_shape: Option<Shape>,
}

impl Upsample {
    pub fn new(scale: usize) -> Self {
        Self {
            scale,
            cached_shape: None,
        }
    }
}

impl Module for Upsample {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.cached_shape = Some(input.shape().clone());
        ops::upsample_nearest2d(input, self.scale)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let shape = self.cached_shape.as_ref().expect(CALL_FORWARD_FIRST);
        ops::upsample_nearest2d_backward(grad_output, shape)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Square-window average pooling without padding.
pub struct AvgPool2d {
    pub kernel: usize,
    pub stride: usize,
    cached_shape: Option<Shape>,
}

impl AvgPool2d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride,
            cached_shape: None,
        }
    }
}

impl Module for AvgPool2d {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        self.cached_shape = Some(input.shape().clone());
        ops::avg_pool2d(input, self.kernel, self.stride)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let shape = self.cached_shape.as_ref().expect(CALL_FORWARD_FIRST);
        ops::avg_pool2d_backward(grad_output, shape, self.kernel, self.stride)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Average over all spatial positions: `[n, c, h, w] -> [n, c, 1, 1]`.
#[derive(Default)]
pub struct GlobalAvgPool {
    cached_shape: Option<Shape>,
}

impl GlobalAvgPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for GlobalAvgPool {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let (n, c, _, _) = input.shape().as_nchw();
        self.cached_shape = Some(input.shape().clone());
        ops::spatial_mean(input).reshape(Shape::nchw(n, c, 1, 1))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let shape = self.cached_shape.as_ref().expect(CALL_FORWARD_FIRST);
        let (n, c, _, _) = shape.as_nchw();
        let flat = grad_output.reshape(Shape::from_slice(&[n, c]));
        ops::spatial_mean_backward(&flat, shape)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Collapse everything after the batch dimension.
#[derive(Default)]
pub struct Flatten {
    cached_shape: Option<Shape>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Flatten {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let n = input.shape()[0];
        self.cached_shape = Some(input.shape().clone());
        input.reshape(Shape::from_slice(&[n, input.numel() / n]))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let shape = self.cached_shape.clone().expect(CALL_FORWARD_FIRST);
        grad_output.reshape(shape)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        Vec::new()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        Vec::new()
    }
}

/// Chains modules in order.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }

    pub fn push(&mut self, layer: impl Module + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for layer in &mut self.layers {
            x = layer.forward(&x);
        }
        x
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
        grad
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, param)| (format!("{i}.{name}"), param))
            })
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .named_parameters_mut()
                    .into_iter()
                    .map(move |(name, param)| (format!("{i}.{name}"), param))
            })
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
    fn freeze_activations(&mut self, frozen: bool) {
        for layer in &mut self.layers {
            layer.freeze_activations(frozen);
        }
    }
}
