//! Composite convolution, linear and residual blocks.

use crate::layers::{Conv2d, LeakyReLU, Linear, Pad2d, ReLU, Tanh};
use crate::module::{prefixed, prefixed_mut};
use crate::norm::{AdaptiveInstanceNorm2d, InstanceNorm2d};
use crate::{Module, Parameter};
use funit_tensor::{PadMode, Tensor};

/// Activation applied by a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// Leaky ReLU with slope 0.2.
    LRelu,
    Tanh,
    None,
}

impl Activation {
    fn layer(self) -> Option<Box<dyn Module>> {
        match self {
            Self::Relu => Some(Box::new(ReLU::new())),
            Self::LRelu => Some(Box::new(LeakyReLU::new(0.2))),
            Self::Tanh => Some(Box::new(Tanh::new())),
            Self::None => None,
        }
    }
}

/// Normalisation applied after a block's convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    None,
    Instance,
    AdaIn,
}

enum Norm {
    None,
    Instance(InstanceNorm2d),
    AdaIn(AdaptiveInstanceNorm2d),
}

impl Norm {
    fn new(kind: NormKind, features: usize) -> Self {
        match kind {
            NormKind::None => Self::None,
            NormKind::Instance => Self::Instance(InstanceNorm2d::new(features)),
            NormKind::AdaIn => Self::AdaIn(AdaptiveInstanceNorm2d::new(features)),
        }
    }

    fn forward(&mut self, x: Tensor) -> Tensor {
        match self {
            Self::None => x,
            Self::Instance(n) => n.forward(&x),
            Self::AdaIn(n) => n.forward(&x),
        }
    }

    fn backward(&mut self, g: Tensor) -> Tensor {
        match self {
            Self::None => g,
            Self::Instance(n) => n.backward(&g),
            Self::AdaIn(n) => n.backward(&g),
        }
    }
}

/// Geometry and options of a [`Conv2dBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub pad_mode: PadMode,
    pub norm: NormKind,
    pub activation: Activation,
    pub bias: bool,
    pub activation_first: bool,
}

impl ConvSpec {
    /// Zero padding, no norm, ReLU, with bias.
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride,
            padding,
            pad_mode: PadMode::Zero,
            norm: NormKind::None,
            activation: Activation::Relu,
            bias: true,
            activation_first: false,
        }
    }

    pub fn pad_mode(mut self, mode: PadMode) -> Self {
        self.pad_mode = mode;
        self
    }

    pub fn norm(mut self, norm: NormKind) -> Self {
        self.norm = norm;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn no_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    pub fn activation_first(mut self) -> Self {
        self.activation_first = true;
        self
    }
}

/// Pad, convolve, normalise and activate. With `activation_first` the
/// activation runs before the padding instead.
pub struct Conv2dBlock {
    pad: Pad2d,
    pub conv: Conv2d,
    norm: Norm,
    activation: Option<Box<dyn Module>>,
    activation_first: bool,
}

impl Conv2dBlock {
    pub fn new(in_channels: usize, out_channels: usize, spec: ConvSpec, seed: u64) -> Self {
        Self {
            pad: Pad2d::new(spec.padding, spec.pad_mode),
            conv: Conv2d::new(
                in_channels,
                out_channels,
                spec.kernel,
                spec.stride,
                spec.bias,
                seed,
            ),
            norm: Norm::new(spec.norm, out_channels),
            activation: spec.activation.layer(),
            activation_first: spec.activation_first,
        }
    }

    /// The block's AdaIN layer, if it normalises adaptively.
    pub fn adain_mut(&mut self) -> Option<&mut AdaptiveInstanceNorm2d> {
        match &mut self.norm {
            Norm::AdaIn(n) => Some(n),
            _ => None,
        }
    }

    fn activate(&mut self, x: Tensor) -> Tensor {
        match &mut self.activation {
            Some(a) => a.forward(&x),
            None => x,
        }
    }

    fn activate_backward(&mut self, g: Tensor) -> Tensor {
        match &mut self.activation {
            Some(a) => a.backward(&g),
            None => g,
        }
    }
}

impl Module for Conv2dBlock {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        if self.activation_first {
            let x = self.activate(input.clone());
            let x = self.conv.forward(&self.pad.forward(&x));
            self.norm.forward(x)
        } else {
            let x = self.conv.forward(&self.pad.forward(input));
            let x = self.norm.forward(x);
            self.activate(x)
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        if self.activation_first {
            let g = self.norm.backward(grad_output.clone());
            let g = self.pad.backward(&self.conv.backward(&g));
            self.activate_backward(g)
        } else {
            let g = self.activate_backward(grad_output.clone());
            let g = self.norm.backward(g);
            self.pad.backward(&self.conv.backward(&g))
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        prefixed("conv", &self.conv)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        prefixed_mut("conv", &mut self.conv)
    }

    fn freeze_activations(&mut self, frozen: bool) {
        if let Some(a) = &mut self.activation {
            a.freeze_activations(frozen);
        }
    }
}

/// Linear layer followed by an optional activation.
pub struct LinearBlock {
    pub fc: Linear,
    activation: Option<Box<dyn Module>>,
}

impl LinearBlock {
    pub fn new(in_features: usize, out_features: usize, activation: Activation, seed: u64) -> Self {
        Self {
            fc: Linear::new(in_features, out_features, seed),
            activation: activation.layer(),
        }
    }
}

impl Module for LinearBlock {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let x = self.fc.forward(input);
        match &mut self.activation {
            Some(a) => a.forward(&x),
            None => x,
        }
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let g = match &mut self.activation {
            Some(a) => a.backward(grad_output),
            None => grad_output.clone(),
        };
        self.fc.backward(&g)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        prefixed("fc", &self.fc)
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        prefixed_mut("fc", &mut self.fc)
    }

    fn freeze_activations(&mut self, frozen: bool) {
        if let Some(a) = &mut self.activation {
            a.freeze_activations(frozen);
        }
    }
}

/// Two 3×3 conv blocks with an identity shortcut.
pub struct ResBlock {
    conv0: Conv2dBlock,
    conv1: Conv2dBlock,
}

impl ResBlock {
    pub fn new(
        dim: usize,
        norm: NormKind,
        activation: Activation,
        pad_mode: PadMode,
        seed: u64,
    ) -> Self {
        let spec = ConvSpec::new(3, 1, 1).norm(norm).pad_mode(pad_mode);
        Self {
            conv0: Conv2dBlock::new(dim, dim, spec.activation(activation), seed),
            conv1: Conv2dBlock::new(
                dim,
                dim,
                spec.activation(Activation::None),
                seed.wrapping_add(1),
            ),
        }
    }

    fn adain_layers_mut(&mut self) -> Vec<&mut AdaptiveInstanceNorm2d> {
        let Self { conv0, conv1 } = self;
        conv0.adain_mut().into_iter().chain(conv1.adain_mut()).collect()
    }
}

impl Module for ResBlock {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let residual = self.conv1.forward(&self.conv0.forward(input));
        input.add(&residual)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let through = self.conv0.backward(&self.conv1.backward(grad_output));
        grad_output.add(&through)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("conv0", &self.conv0);
        params.extend(prefixed("conv1", &self.conv1));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = prefixed_mut("conv0", &mut self.conv0);
        params.extend(prefixed_mut("conv1", &mut self.conv1));
        params
    }

    fn freeze_activations(&mut self, frozen: bool) {
        self.conv0.freeze_activations(frozen);
        self.conv1.freeze_activations(frozen);
    }
}

/// A stack of [`ResBlock`]s.
pub struct ResBlocks {
    blocks: Vec<ResBlock>,
}

impl ResBlocks {
    pub fn new(
        num_blocks: usize,
        dim: usize,
        norm: NormKind,
        activation: Activation,
        pad_mode: PadMode,
        seed: u64,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| {
                ResBlock::new(
                    dim,
                    norm,
                    activation,
                    pad_mode,
                    seed.wrapping_add(2 * i as u64),
                )
            })
            .collect();
        Self { blocks }
    }

    /// AdaIN layers in forward order.
    pub fn adain_layers_mut(&mut self) -> Vec<&mut AdaptiveInstanceNorm2d> {
        self.blocks
            .iter_mut()
            .flat_map(|b| b.adain_layers_mut())
            .collect()
    }
}

impl Module for ResBlocks {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let mut x = input.clone();
        for block in &mut self.blocks {
            x = block.forward(&x);
        }
        x
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let mut g = grad_output.clone();
        for block in self.blocks.iter_mut().rev() {
            g = block.backward(&g);
        }
        g
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(i, b)| prefixed(&i.to_string(), b))
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        self.blocks
            .iter_mut()
            .enumerate()
            .flat_map(|(i, b)| prefixed_mut(&i.to_string(), b))
            .collect()
    }

    fn freeze_activations(&mut self, frozen: bool) {
        for block in &mut self.blocks {
            block.freeze_activations(frozen);
        }
    }
}

/// Pre-activation residual block with a learned shortcut when widths differ.
///
/// Hidden width is `min(fin, fout)`; the shortcut is a bias-free 1×1 conv.
pub struct ActFirstResBlock {
    conv_0: Conv2dBlock,
    conv_1: Conv2dBlock,
    conv_s: Option<Conv2dBlock>,
}

impl ActFirstResBlock {
    pub fn new(fin: usize, fout: usize, activation: Activation, norm: NormKind, seed: u64) -> Self {
        let fhid = fin.min(fout);
        let spec = ConvSpec::new(3, 1, 1)
            .pad_mode(PadMode::Reflect)
            .norm(norm)
            .activation(activation)
            .activation_first();
        let conv_s = (fin != fout).then(|| {
            Conv2dBlock::new(
                fin,
                fout,
                ConvSpec::new(1, 1, 0).activation(Activation::None).no_bias(),
                seed.wrapping_add(2),
            )
        });
        Self {
            conv_0: Conv2dBlock::new(fin, fhid, spec, seed),
            conv_1: Conv2dBlock::new(fhid, fout, spec, seed.wrapping_add(1)),
            conv_s,
        }
    }
}

impl Module for ActFirstResBlock {
    fn forward(&mut self, input: &Tensor) -> Tensor {
        let shortcut = match &mut self.conv_s {
            Some(s) => s.forward(input),
            None => input.clone(),
        };
        let dx = self.conv_1.forward(&self.conv_0.forward(input));
        shortcut.add(&dx)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let through = self.conv_0.backward(&self.conv_1.backward(grad_output));
        let shortcut = match &mut self.conv_s {
            Some(s) => s.backward(grad_output),
            None => grad_output.clone(),
        };
        through.add(&shortcut)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut params = prefixed("conv_0", &self.conv_0);
        params.extend(prefixed("conv_1", &self.conv_1));
        if let Some(s) = &self.conv_s {
            params.extend(prefixed("conv_s", s));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
        let mut params = prefixed_mut("conv_0", &mut self.conv_0);
        params.extend(prefixed_mut("conv_1", &mut self.conv_1));
        if let Some(s) = &mut self.conv_s {
            params.extend(prefixed_mut("conv_s", s));
        }
        params
    }

    fn freeze_activations(&mut self, frozen: bool) {
        self.conv_0.freeze_activations(frozen);
        self.conv_1.freeze_activations(frozen);
        if let Some(s) = &mut self.conv_s {
            s.freeze_activations(frozen);
        }
    }
}
