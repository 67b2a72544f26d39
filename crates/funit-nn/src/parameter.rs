use crate::Rng;
use funit_tensor::{Shape, Tensor};

/// A trainable tensor with an optional accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub data: Tensor,
    pub grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Self { data, grad: None }
    }

    pub fn zeros(shape: Shape) -> Self {
        Self::new(Tensor::zeros(shape))
    }

    /// Kaiming-normal initialisation: `N(0, 2 / fan_in)`.
    pub fn randn(shape: Shape, seed: u64) -> Self {
        let std = (2.0 / fan_in(&shape) as f64).sqrt();
        Self::new(normal_tensor(shape, std, seed))
    }

    /// Add `grad` into the gradient buffer, creating it on first use.
    pub fn accumulate_grad(&mut self, grad: &Tensor) {
        match &mut self.grad {
            Some(g) => g.axpy(1.0, grad),
            None => self.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    pub fn shape(&self) -> &Shape {
        self.data.shape()
    }

    pub fn numel(&self) -> usize {
        self.data.numel()
    }
}

/// Inputs feeding one output unit: every dimension after the first.
pub fn fan_in(shape: &Shape) -> usize {
    let dims = shape.dims();
    if dims.len() < 2 {
        return dims.first().copied().unwrap_or(1).max(1);
    }
    dims[1..].iter().product::<usize>().max(1)
}

/// Outputs fed by one input unit: first dimension times the receptive field.
pub fn fan_out(shape: &Shape) -> usize {
    let dims = shape.dims();
    if dims.len() < 2 {
        return dims.first().copied().unwrap_or(1).max(1);
    }
    (dims[0] * dims[2..].iter().product::<usize>()).max(1)
}

pub(crate) fn normal_tensor(shape: Shape, std: f64, seed: u64) -> Tensor {
    let mut rng = Rng::new(seed);
    let data = (0..shape.numel()).map(|_| rng.normal() * std).collect();
    Tensor::new(data, shape)
}
