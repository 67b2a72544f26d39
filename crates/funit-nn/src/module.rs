use std::collections::BTreeMap;

use crate::state::StateError;
use crate::Parameter;
use funit_tensor::Tensor;

/// Ordered name -> tensor snapshot of a module's parameters.
pub type StateDict = BTreeMap<String, Tensor>;

/// A layer with a hand-written backward pass.
///
/// `forward` caches whatever `backward` needs; `backward` consumes the
/// gradient of the output, accumulates parameter gradients, and returns the
/// gradient of the input. A `backward` always pairs with the most recent
/// `forward`.
pub trait Module {
    fn forward(&mut self, input: &Tensor) -> Tensor;

    fn backward(&mut self, grad_output: &Tensor) -> Tensor;

    /// Trainable parameters with dotted, stable names.
    fn named_parameters(&self) -> Vec<(String, &Parameter)>;

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)>;

    fn parameters(&self) -> Vec<&Parameter> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.named_parameters_mut()
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    /// Switch between training and evaluation behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Pin piecewise-linear activations to the regions chosen by the last
    /// `forward`, so later passes are linear in the input until unfrozen.
    fn freeze_activations(&mut self, _frozen: bool) {}

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    fn state_dict(&self) -> StateDict {
        self.named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.data.clone()))
            .collect()
    }

    /// Copy matching tensors into this module's parameters.
    ///
    /// Every parameter must be present with the same shape; extra entries in
    /// `state` are ignored.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), StateError> {
        for (name, p) in self.named_parameters_mut() {
            let src = state
                .get(&name)
                .ok_or_else(|| StateError::MissingKey(name.clone()))?;
            if src.shape() != p.shape() {
                return Err(StateError::ShapeMismatch {
                    name,
                    expected: p.shape().dims().to_vec(),
                    got: src.dims().to_vec(),
                });
            }
            p.data = src.clone();
        }
        Ok(())
    }
}

/// Prefix every parameter name of `module` with `prefix.`.
pub fn prefixed<'a>(prefix: &str, module: &'a dyn Module) -> Vec<(String, &'a Parameter)> {
    module
        .named_parameters()
        .into_iter()
        .map(|(name, p)| (format!("{prefix}.{name}"), p))
        .collect()
}

/// Mutable counterpart of [`prefixed`].
pub fn prefixed_mut<'a>(
    prefix: &str,
    module: &'a mut dyn Module,
) -> Vec<(String, &'a mut Parameter)> {
    module
        .named_parameters_mut()
        .into_iter()
        .map(|(name, p)| (format!("{prefix}.{name}"), p))
        .collect()
}
