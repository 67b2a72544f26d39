//! Layers with hand-written backward passes, optimizers and training utilities.
//!
//! Every [`Module`] caches what it needs in `forward` and returns the input
//! gradient from `backward`, accumulating parameter gradients on the way.

mod blocks;
pub mod init;
mod layers;
mod module;
mod norm;
mod optimizer;
mod parameter;
mod rng;
mod scaler;
mod scheduler;
pub mod state;

pub use blocks::{
    ActFirstResBlock, Activation, Conv2dBlock, ConvSpec, LinearBlock, NormKind, ResBlock,
    ResBlocks,
};
pub use init::{ema_update, Init};
pub use layers::{
    AvgPool2d, Conv2d, Flatten, GlobalAvgPool, LeakyReLU, Linear, Pad2d, ReLU, Sequential, Tanh,
    Upsample,
};
pub use module::{prefixed, prefixed_mut, Module, StateDict};
pub use norm::{AdaptiveInstanceNorm2d, InstanceNorm2d};
pub use optimizer::{Adam, Optimizer, Rmsprop};
pub use parameter::Parameter;
pub use rng::Rng;
pub use scaler::{LossScaler, ScalerConfig};
pub use scheduler::{ConstantLr, LrPolicy, Scheduler, StepLr};
pub use state::StateError;
