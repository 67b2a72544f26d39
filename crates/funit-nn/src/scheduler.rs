use serde::{Deserialize, Serialize};

/// Learning rate as a function of the step (0-indexed).
pub trait Scheduler {
    fn lr(&self, step: usize) -> f64;
}

/// Constant learning rate.
pub struct ConstantLr {
    pub lr: f64,
}

impl Scheduler for ConstantLr {
    fn lr(&self, _step: usize) -> f64 {
        self.lr
    }
}

/// Step decay: multiply by `gamma` every `step_size` steps.
///
/// `lr(step) = initial_lr * gamma^(step / step_size)`
pub struct StepLr {
    pub initial_lr: f64,
    pub step_size: usize,
    pub gamma: f64,
}

impl Scheduler for StepLr {
    fn lr(&self, step: usize) -> f64 {
        let exponent = (step / self.step_size.max(1)) as i32;
        self.initial_lr * self.gamma.powi(exponent)
    }
}

/// Serializable choice of schedule, as written in a training config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum LrPolicy {
    Constant,
    Step { step_size: usize, gamma: f64 },
}

impl Default for LrPolicy {
    fn default() -> Self {
        Self::Constant
    }
}

impl LrPolicy {
    pub fn build(self, initial_lr: f64) -> Box<dyn Scheduler> {
        match self {
            Self::Constant => Box::new(ConstantLr { lr: initial_lr }),
            Self::Step { step_size, gamma } => Box::new(StepLr {
                initial_lr,
                step_size,
                gamma,
            }),
        }
    }
}
