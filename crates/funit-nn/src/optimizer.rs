use crate::Parameter;

/// Updates module parameters in place from their accumulated gradients.
pub trait Optimizer {
    fn step(&mut self, params: &mut [&mut Parameter]);

    /// Update the learning rate (used by schedulers).
    fn set_lr(&mut self, lr: f64);

    fn lr(&self) -> f64;
}

fn ensure_state(state: &mut Vec<Vec<f64>>, params: &[&mut Parameter]) {
    if state.is_empty() {
        state.extend(params.iter().map(|p| vec![0.0; p.numel()]));
    }
    assert_eq!(
        state.len(),
        params.len(),
        "optimizer stepped with a different parameter list"
    );
}

/// RMSprop with L2 weight decay folded into the gradient.
///
/// `v = alpha * v + (1 - alpha) * g^2`, `p -= lr * g / (sqrt(v) + eps)`.
pub struct Rmsprop {
    pub lr: f64,
    pub alpha: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    square_avg: Vec<Vec<f64>>,
}

impl Rmsprop {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            alpha: 0.99,
            epsilon: 1e-8,
            weight_decay: 0.0,
            square_avg: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Rmsprop {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        ensure_state(&mut self.square_avg, params);

        for (p, avg) in params.iter_mut().zip(&mut self.square_avg) {
            let Some(grad) = &p.grad else { continue };
            let grad = grad.data().to_vec();
            let data = p.data.data_mut();
            for j in 0..data.len() {
                let g = grad[j] + self.weight_decay * data[j];
                avg[j] = self.alpha * avg[j] + (1.0 - self.alpha) * g * g;
                data[j] -= self.lr * g / (avg[j].sqrt() + self.epsilon);
            }
        }
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.lr
    }
}

/// Adam with optional L2 weight decay.
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    t: usize,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_betas(lr, 0.9, 0.999)
    }

    pub fn with_betas(lr: f64, beta1: f64, beta2: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        ensure_state(&mut self.m, params);
        ensure_state(&mut self.v, params);
        self.t += 1;

        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, p) in params.iter_mut().enumerate() {
            let Some(grad) = &p.grad else { continue };
            let grad = grad.data().to_vec();
            let data = p.data.data_mut();
            let (m, v) = (&mut self.m[i], &mut self.v[i]);
            for j in 0..data.len() {
                let g = grad[j] + self.weight_decay * data[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bc1;
                let v_hat = v[j] / bc2;
                data[j] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn lr(&self) -> f64 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funit_tensor::Tensor;

    fn quadratic_param(start: f64) -> Parameter {
        Parameter::new(Tensor::from_slice(&[start]))
    }

    // d/dx (x^2) = 2x
    fn set_grad(p: &mut Parameter) {
        let x = p.data.data()[0];
        p.grad = Some(Tensor::from_slice(&[2.0 * x]));
    }

    #[test]
    fn rmsprop_minimises_quadratic() {
        let mut p = quadratic_param(3.0);
        let mut opt = Rmsprop::new(0.05);
        for _ in 0..400 {
            set_grad(&mut p);
            opt.step(&mut [&mut p]);
        }
        assert!(p.data.data()[0].abs() < 0.1, "x = {}", p.data.data()[0]);
    }

    #[test]
    fn adam_minimises_quadratic() {
        let mut p = quadratic_param(-2.0);
        let mut opt = Adam::new(0.1);
        for _ in 0..300 {
            set_grad(&mut p);
            opt.step(&mut [&mut p]);
        }
        assert!(p.data.data()[0].abs() < 0.05, "x = {}", p.data.data()[0]);
    }

    #[test]
    fn weight_decay_shrinks_without_gradient_signal() {
        let mut p = quadratic_param(1.0);
        let mut opt = Rmsprop::new(0.01).with_weight_decay(0.1);
        p.grad = Some(Tensor::from_slice(&[0.0]));
        opt.step(&mut [&mut p]);
        assert!(p.data.data()[0] < 1.0);
    }

    #[test]
    fn params_without_grad_are_untouched() {
        let mut p = quadratic_param(1.5);
        let mut opt = Adam::new(0.1);
        opt.step(&mut [&mut p]);
        assert_eq!(p.data.data()[0], 1.5);
    }
}
