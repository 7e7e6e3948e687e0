//! Optimizer(s)

use thiserror::Error;

use crate::{tape::Gradients, tensor::Tensor};

/// Errors for the optimizers
#[derive(Debug, Error, PartialEq)]
pub enum OptimError {
    #[error("Gradient of length {got} for a parameter of {expected} elements")]
    GradientSizeMismatch { expected: usize, got: usize },
}

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step. Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &Gradients) -> Result<(), OptimError>;
    /// The parameters this optimizer updates
    fn parameters(&self) -> &[Tensor];
}

fn checked_grad<'g>(grads: &'g Gradients, param: &Tensor) -> Result<Option<&'g [f32]>, OptimError> {
    match grads.get(param) {
        Some(grad) if grad.len() != param.numel() => Err(OptimError::GradientSizeMismatch {
            expected: param.numel(),
            got: grad.len(),
        }),
        grad => Ok(grad),
    }
}

/// Adaptive moment estimation with bias corrected step sizes
/// <https://arxiv.org/abs/1412.6980>
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    // running powers of the betas, for bias correction
    beta1_t: f32,
    beta2_t: f32,
    // first and second moment estimates per parameter
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub const DEFAULT_BETA1: f32 = 0.9;
    pub const DEFAULT_BETA2: f32 = 0.999;
    pub const DEFAULT_EPSILON: f32 = 1e-7;

    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        Self::with_hyperparameters(
            params,
            lr,
            Self::DEFAULT_BETA1,
            Self::DEFAULT_BETA2,
            Self::DEFAULT_EPSILON,
        )
    }

    pub fn with_hyperparameters(
        params: Vec<Tensor>,
        lr: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m,
            v,
        }
    }
}

impl Optim for Adam {
    fn step(&mut self, grads: &Gradients) -> Result<(), OptimError> {
        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let step_size = lr * (1.0 - self.beta2_t).sqrt() / (1.0 - self.beta1_t);

        for (idx, param) in self.params.iter_mut().enumerate() {
            let Some(grad) = checked_grad(grads, param)? else {
                continue;
            };
            let (m, v) = (&mut self.m[idx], &mut self.v[idx]);
            param.update_data(|data| {
                for (((p, g), m), v) in data.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= step_size * *m / (v.sqrt() + eps);
                }
            });
        }
        Ok(())
    }

    fn parameters(&self) -> &[Tensor] {
        &self.params
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    lr: f32,
    momentum: f32,
    // velocity per parameter
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self, grads: &Gradients) -> Result<(), OptimError> {
        let (lr, momentum) = (self.lr, self.momentum);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let Some(grad) = checked_grad(grads, param)? else {
                continue;
            };
            let velocity = &mut self.velocity[idx];
            param.update_data(|data| {
                for ((p, g), vel) in data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    *vel = momentum * *vel - lr * g;
                    *p += *vel;
                }
            });
        }
        Ok(())
    }

    fn parameters(&self) -> &[Tensor] {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assert_eq_float,
        tape::{GradientEngine, Tape},
    };

    /// Gradients of `a + b`, i.e. 1 for every element of both
    fn sum_gradients(a: &Tensor, b: &Tensor) -> Gradients {
        let tape = Tape::new();
        let (out, trace) = tape.record(|| a.add(b).unwrap());
        tape.gradient(&trace, &out, &[a.clone(), b.clone()])
            .unwrap()
    }

    /// Gradients of `mean(bce(a + b, 0))`, positive for every element
    fn bce_gradients(a: &Tensor, b: &Tensor) -> Gradients {
        let tape = Tape::new();
        let (loss, trace) = tape.record(|| a.add(b).unwrap().bce_with_logits(0.0).unwrap());
        tape.gradient(&trace, &loss, &[a.clone(), b.clone()])
            .unwrap()
    }

    #[test]
    fn test_sgd_no_momentum() {
        let a = Tensor::parameter(vec![1.0], &[1]).unwrap();
        let b = Tensor::parameter(vec![2.0], &[1]).unwrap();
        let grads = sum_gradients(&a, &b);

        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.0);
        optim.step(&grads).unwrap();
        assert_eq!(a.to_vec(), vec![0.9]);
        assert_eq!(b.to_vec(), vec![1.9]);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let a = Tensor::parameter(vec![1.0], &[1]).unwrap();
        let b = Tensor::parameter(vec![2.0], &[1]).unwrap();
        let grads = sum_gradients(&a, &b);

        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.9);
        optim.step(&grads).unwrap();
        assert_eq!(a.to_vec(), vec![0.9]);
        assert_eq!(b.to_vec(), vec![1.9]);
        assert_eq!(optim.velocities(), &[vec![-0.1], vec![-0.1]]);
        optim.step(&grads).unwrap();
        assert_eq_float!(a.to_vec()[0], 0.71);
        assert_eq_float!(b.to_vec()[0], 1.71);
        assert_eq_float!(optim.velocities()[0][0], -0.19);
    }

    #[test]
    fn test_adam_first_step_is_learning_rate() {
        // with bias correction the first step moves every element by ~lr * sign(grad)
        let a = Tensor::parameter(vec![1.0, -3.0], &[2]).unwrap();
        let b = Tensor::parameter(vec![2.0, 0.5], &[2]).unwrap();
        let grads = bce_gradients(&a, &b);

        let mut optim = Adam::new(vec![a.clone(), b.clone()], 1e-2);
        optim.step(&grads).unwrap();
        let moved = a.to_vec();
        assert_eq_float!(moved[0], 1.0 - 1e-2);
        assert_eq_float!(moved[1], -3.0 - 1e-2);
        assert_eq_float!(b.to_vec()[1], 0.5 - 1e-2);
    }

    #[test]
    fn test_adam_skips_parameters_without_gradients() {
        let a = Tensor::parameter(vec![1.0], &[1]).unwrap();
        let b = Tensor::parameter(vec![2.0], &[1]).unwrap();
        let untouched = Tensor::parameter(vec![5.0], &[1]).unwrap();
        let grads = sum_gradients(&a, &b);

        let mut optim = Adam::new(vec![a.clone(), untouched.clone()], 1e-2);
        optim.step(&grads).unwrap();
        assert_eq!(untouched.to_vec(), vec![5.0]);
        assert!(a.to_vec()[0] < 1.0);
        assert_eq!(optim.parameters().len(), 2);
    }

    #[test]
    fn test_adam_minimizes_a_loss() {
        let logit = Tensor::parameter(vec![-2.0], &[1, 1]).unwrap();
        let mut optim = Adam::new(vec![logit.clone()], 0.1);
        let tape = Tape::new();
        let loss_at = |t: &Tensor| t.bce_with_logits(1.0).unwrap().item().unwrap();
        let initial = loss_at(&logit);
        for _ in 0..50 {
            let (loss, trace) = tape.record(|| logit.bce_with_logits(1.0).unwrap());
            let grads = tape
                .gradient(&trace, &loss, std::slice::from_ref(&logit))
                .unwrap();
            optim.step(&grads).unwrap();
        }
        assert!(loss_at(&logit) < initial / 10.0);
    }
}
