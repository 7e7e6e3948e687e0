//! Components to build a neural network
//!
//! Every component implements [`Layer`] and owns its own parameters. Networks are assembled as an
//! ordered [`Sequential`] pipeline of boxed layers.

use std::{
    cell::RefCell,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Input size mismatch in {layer}: expected {expected}, got {got}")]
    InputSizeMismatch {
        layer: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{layer} expects a rank {expected} input, got shape {shape:?}")]
    InputRankMismatch {
        layer: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Whether randomized regularization and batch statistics are in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Represents the torch.nn.Module. Layers and networks built from them implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Layer {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError>;

    /// Trainable parameters
    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    /// Non-trainable state which is still part of a saved model (e.g. running statistics)
    fn buffers(&self) -> Vec<Tensor> {
        vec![]
    }

    fn name(&self) -> &'static str;
}

/// Glorot uniform initialization, keeps the variance of activations and gradients roughly
/// constant across layers
fn glorot_uniform(
    shape: &[usize],
    fan_in: usize,
    fan_out: usize,
    rng: &mut impl Rng,
) -> Result<Tensor, TensorError> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let data = (0..shape.iter().product())
        .map(|_| rng.random_range(-limit..limit))
        .collect();
    Tensor::parameter(data, shape)
}

fn expect_rank<const N: usize>(layer: &'static str, shape: &[usize]) -> Result<[usize; N], NNError> {
    shape.try_into().map_err(|_| NNError::InputRankMismatch {
        layer,
        expected: N,
        shape: shape.to_vec(),
    })
}

/// A fully connected layer, `[n, inputs] -> [n, outputs]`
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
    n_output_nans: AtomicUsize,
}

impl Dense {
    pub fn new(n_inputs: usize, n_outputs: usize, rng: &mut impl Rng) -> Result<Self, NNError> {
        Ok(Self {
            weight: glorot_uniform(&[n_inputs, n_outputs], n_inputs, n_outputs, rng)?,
            bias: Tensor::parameter(vec![0.0; n_outputs], &[n_outputs])?,
            n_output_nans: AtomicUsize::new(0),
        })
    }

    /// Number of non-finite outputs seen in the last forward pass (used for debugging)
    pub fn n_output_nans(&self) -> usize {
        self.n_output_nans.load(atomic::Ordering::Relaxed)
    }
}

impl Layer for Dense {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let [_, n_inputs] = expect_rank::<2>(self.name(), &input.shape())?;
        let expected = self.weight.shape()[0];
        if n_inputs != expected {
            return Err(NNError::InputSizeMismatch {
                layer: self.name(),
                expected,
                got: n_inputs,
            });
        }
        let output = input.matmul(&self.weight)?.add_bias(&self.bias)?;
        let n_output_nans = output.data().iter().filter(|v| !v.is_finite()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        if n_output_nans > 0 {
            log::debug!("{}: n_output_nans: {}", self.name(), n_output_nans);
        }
        Ok(output)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn name(&self) -> &'static str {
        "Dense"
    }
}

/// Strided "same" padded convolution, `[n, h, w, in] -> [n, h / stride, w / stride, out]`
pub struct Conv2d {
    kernel: Tensor,
    bias: Tensor,
    stride: usize,
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, NNError> {
        let area = kernel_size * kernel_size;
        Ok(Self {
            kernel: glorot_uniform(
                &[kernel_size, kernel_size, in_channels, out_channels],
                area * in_channels,
                area * out_channels,
                rng,
            )?,
            bias: Tensor::parameter(vec![0.0; out_channels], &[out_channels])?,
            stride,
        })
    }
}

impl Layer for Conv2d {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let [_, _, _, channels] = expect_rank::<4>(self.name(), &input.shape())?;
        let expected = self.kernel.shape()[2];
        if channels != expected {
            return Err(NNError::InputSizeMismatch {
                layer: self.name(),
                expected,
                got: channels,
            });
        }
        Ok(input
            .conv2d(&self.kernel, self.stride)?
            .add_bias(&self.bias)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.kernel.clone(), self.bias.clone()]
    }

    fn name(&self) -> &'static str {
        "Conv2d"
    }
}

/// Strided "same" padded transposed convolution, `[n, h, w, in] -> [n, h * stride, w * stride, out]`
pub struct ConvTranspose2d {
    kernel: Tensor,
    bias: Tensor,
    stride: usize,
}

impl ConvTranspose2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, NNError> {
        let area = kernel_size * kernel_size;
        Ok(Self {
            kernel: glorot_uniform(
                &[kernel_size, kernel_size, out_channels, in_channels],
                area * in_channels,
                area * out_channels,
                rng,
            )?,
            bias: Tensor::parameter(vec![0.0; out_channels], &[out_channels])?,
            stride,
        })
    }
}

impl Layer for ConvTranspose2d {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let [_, _, _, channels] = expect_rank::<4>(self.name(), &input.shape())?;
        let expected = self.kernel.shape()[3];
        if channels != expected {
            return Err(NNError::InputSizeMismatch {
                layer: self.name(),
                expected,
                got: channels,
            });
        }
        Ok(input
            .conv_transpose2d(&self.kernel, self.stride)?
            .add_bias(&self.bias)?)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.kernel.clone(), self.bias.clone()]
    }

    fn name(&self) -> &'static str {
        "ConvTranspose2d"
    }
}

/// Batch normalization over the last axis. Training mode normalizes with the statistics of the
/// batch and folds them into running statistics, which evaluation mode uses instead.
pub struct BatchNorm {
    gamma: Tensor,
    beta: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    momentum: f32,
    epsilon: f32,
}

impl BatchNorm {
    pub const DEFAULT_MOMENTUM: f32 = 0.99;
    pub const DEFAULT_EPSILON: f32 = 1e-3;

    pub fn new(channels: usize) -> Result<Self, NNError> {
        Ok(Self {
            gamma: Tensor::parameter(vec![1.0; channels], &[channels])?,
            beta: Tensor::parameter(vec![0.0; channels], &[channels])?,
            running_mean: Tensor::zeros(&[channels]),
            running_var: Tensor::full(&[channels], 1.0),
            momentum: Self::DEFAULT_MOMENTUM,
            epsilon: Self::DEFAULT_EPSILON,
        })
    }
}

impl Layer for BatchNorm {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let shape = input.shape();
        let channels = self.gamma.numel();
        if shape.last() != Some(&channels) {
            return Err(NNError::InputSizeMismatch {
                layer: self.name(),
                expected: channels,
                got: shape.last().copied().unwrap_or(0),
            });
        }
        match mode {
            Mode::Train => {
                let (output, stats) = input.batch_norm(&self.gamma, &self.beta, self.epsilon)?;
                let momentum = self.momentum;
                // the handles share storage with the layer's own buffers
                let (mut running_mean, mut running_var) =
                    (self.running_mean.clone(), self.running_var.clone());
                running_mean.update_data(|mean| {
                    for (m, batch) in mean.iter_mut().zip(&stats.mean) {
                        *m = momentum * *m + (1.0 - momentum) * batch;
                    }
                });
                running_var.update_data(|var| {
                    for (v, batch) in var.iter_mut().zip(&stats.variance) {
                        *v = momentum * *v + (1.0 - momentum) * batch;
                    }
                });
                Ok(output)
            }
            Mode::Eval => {
                let (gamma, beta) = (self.gamma.data(), self.beta.data());
                let (mean, var) = (self.running_mean.data(), self.running_var.data());
                let mut data = input.to_vec();
                for row in data.chunks_exact_mut(channels) {
                    for c in 0..channels {
                        row[c] = gamma[c] * (row[c] - mean[c]) / (var[c] + self.epsilon).sqrt()
                            + beta[c];
                    }
                }
                Ok(Tensor::new(data, &shape)?)
            }
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn buffers(&self) -> Vec<Tensor> {
        vec![self.running_mean.clone(), self.running_var.clone()]
    }

    fn name(&self) -> &'static str {
        "BatchNorm"
    }
}

/// The nonlinearity applied by an [`Activation`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    ReLU,
    /// Leaks `slope * x` for negative inputs
    LeakyReLU(f32),
    Sigmoid,
}

/// Applies an elementwise activation, works for arbitrary input shapes
pub struct Activation {
    kind: ActivationKind,
    n_dead_neurons: AtomicUsize,
}

impl Activation {
    pub fn new(kind: ActivationKind) -> Self {
        Self {
            kind,
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    pub fn relu() -> Self {
        Self::new(ActivationKind::ReLU)
    }

    pub fn leaky_relu(slope: f32) -> Self {
        Self::new(ActivationKind::LeakyReLU(slope))
    }

    pub fn sigmoid() -> Self {
        Self::new(ActivationKind::Sigmoid)
    }

    /// Returns the number of non-positive inputs in the last forward pass (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

impl Layer for Activation {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let n_dead_neurons = input.data().iter().filter(|v| **v <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        if n_dead_neurons > 0 {
            log::debug!("{}: n_dead_neurons: {}", self.name(), n_dead_neurons);
        }
        Ok(match self.kind {
            ActivationKind::ReLU => input.relu(),
            ActivationKind::LeakyReLU(slope) => input.leaky_relu(slope),
            ActivationKind::Sigmoid => input.sigmoid(),
        })
    }

    fn name(&self) -> &'static str {
        match self.kind {
            ActivationKind::ReLU => "ReLU",
            ActivationKind::LeakyReLU(_) => "LeakyReLU",
            ActivationKind::Sigmoid => "Sigmoid",
        }
    }
}

/// Zeroes each unit with probability `rate` during training and rescales the survivors by
/// `1 / (1 - rate)`. The identity in evaluation mode.
pub struct Dropout {
    rate: f32,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    pub fn new(rate: f32, seed: u64) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&rate) {
            return Err(NNError::InvalidArchitecture(format!(
                "dropout rate {rate} outside [0, 1)"
            )));
        }
        Ok(Self {
            rate,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
        })
    }
}

impl Layer for Dropout {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        if mode == Mode::Eval || self.rate == 0.0 {
            return Ok(input.clone());
        }
        let scale = 1.0 / (1.0 - self.rate);
        let mut rng = self.rng.borrow_mut();
        let mask = (0..input.numel())
            .map(|_| {
                if rng.random::<f32>() < self.rate {
                    0.0
                } else {
                    scale
                }
            })
            .collect();
        Ok(input.dropout_with_mask(mask)?)
    }

    fn name(&self) -> &'static str {
        "Dropout"
    }
}

/// Reshapes every sample of the batch, `[n, ...] -> [n, shape...]`
pub struct Reshape {
    shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
        }
    }
}

impl Layer for Reshape {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let batch = input.shape().first().copied().unwrap_or(0);
        let mut shape = vec![batch];
        shape.extend_from_slice(&self.shape);
        Ok(input.reshape(&shape)?)
    }

    fn name(&self) -> &'static str {
        "Reshape"
    }
}

/// Flattens every sample of the batch, `[n, ...] -> [n, product(...)]`
#[derive(Default)]
pub struct Flatten;

impl Layer for Flatten {
    fn forward(&self, input: &Tensor, _mode: Mode) -> Result<Tensor, NNError> {
        let shape = input.shape();
        let Some((&batch, rest)) = shape.split_first() else {
            return Err(NNError::InputRankMismatch {
                layer: self.name(),
                expected: 2,
                shape,
            });
        };
        Ok(input.reshape(&[batch, rest.iter().product()])?)
    }

    fn name(&self) -> &'static str {
        "Flatten"
    }
}

/// An ordered pipeline of layers, the output of each feeds the next
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: vec![] }
    }

    pub fn add(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.name()).collect()
    }
}

impl Layer for Sequential {
    fn forward(&self, input: &Tensor, mode: Mode) -> Result<Tensor, NNError> {
        let mut output = input.clone();
        for layer in &self.layers {
            output = layer.forward(&output, mode)?;
            log::trace!("{} -> {:?}", layer.name(), output.shape());
        }
        Ok(output)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn buffers(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.buffers()).collect()
    }

    fn name(&self) -> &'static str {
        "Sequential"
    }
}
