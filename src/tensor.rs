//! N-dimensional tensors which form a computation graph
//!
//! Images are laid out NHWC, `[batch, height, width, channels]`, in row-major order.
use std::{
    cell::{Ref, RefCell},
    fmt::{self, Display},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use crate::{
    backprop_fns::BackpropFunc,
    conv::{self, ConvGeometry},
    tape,
};

type SharedTensor = Rc<RefCell<InnerTensor>>;

/// Errors for tensor construction and operations
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Data of length {len} does not fit shape {shape:?}")]
    DataShapeMismatch { len: usize, shape: Vec<usize> },
    #[error("Shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("{op} expects a rank {expected} tensor, got shape {shape:?}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },
    #[error("Cannot reshape {from:?} into {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<usize> },
    #[error("Expected a single element tensor, got shape {shape:?}")]
    NotScalar { shape: Vec<usize> },
    #[error("{op} on an empty tensor")]
    Empty { op: &'static str },
}

/// Newtype representing a shared tensor in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedTensor);

/// Per-channel statistics of the batch a training mode batch norm was computed on
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatistics {
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
}

impl Tensor {
    /// Create a new constant tensor, not derived from any other tensor
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        check_len(&data, shape)?;
        Ok(Self::leaf(data, shape.to_vec(), false))
    }

    /// Create a trainable leaf, gradients can be taken with respect to it
    pub fn parameter(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        check_len(&data, shape)?;
        Ok(Self::leaf(data, shape.to_vec(), true))
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        Self::leaf(vec![value; shape.iter().product()], shape.to_vec(), false)
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn scalar(value: f32) -> Self {
        Self::leaf(vec![value], vec![], false)
    }

    /// Tensor of i.i.d. standard normal samples
    pub fn randn(shape: &[usize], rng: &mut impl Rng) -> Self {
        let data = (0..shape.iter().product())
            .map(|_| StandardNormal.sample(rng))
            .collect();
        Self::leaf(data, shape.to_vec(), false)
    }

    fn leaf(data: Vec<f32>, shape: Vec<usize>, requires_grad: bool) -> Self {
        Self(Rc::new(RefCell::new(InnerTensor::new(
            data,
            shape,
            requires_grad,
        ))))
    }

    /// Create a tensor derived from an operation on other tensors (i.e. not a leaf node).
    /// The edges to the operands are only kept while a trace is recording and some operand
    /// requires a gradient, otherwise the result is a constant.
    fn new_derived(
        data: Vec<f32>,
        shape: Vec<usize>,
        backprop_fn: BackpropFunc,
        operands: &[&Tensor],
    ) -> Self {
        let traces = tape::active_traces();
        if traces.is_empty() || !operands.iter().any(|t| t.requires_grad()) {
            return Self::leaf(data, shape, false);
        }
        let mut inner = InnerTensor::new(data, shape, true);
        inner.children = operands.iter().map(|t| t.0.clone()).collect();
        inner.backprop_fn = Some(backprop_fn);
        inner.traces = traces;
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn id(&self) -> u64 {
        self.0.borrow().id
    }

    pub fn shape(&self) -> Vec<usize> {
        self.0.borrow().shape.clone()
    }

    pub fn numel(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn data(&self) -> Ref<'_, [f32]> {
        Ref::map(self.0.borrow(), |inner| inner.data.as_slice())
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    /// The value of a single element tensor, e.g. a loss
    pub fn item(&self) -> Result<f32, TensorError> {
        let inner = self.0.borrow();
        match inner.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::NotScalar {
                shape: inner.shape.clone(),
            }),
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub(crate) fn is_recorded_in(&self, trace_id: u64) -> bool {
        self.0.borrow().traces.contains(&trace_id)
    }

    // Strictly, &mut isn't needed since the tensor is behind a shared mutable type,
    // but it indicates that the tensor should be exclusively mutable
    pub fn set_data(&mut self, data: Vec<f32>) -> Result<(), TensorError> {
        let mut inner = self.0.borrow_mut();
        check_len(&data, &inner.shape)?;
        inner.data = data;
        Ok(())
    }

    /// Mutates the data in place, the shape is left untouched
    pub fn update_data(&mut self, f: impl FnOnce(&mut [f32])) {
        f(self.0.borrow_mut().data.as_mut_slice())
    }
}

// Various operations on tensors
impl Tensor {
    /// Elementwise sum of two tensors of the same shape
    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let (lhs, rhs) = (self.0.borrow(), other.0.borrow());
        if lhs.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                op: "add",
                lhs: lhs.shape.clone(),
                rhs: rhs.shape.clone(),
            });
        }
        let data = lhs.data.iter().zip(&rhs.data).map(|(a, b)| a + b).collect();
        let shape = lhs.shape.clone();
        drop((lhs, rhs));
        Ok(Tensor::new_derived(data, shape, BackpropFunc::Add, &[self, other]))
    }

    /// Matrix product of `[n, k]` and `[k, m]`
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        let (x, w) = (self.0.borrow(), other.0.borrow());
        let [n, k] = rank::<2>("matmul", &x.shape)?;
        let [k2, m] = rank::<2>("matmul", &w.shape)?;
        if k != k2 {
            return Err(TensorError::ShapeMismatch {
                op: "matmul",
                lhs: x.shape.clone(),
                rhs: w.shape.clone(),
            });
        }
        let mut data = vec![0.0; n * m];
        for i in 0..n {
            let out_row = &mut data[i * m..(i + 1) * m];
            for p in 0..k {
                let xv = x.data[i * k + p];
                if xv == 0.0 {
                    continue;
                }
                for (o, w) in out_row.iter_mut().zip(&w.data[p * m..(p + 1) * m]) {
                    *o += xv * w;
                }
            }
        }
        drop((x, w));
        Ok(Tensor::new_derived(
            data,
            vec![n, m],
            BackpropFunc::MatMul,
            &[self, other],
        ))
    }

    /// Adds a `[channels]` bias along the last axis
    pub fn add_bias(&self, bias: &Tensor) -> Result<Tensor, TensorError> {
        let (x, b) = (self.0.borrow(), bias.0.borrow());
        if x.shape.last() != Some(&b.data.len()) || b.shape.len() != 1 {
            return Err(TensorError::ShapeMismatch {
                op: "add_bias",
                lhs: x.shape.clone(),
                rhs: b.shape.clone(),
            });
        }
        let channels = b.data.len();
        let mut data = x.data.clone();
        for row in data.chunks_exact_mut(channels) {
            for (v, b) in row.iter_mut().zip(&b.data) {
                *v += b;
            }
        }
        let shape = x.shape.clone();
        drop((x, b));
        Ok(Tensor::new_derived(
            data,
            shape,
            BackpropFunc::AddBias,
            &[self, bias],
        ))
    }

    /// "Same" padded strided convolution of `[n, h, w, c_in]` with a `[k, k, c_in, c_out]` kernel,
    /// producing `[n, ceil(h / stride), ceil(w / stride), c_out]`
    pub fn conv2d(&self, kernel: &Tensor, stride: usize) -> Result<Tensor, TensorError> {
        let (x, w) = (self.0.borrow(), kernel.0.borrow());
        let [n, h, width, c_in] = rank::<4>("conv2d", &x.shape)?;
        let [k, k2, w_in, c_out] = rank::<4>("conv2d", &w.shape)?;
        if k != k2 || w_in != c_in || stride == 0 {
            return Err(TensorError::ShapeMismatch {
                op: "conv2d",
                lhs: x.shape.clone(),
                rhs: w.shape.clone(),
            });
        }
        let geometry = ConvGeometry::conv(n, (h, width, c_in), c_out, k, stride);
        let data = conv::correlate(&geometry, &x.data, &w.data);
        drop((x, w));
        Ok(Tensor::new_derived(
            data,
            geometry.small_shape(),
            BackpropFunc::Conv2d(geometry),
            &[self, kernel],
        ))
    }

    /// "Same" padded transposed convolution of `[n, h, w, c_in]` with a `[k, k, c_out, c_in]`
    /// kernel, producing `[n, h * stride, w * stride, c_out]`
    pub fn conv_transpose2d(&self, kernel: &Tensor, stride: usize) -> Result<Tensor, TensorError> {
        let (x, w) = (self.0.borrow(), kernel.0.borrow());
        let [n, h, width, c_in] = rank::<4>("conv_transpose2d", &x.shape)?;
        let [k, k2, c_out, w_in] = rank::<4>("conv_transpose2d", &w.shape)?;
        if k != k2 || w_in != c_in || stride == 0 {
            return Err(TensorError::ShapeMismatch {
                op: "conv_transpose2d",
                lhs: x.shape.clone(),
                rhs: w.shape.clone(),
            });
        }
        let geometry = ConvGeometry::transposed(n, (h, width, c_in), c_out, k, stride);
        let data = conv::scatter(&geometry, &x.data, &w.data);
        drop((x, w));
        Ok(Tensor::new_derived(
            data,
            geometry.big_shape(),
            BackpropFunc::ConvTranspose2d(geometry),
            &[self, kernel],
        ))
    }

    /// Normalizes with the statistics of this batch, taken over every axis but the last, then
    /// scales by `gamma` and shifts by `beta`. Also returns the batch statistics.
    pub fn batch_norm(
        &self,
        gamma: &Tensor,
        beta: &Tensor,
        epsilon: f32,
    ) -> Result<(Tensor, BatchStatistics), TensorError> {
        let (x, g, b) = (self.0.borrow(), gamma.0.borrow(), beta.0.borrow());
        let channels = *x.shape.last().ok_or(TensorError::RankMismatch {
            op: "batch_norm",
            expected: 2,
            shape: x.shape.clone(),
        })?;
        if g.shape != [channels] || b.shape != [channels] {
            return Err(TensorError::ShapeMismatch {
                op: "batch_norm",
                lhs: x.shape.clone(),
                rhs: g.shape.clone(),
            });
        }
        if x.data.is_empty() {
            return Err(TensorError::Empty { op: "batch_norm" });
        }
        let rows = x.data.len() / channels;

        let mut mean = vec![0.0; channels];
        for row in x.data.chunks_exact(channels) {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= rows as f32);
        let mut variance = vec![0.0; channels];
        for row in x.data.chunks_exact(channels) {
            for ((var, v), m) in variance.iter_mut().zip(row).zip(&mean) {
                *var += (v - m).powi(2);
            }
        }
        variance.iter_mut().for_each(|v| *v /= rows as f32);
        let inv_std = variance
            .iter()
            .map(|v| 1.0 / (v + epsilon).sqrt())
            .collect::<Vec<_>>();

        let mut normalized = x.data.clone();
        let mut data = vec![0.0; x.data.len()];
        for (n_row, out_row) in normalized
            .chunks_exact_mut(channels)
            .zip(data.chunks_exact_mut(channels))
        {
            for c in 0..channels {
                n_row[c] = (n_row[c] - mean[c]) * inv_std[c];
                out_row[c] = g.data[c] * n_row[c] + b.data[c];
            }
        }
        let shape = x.shape.clone();
        drop((x, g, b));
        let out = Tensor::new_derived(
            data,
            shape,
            BackpropFunc::BatchNorm {
                normalized,
                inv_std,
            },
            &[self, gamma, beta],
        );
        Ok((out, BatchStatistics { mean, variance }))
    }

    pub fn relu(&self) -> Tensor {
        self.map(BackpropFunc::ReLU, |x| x.max(0.0))
    }

    /// ReLU which lets `slope * x` through for negative inputs
    pub fn leaky_relu(&self, slope: f32) -> Tensor {
        self.map(BackpropFunc::LeakyReLU { slope }, |x| {
            if x > 0.0 { x } else { slope * x }
        })
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(BackpropFunc::Sigmoid, sigmoid)
    }

    /// Multiplies elementwise by a fixed mask, the mask carries any rescaling
    pub fn dropout_with_mask(&self, mask: Vec<f32>) -> Result<Tensor, TensorError> {
        let x = self.0.borrow();
        if mask.len() != x.data.len() {
            return Err(TensorError::DataShapeMismatch {
                len: mask.len(),
                shape: x.shape.clone(),
            });
        }
        let data = x.data.iter().zip(&mask).map(|(x, m)| x * m).collect();
        let shape = x.shape.clone();
        drop(x);
        Ok(Tensor::new_derived(
            data,
            shape,
            BackpropFunc::Dropout { mask },
            &[self],
        ))
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, TensorError> {
        let x = self.0.borrow();
        if shape.iter().product::<usize>() != x.data.len() {
            return Err(TensorError::InvalidReshape {
                from: x.shape.clone(),
                to: shape.to_vec(),
            });
        }
        let data = x.data.clone();
        drop(x);
        Ok(Tensor::new_derived(
            data,
            shape.to_vec(),
            BackpropFunc::Reshape,
            &[self],
        ))
    }

    /// Mean binary cross-entropy between `sigmoid(self)` and a constant `target`, computed from
    /// the logits directly: `max(x, 0) - x * t + ln(1 + exp(-|x|))`
    pub fn bce_with_logits(&self, target: f32) -> Result<Tensor, TensorError> {
        let x = self.0.borrow();
        if x.data.is_empty() {
            return Err(TensorError::Empty {
                op: "bce_with_logits",
            });
        }
        let total = x
            .data
            .iter()
            .map(|&x| x.max(0.0) - x * target + (-x.abs()).exp().ln_1p())
            .sum::<f32>();
        let mean = total / x.data.len() as f32;
        drop(x);
        Ok(Tensor::new_derived(
            vec![mean],
            vec![],
            BackpropFunc::BceWithLogits { target },
            &[self],
        ))
    }

    fn map(&self, backprop_fn: BackpropFunc, f: impl Fn(f32) -> f32) -> Tensor {
        let x = self.0.borrow();
        let data = x.data.iter().map(|&v| f(v)).collect();
        let shape = x.shape.clone();
        drop(x);
        Tensor::new_derived(data, shape, backprop_fn, &[self])
    }
}

/// Numerically stable logistic function
pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn check_len(data: &[f32], shape: &[usize]) -> Result<(), TensorError> {
    if data.len() != shape.iter().product::<usize>() {
        return Err(TensorError::DataShapeMismatch {
            len: data.len(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

fn rank<const N: usize>(op: &'static str, shape: &[usize]) -> Result<[usize; N], TensorError> {
    shape.try_into().map_err(|_| TensorError::RankMismatch {
        op,
        expected: N,
        shape: shape.to_vec(),
    })
}

// summarise rather than dump, activations have tens of thousands of elements
impl Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        write!(f, "Tensor(shape={:?}, data=[", inner.shape)?;
        for (i, v) in inner.data.iter().take(6).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.4}")?;
        }
        if inner.data.len() > 6 {
            write!(f, ", ...")?;
        }
        write!(f, "], leaf={})", inner.backprop_fn.is_none())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        let (lhs, rhs) = (self.0.borrow(), other.0.borrow());
        lhs.shape == rhs.shape && lhs.data == rhs.data
    }
}

#[derive(Debug)]
pub(crate) struct InnerTensor {
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    pub(crate) children: Vec<SharedTensor>,
    /// Unique identifier for the node
    pub(crate) id: u64,
    /// The function which created this tensor from its children
    /// `None` when the tensor is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
    pub(crate) requires_grad: bool,
    /// Ids of the traces that were recording when this node was created
    pub(crate) traces: Vec<u64>,
}

impl InnerTensor {
    fn new(data: Vec<f32>, shape: Vec<usize>, requires_grad: bool) -> Self {
        Self {
            data,
            shape,
            children: vec![],
            id: next_id(),
            backprop_fn: None,
            requires_grad,
            traces: vec![],
        }
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
pub mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::tape::{GradientEngine, Tape};

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    #[test]
    fn test_construction_checks_shape() {
        assert!(Tensor::new(vec![1.0, 2.0, 3.0], &[3]).is_ok());
        assert_eq!(
            Tensor::new(vec![1.0, 2.0], &[3]).unwrap_err(),
            TensorError::DataShapeMismatch {
                len: 2,
                shape: vec![3]
            }
        );
        assert_eq!(Tensor::scalar(2.5).item().unwrap(), 2.5);
        assert!(matches!(
            Tensor::zeros(&[2, 2]).item(),
            Err(TensorError::NotScalar { .. })
        ));
    }

    #[test]
    fn test_matmul_and_bias() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let w = Tensor::new(vec![1.0, 0.0, 1.0, 1.0, 1.0, 0.0], &[2, 3]).unwrap();
        let b = Tensor::new(vec![0.5, 0.0, -0.5], &[3]).unwrap();
        let out = x.matmul(&w).unwrap().add_bias(&b).unwrap();
        assert_eq!(out.shape(), vec![2, 3]);
        assert_eq!(out.to_vec(), vec![3.5, 2.0, 0.5, 7.5, 4.0, 2.5]);

        let bad = Tensor::zeros(&[3, 1]);
        assert!(matches!(
            x.matmul(&bad),
            Err(TensorError::ShapeMismatch { op: "matmul", .. })
        ));
    }

    #[test]
    fn test_conv_shapes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let images = Tensor::randn(&[2, 28, 28, 1], &mut rng);
        let kernel = Tensor::randn(&[5, 5, 1, 4], &mut rng);
        assert_eq!(images.conv2d(&kernel, 2).unwrap().shape(), vec![2, 14, 14, 4]);

        let grid = Tensor::randn(&[2, 7, 7, 8], &mut rng);
        let kernel = Tensor::randn(&[5, 5, 3, 8], &mut rng);
        assert_eq!(
            grid.conv_transpose2d(&kernel, 2).unwrap().shape(),
            vec![2, 14, 14, 3]
        );
        assert_eq!(
            grid.conv_transpose2d(&kernel, 1).unwrap().shape(),
            vec![2, 7, 7, 3]
        );
        assert!(images.conv_transpose2d(&kernel, 2).is_err());
    }

    #[test]
    fn test_activations() {
        let x = Tensor::new(vec![-2.0, 0.0, 3.0], &[3]).unwrap();
        assert_eq!(x.relu().to_vec(), vec![0.0, 0.0, 3.0]);
        let leaky = x.leaky_relu(0.3).to_vec();
        assert_eq_float!(leaky[0], -0.6);
        assert_eq!(leaky[2], 3.0);
        let s = x.sigmoid().to_vec();
        assert_eq_float!(s[1], 0.5);
        assert!(s.iter().all(|v| (0.0..=1.0).contains(v)));
        // no overflow for large magnitudes
        let extreme = Tensor::new(vec![-1000.0, 1000.0], &[2]).unwrap().sigmoid();
        assert_eq!(extreme.to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_batch_norm_statistics() {
        let x = Tensor::new(vec![1.0, 10.0, 3.0, 20.0], &[2, 2]).unwrap();
        let gamma = Tensor::full(&[2], 1.0);
        let beta = Tensor::zeros(&[2]);
        let (out, stats) = x.batch_norm(&gamma, &beta, 0.0).unwrap();
        assert_eq!(stats.mean, vec![2.0, 15.0]);
        assert_eq!(stats.variance, vec![1.0, 25.0]);
        assert_eq!(out.to_vec(), vec![-1.0, -1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_bce_with_logits() {
        let logits = Tensor::new(vec![0.0, 0.0], &[2, 1]).unwrap();
        assert_eq_float!(logits.bce_with_logits(1.0).unwrap().item().unwrap(), 2.0f32.ln());
        let confident = Tensor::new(vec![100.0], &[1, 1]).unwrap();
        assert_eq_float!(confident.bce_with_logits(1.0).unwrap().item().unwrap(), 0.0);
        assert_eq_float!(confident.bce_with_logits(0.0).unwrap().item().unwrap(), 100.0);
    }

    #[test]
    fn test_no_graph_outside_recording() {
        let w = Tensor::parameter(vec![1.0, 2.0], &[2]).unwrap();
        let out = w.relu();
        assert!(!out.requires_grad());
        assert!(out.0.borrow().children.is_empty());

        let tape = Tape::new();
        let (recorded, trace) = tape.record(|| w.relu());
        assert!(recorded.requires_grad());
        assert!(recorded.is_recorded_in(trace.id()));
        assert_eq!(recorded.0.borrow().children.len(), 1);
    }

    #[test]
    fn test_reshape() {
        let x = Tensor::new((0..12).map(|v| v as f32).collect(), &[2, 6]).unwrap();
        let y = x.reshape(&[2, 3, 2, 1]).unwrap();
        assert_eq!(y.shape(), vec![2, 3, 2, 1]);
        assert_eq!(y.to_vec(), x.to_vec());
        assert!(matches!(
            x.reshape(&[5]),
            Err(TensorError::InvalidReshape { .. })
        ));
    }
}
