//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph. Gradients are accumulated into a [`GradStore`] owned by a
//! single gradient pass rather than on the nodes themselves.

use std::collections::{HashMap, hash_map::Entry};

use crate::{
    conv::{self, ConvGeometry},
    tensor::{InnerTensor, sigmoid},
};

/// Represents the function in the computation graph, along with whatever the forward
/// pass saved for the backward pass
#[derive(Debug, Clone)]
pub enum BackpropFunc {
    Add,
    MatMul,
    AddBias,
    Conv2d(ConvGeometry),
    ConvTranspose2d(ConvGeometry),
    BatchNorm {
        normalized: Vec<f32>,
        inv_std: Vec<f32>,
    },
    ReLU,
    LeakyReLU {
        slope: f32,
    },
    Sigmoid,
    Dropout {
        mask: Vec<f32>,
    },
    Reshape,
    BceWithLogits {
        target: f32,
    },
}

impl BackpropFunc {
    pub fn n_operands(&self) -> usize {
        match self {
            BackpropFunc::Add => 2,
            BackpropFunc::MatMul => 2,
            BackpropFunc::AddBias => 2,
            BackpropFunc::Conv2d(_) => 2,
            BackpropFunc::ConvTranspose2d(_) => 2,
            BackpropFunc::BatchNorm { .. } => 3,
            BackpropFunc::ReLU => 1,
            BackpropFunc::LeakyReLU { .. } => 1,
            BackpropFunc::Sigmoid => 1,
            BackpropFunc::Dropout { .. } => 1,
            BackpropFunc::Reshape => 1,
            BackpropFunc::BceWithLogits { .. } => 1,
        }
    }
}

/// Gradients of one backward pass, keyed by node id
#[derive(Debug, Default)]
pub(crate) struct GradStore {
    grads: HashMap<u64, Vec<f32>>,
}

impl GradStore {
    pub(crate) fn accumulate(&mut self, id: u64, grad: Vec<f32>) {
        match self.grads.entry(id) {
            Entry::Occupied(mut entry) => {
                for (acc, g) in entry.get_mut().iter_mut().zip(grad) {
                    *acc += g;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(grad);
            }
        }
    }

    pub(crate) fn take(&mut self, id: u64) -> Option<Vec<f32>> {
        self.grads.remove(&id)
    }
}

/// Represents backprop for `in1 + in2 = out`
fn add(out: &InnerTensor, grad: &[f32], needs: &[bool], store: &mut GradStore) {
    for (child, _) in out.children.iter().zip(needs).filter(|(_, need)| **need) {
        store.accumulate(child.borrow().id, grad.to_vec());
    }
}

/// Represents backprop for `x @ w = out` with `x: [n, k]` and `w: [k, m]`
fn matmul(out: &InnerTensor, grad: &[f32], needs: &[bool], store: &mut GradStore) {
    let x = out.children[0].borrow();
    let w = out.children[1].borrow();
    let (n, k) = (x.shape[0], x.shape[1]);
    let m = w.shape[1];
    if needs[0] {
        // dx = grad @ w^T
        let mut dx = vec![0.0; n * k];
        for i in 0..n {
            let g_row = &grad[i * m..(i + 1) * m];
            for (p, dx) in dx[i * k..(i + 1) * k].iter_mut().enumerate() {
                *dx = g_row
                    .iter()
                    .zip(&w.data[p * m..(p + 1) * m])
                    .map(|(g, w)| g * w)
                    .sum();
            }
        }
        store.accumulate(x.id, dx);
    }
    if needs[1] {
        // dw = x^T @ grad
        let mut dw = vec![0.0; k * m];
        for i in 0..n {
            let g_row = &grad[i * m..(i + 1) * m];
            for p in 0..k {
                let xv = x.data[i * k + p];
                if xv == 0.0 {
                    continue;
                }
                for (dw, g) in dw[p * m..(p + 1) * m].iter_mut().zip(g_row) {
                    *dw += xv * g;
                }
            }
        }
        store.accumulate(w.id, dw);
    }
}

/// Represents backprop for adding a bias along the last axis
fn add_bias(out: &InnerTensor, grad: &[f32], needs: &[bool], store: &mut GradStore) {
    if needs[0] {
        store.accumulate(out.children[0].borrow().id, grad.to_vec());
    }
    if needs[1] {
        let bias = out.children[1].borrow();
        let channels = bias.data.len();
        let mut db = vec![0.0; channels];
        for row in grad.chunks_exact(channels) {
            for (db, g) in db.iter_mut().zip(row) {
                *db += g;
            }
        }
        store.accumulate(bias.id, db);
    }
}

fn conv2d(
    geometry: &ConvGeometry,
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    store: &mut GradStore,
) {
    let x = out.children[0].borrow();
    let w = out.children[1].borrow();
    if needs[0] {
        store.accumulate(x.id, conv::scatter(geometry, grad, &w.data));
    }
    if needs[1] {
        store.accumulate(w.id, conv::weight_grad(geometry, &x.data, grad));
    }
}

fn conv_transpose2d(
    geometry: &ConvGeometry,
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    store: &mut GradStore,
) {
    let x = out.children[0].borrow();
    let w = out.children[1].borrow();
    if needs[0] {
        store.accumulate(x.id, conv::correlate(geometry, grad, &w.data));
    }
    if needs[1] {
        store.accumulate(w.id, conv::weight_grad(geometry, grad, &x.data));
    }
}

/// Represents backprop for training mode batch normalization
/// `out = gamma * normalized + beta`, statistics taken over every axis but the last
fn batch_norm(
    normalized: &[f32],
    inv_std: &[f32],
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    store: &mut GradStore,
) {
    let channels = inv_std.len();
    let rows = (grad.len() / channels) as f32;
    let mut sum_grad = vec![0.0; channels];
    let mut sum_grad_norm = vec![0.0; channels];
    for (g_row, n_row) in grad
        .chunks_exact(channels)
        .zip(normalized.chunks_exact(channels))
    {
        for c in 0..channels {
            sum_grad[c] += g_row[c];
            sum_grad_norm[c] += g_row[c] * n_row[c];
        }
    }

    if needs[0] {
        let gamma = out.children[1].borrow();
        let mut dx = vec![0.0; grad.len()];
        for ((dx_row, g_row), n_row) in dx
            .chunks_exact_mut(channels)
            .zip(grad.chunks_exact(channels))
            .zip(normalized.chunks_exact(channels))
        {
            for c in 0..channels {
                let scale = gamma.data[c] * inv_std[c] / rows;
                dx_row[c] = scale * (rows * g_row[c] - sum_grad[c] - n_row[c] * sum_grad_norm[c]);
            }
        }
        store.accumulate(out.children[0].borrow().id, dx);
    }
    if needs[1] {
        store.accumulate(out.children[1].borrow().id, sum_grad_norm);
    }
    if needs[2] {
        store.accumulate(out.children[2].borrow().id, sum_grad);
    }
}

/// Elementwise backprop `d in = grad * f(in, out)` for single operand functions
fn elementwise(
    out: &InnerTensor,
    grad: &[f32],
    needs: &[bool],
    store: &mut GradStore,
    local_grad: impl Fn(usize, f32, f32) -> f32,
) {
    if !needs[0] {
        return;
    }
    let input = out.children[0].borrow();
    let d_input = grad
        .iter()
        .zip(input.data.iter().zip(&out.data))
        .enumerate()
        .map(|(i, (g, (x, y)))| g * local_grad(i, *x, *y))
        .collect();
    store.accumulate(input.id, d_input);
}

/// Represents backprop for `mean(bce(sigmoid(in), target)) = out`
fn bce_with_logits(target: f32, out: &InnerTensor, grad: &[f32], needs: &[bool], store: &mut GradStore) {
    if !needs[0] {
        return;
    }
    let logits = out.children[0].borrow();
    let scale = grad[0] / logits.data.len() as f32;
    let d_logits = logits
        .data
        .iter()
        .map(|x| scale * (sigmoid(*x) - target))
        .collect();
    store.accumulate(logits.id, d_logits);
}

/// Applies the backprop function of `out`, pushing `grad` (the gradient of `out`) into the
/// operands flagged in `needs`
pub(crate) fn propagate(out: &InnerTensor, grad: &[f32], needs: &[bool], store: &mut GradStore) {
    let Some(backprop_fn) = &out.backprop_fn else {
        return;
    };
    debug_assert_eq!(backprop_fn.n_operands(), out.children.len());
    debug_assert_eq!(needs.len(), out.children.len());
    match backprop_fn {
        BackpropFunc::Add => add(out, grad, needs, store),
        BackpropFunc::MatMul => matmul(out, grad, needs, store),
        BackpropFunc::AddBias => add_bias(out, grad, needs, store),
        BackpropFunc::Conv2d(geometry) => conv2d(geometry, out, grad, needs, store),
        BackpropFunc::ConvTranspose2d(geometry) => {
            conv_transpose2d(geometry, out, grad, needs, store)
        }
        BackpropFunc::BatchNorm {
            normalized,
            inv_std,
        } => batch_norm(normalized, inv_std, out, grad, needs, store),
        BackpropFunc::ReLU => elementwise(out, grad, needs, store, |_, x, _| {
            if x > 0.0 { 1.0 } else { 0.0 }
        }),
        BackpropFunc::LeakyReLU { slope } => elementwise(out, grad, needs, store, |_, x, _| {
            if x > 0.0 { 1.0 } else { *slope }
        }),
        BackpropFunc::Sigmoid => {
            elementwise(out, grad, needs, store, |_, _, y| y * (1.0 - y))
        }
        BackpropFunc::Dropout { mask } => elementwise(out, grad, needs, store, |i, _, _| mask[i]),
        BackpropFunc::Reshape => elementwise(out, grad, needs, store, |_, _, _| 1.0),
        BackpropFunc::BceWithLogits { target } => {
            bce_with_logits(*target, out, grad, needs, store)
        }
    }
}
