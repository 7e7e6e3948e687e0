//! Reverse-mode gradients over recorded traces
//!
//! Operations on tensors only keep their graph edges while a trace is recording. A gradient is
//! always taken with respect to an explicit parameter set and is written into a fresh
//! [`Gradients`] value, so several gradient passes over one shared graph stay independent.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::{backprop_fns, backprop_fns::GradStore, tensor::Tensor};

thread_local! {
    /// Ids of the traces currently recording on this thread, innermost last
    static RECORDING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn active_traces() -> Vec<u64> {
    RECORDING.with(|recording| recording.borrow().clone())
}

/// Errors for gradient computation
#[derive(Debug, Error, PartialEq)]
pub enum TapeError {
    #[error("Gradients can only be taken of a single element output, got shape {shape:?}")]
    NotScalar { shape: Vec<usize> },
    #[error("Output was not recorded by trace {trace}")]
    NotRecorded { trace: u64 },
}

/// Handle to the operations recorded by one call to [`GradientEngine::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace {
    id: u64,
}

impl Trace {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Pops its trace off the recording stack, even if the computation panics
struct RecordingGuard {
    id: u64,
}

impl RecordingGuard {
    fn start() -> Self {
        static NEXT_TRACE: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_TRACE.fetch_add(1, Ordering::Relaxed);
        RECORDING.with(|recording| recording.borrow_mut().push(id));
        Self { id }
    }
}

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        RECORDING.with(|recording| recording.borrow_mut().retain(|&id| id != self.id));
    }
}

/// Gradients of a scalar with respect to a parameter set, keyed by parameter
#[derive(Debug, Default)]
pub struct Gradients {
    by_id: HashMap<u64, Vec<f32>>,
}

impl Gradients {
    /// Gradient for `param`, `None` when the output does not depend on it
    pub fn get(&self, param: &Tensor) -> Option<&[f32]> {
        self.by_id.get(&param.id()).map(Vec::as_slice)
    }

    pub fn contains(&self, param: &Tensor) -> bool {
        self.by_id.contains_key(&param.id())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// L2 norm over every gradient, used for diagnostics
    pub fn global_norm(&self) -> f32 {
        self.by_id
            .values()
            .flatten()
            .map(|g| g * g)
            .sum::<f32>()
            .sqrt()
    }
}

/// Capability to record computations and differentiate scalars produced by them
pub trait GradientEngine {
    /// Runs `computation`, recording every differentiable operation it performs.
    /// Recordings nest: an operation belongs to every trace active when it ran.
    fn record<T>(&self, computation: impl FnOnce() -> T) -> (T, Trace);

    /// Gradient of the scalar `output` with respect to each of `parameters`, following only
    /// operations recorded by `trace`
    fn gradient(
        &self,
        trace: &Trace,
        output: &Tensor,
        parameters: &[Tensor],
    ) -> Result<Gradients, TapeError>;
}

/// Reverse-mode automatic differentiation over the tensor graph
#[derive(Debug, Default, Clone, Copy)]
pub struct Tape;

impl Tape {
    pub fn new() -> Self {
        Self
    }
}

impl GradientEngine for Tape {
    fn record<T>(&self, computation: impl FnOnce() -> T) -> (T, Trace) {
        let guard = RecordingGuard::start();
        let trace = Trace { id: guard.id };
        let result = computation();
        drop(guard);
        (result, trace)
    }

    fn gradient(
        &self,
        trace: &Trace,
        output: &Tensor,
        parameters: &[Tensor],
    ) -> Result<Gradients, TapeError> {
        if output.numel() != 1 {
            return Err(TapeError::NotScalar {
                shape: output.shape(),
            });
        }
        if !output.is_recorded_in(trace.id) {
            return Err(TapeError::NotRecorded { trace: trace.id });
        }
        let targets = parameters.iter().map(Tensor::id).collect::<HashSet<_>>();

        // visit in post order, children before the nodes built from them
        let mut order = vec![];
        let mut visited = HashSet::new();
        visited.insert(output.id());
        visit(output, trace.id, &mut order, &mut visited);

        // only edges that lead to a requested parameter carry gradient
        let mut leads = HashSet::new();
        for node in &order {
            let inner = node.0.borrow();
            let reaches_target = targets.contains(&inner.id)
                || (inner.traces.contains(&trace.id)
                    && inner
                        .children
                        .iter()
                        .any(|c| leads.contains(&c.borrow().id)));
            if reaches_target {
                leads.insert(inner.id);
            }
        }

        let mut store = GradStore::default();
        if leads.contains(&output.id()) {
            store.accumulate(output.id(), vec![1.0]);
        }
        // apply backprop, reversed to start from the output
        for node in order.iter().rev() {
            let inner = node.0.borrow();
            if targets.contains(&inner.id) || !inner.traces.contains(&trace.id) {
                continue;
            }
            let Some(grad) = store.take(inner.id) else {
                continue;
            };
            let needs = inner
                .children
                .iter()
                .map(|c| leads.contains(&c.borrow().id))
                .collect::<Vec<_>>();
            backprop_fns::propagate(&inner, &grad, &needs, &mut store);
        }

        let by_id = targets
            .into_iter()
            .filter_map(|id| store.take(id).map(|grad| (id, grad)))
            .collect();
        Ok(Gradients { by_id })
    }
}

/// Collects the nodes reachable from `node` through operations recorded by `trace_id`
fn visit(node: &Tensor, trace_id: u64, order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
    if node.is_recorded_in(trace_id) {
        for c in node.0.borrow().children.iter() {
            let child_id = c.borrow().id;
            if visited.contains(&child_id) {
                continue;
            }
            visited.insert(child_id);
            visit(&Tensor(c.clone()), trace_id, order, visited);
        }
    }
    order.push(node.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_eq_float;

    fn param(values: &[f32]) -> Tensor {
        Tensor::parameter(values.to_vec(), &[values.len()]).unwrap()
    }

    #[test]
    fn test_add_gradients() {
        let a = param(&[2.0]);
        let b = param(&[3.0]);
        let tape = Tape::new();
        let (c, trace) = tape.record(|| a.add(&b).unwrap());
        assert_eq!(c.item().unwrap(), 5.0);

        let grads = tape
            .gradient(&trace, &c, &[a.clone(), b.clone()])
            .unwrap();
        // dc/da = 1, dc/db = 1
        assert_eq!(grads.get(&a), Some([1.0].as_slice()));
        assert_eq!(grads.get(&b), Some([1.0].as_slice()));
    }

    #[test]
    fn test_shared_operand_accumulates() {
        let a = param(&[2.0]);
        let tape = Tape::new();
        let (c, trace) = tape.record(|| a.add(&a).unwrap().add(&a).unwrap());
        let grads = tape.gradient(&trace, &c, std::slice::from_ref(&a)).unwrap();
        assert_eq!(grads.get(&a), Some([3.0].as_slice()));
    }

    #[test]
    fn test_only_requested_parameters() {
        let a = param(&[1.0]);
        let b = param(&[-1.0]);
        let tape = Tape::new();
        let (loss, trace) = tape.record(|| a.add(&b).unwrap().bce_with_logits(1.0).unwrap());
        let grads = tape.gradient(&trace, &loss, std::slice::from_ref(&a)).unwrap();
        assert!(grads.contains(&a));
        assert!(!grads.contains(&b));
        assert_eq!(grads.len(), 1);
    }

    #[test]
    fn test_unrelated_parameter_is_absent() {
        let a = param(&[1.0]);
        let unrelated = param(&[4.0]);
        let tape = Tape::new();
        let (loss, trace) = tape.record(|| a.bce_with_logits(0.0).unwrap());
        let grads = tape
            .gradient(&trace, &loss, std::slice::from_ref(&unrelated))
            .unwrap();
        assert!(grads.is_empty());
    }

    #[test]
    fn test_two_passes_over_a_shared_graph_are_independent() {
        let a = param(&[0.5, -1.0]);
        let b = param(&[2.0, 0.25]);
        let tape = Tape::new();

        // a shared intermediate feeds two losses
        let ((loss_a, loss_b), trace) = tape.record(|| {
            let shared = a.add(&b).unwrap().leaky_relu(0.3);
            (
                shared.bce_with_logits(1.0).unwrap(),
                shared.bce_with_logits(0.0).unwrap(),
            )
        });
        let grads_b_first = tape.gradient(&trace, &loss_b, std::slice::from_ref(&b)).unwrap();
        let grads_a = tape.gradient(&trace, &loss_a, std::slice::from_ref(&a)).unwrap();

        // the same loss differentiated on a graph that never produced loss_b
        let (isolated, isolated_trace) = tape.record(|| {
            a.add(&b)
                .unwrap()
                .leaky_relu(0.3)
                .bce_with_logits(1.0)
                .unwrap()
        });
        let grads_isolated = tape
            .gradient(&isolated_trace, &isolated, std::slice::from_ref(&a))
            .unwrap();

        assert_eq!(grads_a.get(&a), grads_isolated.get(&a));
        assert!(!grads_b_first.contains(&a));
        assert!(!grads_a.contains(&b));
    }

    #[test]
    fn test_nested_traces() {
        let a = param(&[1.0]);
        let tape = Tape::new();
        let ((out, inner), outer) = tape.record(|| tape.record(|| a.relu().bce_with_logits(1.0).unwrap()));
        assert_ne!(inner, outer);
        let from_inner = tape.gradient(&inner, &out, std::slice::from_ref(&a)).unwrap();
        let from_outer = tape.gradient(&outer, &out, std::slice::from_ref(&a)).unwrap();
        assert_eq!(from_inner.get(&a), from_outer.get(&a));
        assert!(active_traces().is_empty());
    }

    #[test]
    fn test_errors() {
        let a = param(&[1.0, 2.0]);
        let tape = Tape::new();
        let (out, trace) = tape.record(|| a.relu());
        assert_eq!(
            tape.gradient(&trace, &out, std::slice::from_ref(&a))
                .unwrap_err(),
            TapeError::NotScalar { shape: vec![2] }
        );

        let (_, other_trace) = tape.record(|| ());
        let (loss, _) = tape.record(|| a.bce_with_logits(1.0).unwrap());
        assert_eq!(
            tape.gradient(&other_trace, &loss, std::slice::from_ref(&a))
                .unwrap_err(),
            TapeError::NotRecorded {
                trace: other_trace.id()
            }
        );
    }

    #[test]
    fn test_global_norm() {
        let a = param(&[3.0]);
        let b = param(&[0.0]);
        let tape = Tape::new();
        // d(a + a + b)/da = 2, d/db = 1
        let (out, trace) = tape.record(|| a.add(&a).unwrap().add(&b).unwrap());
        let grads = tape.gradient(&trace, &out, &[a, b]).unwrap();
        assert_eq_float!(grads.global_norm(), 5.0f32.sqrt());
    }
}
