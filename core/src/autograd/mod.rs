//! Automatic Differentiation (Autograd) module.
//!
//! `shard-rs` carries a small **Reverse-Mode AD** engine so that resharding can be part of a
//! differentiable computation: when an activation is converted from layout `A` to layout `B`
//! on the way forward, its gradient has to travel from `B` back to `A` on the way back.
//!
//! # How it Works
//!
//! 1. **Forward Pass**: operations on `Variable`s build a DAG of [`GraphNode`]s.
//! 2. **Backward Pass**: [`Variable::backward`] seeds the output gradient with ones and the
//!    engine visits nodes in reverse topological order, each pushing gradients to its inputs.
//!
//! Custom gradient rules are ordinary `GraphNode` implementations. The resharding rule lives in
//! [`crate::sharding::transform`].
//!
//! ```rust
//! use shard_rs::tensor::Tensor;
//! use shard_rs::autograd::Variable;
//!
//! let x = Variable::new(Tensor::new(vec![3.0], [1]).unwrap());
//! let y = (&x * &x).unwrap();
//! y.backward().unwrap();
//!
//! // dy/dx = 2x = 6
//! assert_eq!(x.grad.borrow().as_ref().unwrap().data()[0], 6.0);
//! ```

use crate::tensor::{Cpu, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;
use thiserror::Error;

pub mod engine;
pub mod ops;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error(transparent)]
    Tensor(#[from] crate::tensor::TensorError),
    #[error(transparent)]
    Sharding(#[from] crate::sharding::ShardingError),
}

pub type Result<T> = std::result::Result<T, AutogradError>;

/// Shared, lazily filled gradient slot.
pub type GradCell<T, const RANK: usize> = Rc<RefCell<Option<Tensor<T, RANK, Cpu>>>>;

/// A node in the computation graph.
pub trait GraphNode: Debug {
    /// Computes the gradient for this node and propagates it to its inputs.
    fn backward(&self) -> Result<()>;
    /// Returns the parent nodes of this node.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A variable in the computation graph.
///
/// Wraps a `Tensor` and tracks its gradient and the operation that created it.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    /// The actual tensor data.
    pub data: Tensor<T, RANK, Cpu>,
    /// The gradient of the loss with respect to this variable.
    pub grad: GradCell<T, RANK>,
    /// The node in the computation graph that produced this variable.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Creates a new leaf variable.
    pub fn new(data: Tensor<T, RANK, Cpu>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates a new variable produced by `node`, sharing `grad` with it.
    pub fn with_node(data: Tensor<T, RANK, Cpu>, grad: GradCell<T, RANK>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    /// Triggers the backward pass starting from this variable, seeding it with ones.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Tensor::ones(*self.data.shape()));
        }
        engine::backward(self.node.clone())
    }

    /// Parents list for a node consuming `inputs`.
    pub(crate) fn parents_of(inputs: &[&Self]) -> Vec<Rc<dyn GraphNode>> {
        inputs.iter().filter_map(|v| v.node.clone()).collect()
    }
}

/// Adds `delta` into a gradient slot, initialising it on first use.
pub(crate) fn accumulate_grad<T: TensorElem, const RANK: usize>(
    slot: &GradCell<T, RANK>,
    delta: Tensor<T, RANK, Cpu>,
) -> Result<()> {
    let mut slot = slot.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.accumulate(&delta)?,
        None => *slot = Some(delta),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_creation() {
        let data = Tensor::new(vec![1.0, 2.0], [2]).unwrap();
        let var = Variable::new(data.clone());

        assert_eq!(var.data.data(), data.data());
        assert!(var.grad.borrow().is_none());
        assert!(var.node.is_none());
    }

    #[test]
    fn test_variable_backward_seed() {
        let var = Variable::new(Tensor::new(vec![1.0], [1]).unwrap());
        var.backward().unwrap();
        assert_eq!(var.grad.borrow().as_ref().unwrap().data()[0], 1.0);
    }

    #[test]
    fn test_accumulate_grad() {
        let slot: GradCell<f32, 1> = Rc::new(RefCell::new(None));
        accumulate_grad(&slot, Tensor::ones([2])).unwrap();
        accumulate_grad(&slot, Tensor::ones([2])).unwrap();
        assert_eq!(slot.borrow().as_ref().unwrap().data(), &[2.0, 2.0]);
        assert!(accumulate_grad(&slot, Tensor::ones([3])).is_err());
    }
}
