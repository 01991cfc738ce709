//! Differentiable operations: element-wise add and mul, and full reduction to a scalar.

use super::{GradCell, GraphNode, Result, Variable, accumulate_grad};
use crate::tensor::{Cpu, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::ops::{Add, Mul};
use std::rc::Rc;

// --- Add Node ---
/// A node representing element-wise addition in the computation graph.
#[derive(Debug)]
struct AddNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for AddNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        // d(x+y)/dx = d(x+y)/dy = 1
        accumulate_grad(&self.lhs_grad, grad.clone())?;
        accumulate_grad(&self.rhs_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Add for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn add(self, rhs: Self) -> Self::Output {
        let data = (&self.data + &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(AddNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Variable::parents_of(&[self, rhs]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- Mul Node ---
/// A node representing element-wise multiplication in the computation graph.
#[derive(Debug)]
struct MulNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK, Cpu>,
    rhs_data: Tensor<T, RANK, Cpu>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for MulNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        // d(x*y)/dx = y, d(x*y)/dy = x
        accumulate_grad(&self.lhs_grad, (&self.rhs_data * &grad)?)?;
        accumulate_grad(&self.rhs_grad, (&self.lhs_data * &grad)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Mul for &Variable<T, RANK> {
    type Output = Result<Variable<T, RANK>>;

    fn mul(self, rhs: Self) -> Self::Output {
        let data = (&self.data * &rhs.data)?;
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(MulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Variable::parents_of(&[self, rhs]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

// --- Sum Node ---
/// Reduction of every element to a one-element tensor.
#[derive(Debug)]
struct SumNode<T: TensorElem, const RANK: usize> {
    input_shape: [usize; RANK],
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, 1>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for SumNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let g = grad.data()[0];
        let mut delta = Tensor::ones(self.input_shape);
        delta.scale(g);
        accumulate_grad(&self.input_grad, delta)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T: TensorElem + 'static, const RANK: usize> Variable<T, RANK> {
    /// Sum of all elements as a one-element variable.
    pub fn sum(&self) -> Variable<T, 1> {
        let data = Tensor::from_vec_unchecked(vec![self.data.sum()], [1]);
        let out_grad = Rc::new(RefCell::new(None));
        let node = Rc::new(SumNode {
            input_shape: *self.data.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Variable::parents_of(&[self]),
        });
        Variable::with_node(data, out_grad, node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_backward() {
        let a = Variable::new(Tensor::new(vec![1.0, 2.0], [2]).unwrap());
        let b = Variable::new(Tensor::new(vec![3.0, 4.0], [2]).unwrap());
        let c = (&a + &b).unwrap();
        c.backward().unwrap();
        assert_eq!(a.grad.borrow().as_ref().unwrap().data(), &[1.0, 1.0]);
        assert_eq!(b.grad.borrow().as_ref().unwrap().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_mul_sum_backward() {
        // loss = sum(a * b) => dloss/da = b
        let a = Variable::new(Tensor::new(vec![1.0, 2.0], [2]).unwrap());
        let b = Variable::new(Tensor::new(vec![3.0, 4.0], [2]).unwrap());
        let loss = (&a * &b).unwrap().sum();
        assert_eq!(loss.data.data(), &[11.0]);
        loss.backward().unwrap();
        assert_eq!(a.grad.borrow().as_ref().unwrap().data(), &[3.0, 4.0]);
        assert_eq!(b.grad.borrow().as_ref().unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_shape_mismatch_propagates() {
        let a = Variable::new(Tensor::<f32, 1>::zeros([2]));
        let b = Variable::new(Tensor::<f32, 1>::zeros([3]));
        assert!((&a + &b).is_err());
    }
}
