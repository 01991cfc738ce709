//! Optimizers that update parameters in place.
//!
//! Under ZeRO every rank owns only a shard of each parameter and its reduced gradient, so
//! optimizers work on one tensor at a time and never see the full model.

pub mod sgd;
pub use sgd::Sgd;

use crate::tensor::{Result, Tensor, TensorElem};

pub trait Optimizer<T: TensorElem> {
    /// Applies one update to `param` given its gradient.
    ///
    /// # Errors
    ///
    /// Returns [`TensorError::ShapeMismatch`](crate::tensor::TensorError::ShapeMismatch) if
    /// `param` and `grad` differ in shape.
    fn update<const RANK: usize>(
        &self,
        param: &mut Tensor<T, RANK>,
        grad: &Tensor<T, RANK>,
    ) -> Result<()>;
}
