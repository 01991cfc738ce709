use super::Optimizer;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;

/// Stochastic gradient descent: `param = param - learning_rate * grad`.
#[derive(Debug, Clone)]
pub struct Sgd<T: TensorElem> {
    pub learning_rate: T,
}

impl<T: TensorElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self { learning_rate }
    }
}

impl<T: TensorElem> Optimizer<T> for Sgd<T> {
    fn update<const RANK: usize>(
        &self,
        param: &mut Tensor<T, RANK>,
        grad: &Tensor<T, RANK>,
    ) -> Result<()> {
        if param.shape() != grad.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                got: grad.shape().to_vec(),
            });
        }

        let lr = self.learning_rate;
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .for_each(|(p, g)| {
                *p = *p - lr * *g;
            });

        Ok(())
    }
}
