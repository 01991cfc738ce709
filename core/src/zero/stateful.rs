//! Tensors tagged with a residency state.

use super::{Result, ZeroError};
use crate::tensor::{Tensor, TensorElem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorState {
    Free,
    Hold,
    HoldAfterFwd,
    HoldAfterBwd,
}

/// A flat tensor whose payload exists iff its state is not [`TensorState::Free`].
#[derive(Debug, Clone)]
pub struct StatefulTensor<T: TensorElem> {
    state: TensorState,
    payload: Option<Tensor<T, 1>>,
}

impl<T: TensorElem> StatefulTensor<T> {
    pub fn new(tensor: Tensor<T, 1>, state: TensorState) -> Self {
        let payload = (state != TensorState::Free).then_some(tensor);
        Self { state, payload }
    }

    pub fn null() -> Self {
        Self {
            state: TensorState::Free,
            payload: None,
        }
    }

    pub fn state(&self) -> TensorState {
        self.state
    }

    pub fn is_null(&self) -> bool {
        debug_assert_eq!(self.state == TensorState::Free, self.payload.is_none());
        self.payload.is_none()
    }

    /// Drops the payload.
    pub fn set_null(&mut self) {
        self.state = TensorState::Free;
        self.payload = None;
    }

    /// Moves to `state`; moving to `Free` drops the payload.
    ///
    /// # Errors
    ///
    /// [`ZeroError::NullPayload`] when a free tensor is moved to a holding state.
    pub fn trans_state(&mut self, state: TensorState) -> Result<()> {
        if state == TensorState::Free {
            self.set_null();
        } else if self.payload.is_none() {
            return Err(ZeroError::NullPayload(state));
        } else {
            self.state = state;
        }
        Ok(())
    }

    pub fn payload(&self) -> Option<&Tensor<T, 1>> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut Tensor<T, 1>> {
        self.payload.as_mut()
    }

    /// Replaces the payload, holding it if the tensor was free.
    pub fn reset_payload(&mut self, tensor: Tensor<T, 1>) {
        if self.state == TensorState::Free {
            self.state = TensorState::Hold;
        }
        self.payload = Some(tensor);
    }

    pub fn numel(&self) -> usize {
        self.payload.as_ref().map_or(0, |t| t.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_follows_state() {
        let mut t = StatefulTensor::new(Tensor::<f32, 1>::ones([4]), TensorState::Hold);
        assert!(!t.is_null());
        t.trans_state(TensorState::HoldAfterFwd).unwrap();
        assert_eq!(t.numel(), 4);

        t.trans_state(TensorState::Free).unwrap();
        assert!(t.is_null());
        assert!(matches!(
            t.trans_state(TensorState::Hold),
            Err(ZeroError::NullPayload(TensorState::Hold))
        ));

        t.reset_payload(Tensor::zeros([2]));
        assert_eq!(t.state(), TensorState::Hold);
    }

    #[test]
    fn test_free_construction_drops_payload() {
        let t = StatefulTensor::new(Tensor::<f32, 1>::ones([4]), TensorState::Free);
        assert!(t.is_null());
        assert!(StatefulTensor::<f32>::null().payload().is_none());
    }
}
