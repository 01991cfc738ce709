//! Storage abstraction for Tensors.
//!
//! "Storage" is the container that holds the raw numerical data of a tensor. While a `Tensor`
//! holds metadata like shape and strides, the `Storage` holds the actual bits. Sharding never
//! aliases storage across ranks: every gather or narrow produces a fresh contiguous buffer.

use crate::tensor::TensorElem;
use std::fmt::Debug;

/// A trait for the underlying data storage.
pub trait Storage<T>: Clone + Debug + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize;

    /// Returns `true` if the storage contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
    fn len(&self) -> usize {
        Vec::len(self)
    }
}
