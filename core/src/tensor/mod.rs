//! Core Tensor implementation.
//!
//! # What is a Tensor here?
//!
//! Everything in `shard-rs` that moves across ranks is a **Tensor**: parameter shards, gathered
//! full parameters, gradient buckets, and the activations that get resharded between layouts.
//! A `Tensor` is defined by:
//! 1. **Data**: A flat vector of elements (usually `f32`, or `f16`/`bf16` for compute copies).
//! 2. **Shape**: An array of dimensions (e.g., `[2, 3]`).
//! 3. **Strides**: How to step through the flat data to traverse dimensions.
//!
//! ## Example: Creating and Inspecting a Tensor
//!
//! ```rust
//! use shard_rs::tensor::Tensor;
//!
//! // Create a 2x3 matrix (Rank 2 Tensor)
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f32, 2>::new(data, [2, 3]).unwrap();
//!
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```
//!
//! > [!TIP]
//! > **Expert Note: Why row-major matters for sharding**
//! > Tensors are **Row-Major** (C-style). Sharding along dimension 0 therefore hands each rank a
//! > contiguous slab, while sharding along the last dimension produces strided pieces that must be
//! > copied out. The `narrow` and `cat` kernels hide this difference, but it is why sharding the
//! > batch dimension is the cheapest layout to materialize.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod device;
pub mod dtype;
pub mod ops;
pub mod storage;

pub use device::{Cpu, Device};
pub use dtype::{ComputeElem, DType};
pub use storage::Storage;

/// Error type for Tensor operations.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl From<shard_rs_kernels::KernelError> for TensorError {
    fn from(e: shard_rs_kernels::KernelError) -> Self {
        use shard_rs_kernels::KernelError;
        match e {
            KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            KernelError::OutOfBounds {
                dim,
                start,
                len,
                size,
            } => TensorError::IndexOutOfBounds {
                index: vec![dim, start + len],
                shape: vec![size],
            },
            KernelError::InvalidArgument(msg) => TensorError::Unsupported(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Trait bound for elements that can be stored in a Tensor.
///
/// # Requirements
/// - `Copy + Clone`: Essential for efficient storage in contiguous memory (e.g., `Vec<T>`) and fast element access.
/// - `Num + ...`: Provides necessary numeric operations for tensor math.
/// - `Send + Sync`: Required for parallel execution via `rayon` and for crossing rank threads.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// The core Tensor struct.
///
/// Represents an N-dimensional array of elements.
///
/// # Generics
///
/// - `T`: The element type (must implement `TensorElem`).
/// - `RANK`: The number of dimensions (const generic).
/// - `D`: The device where data is stored (defaults to `Cpu`).
///
/// The rank lives in the type while the shape stays a runtime value: a sharded tensor keeps the
/// rank of its full counterpart but every rank sees a different extent along the sharded
/// dimensions.
#[derive(Clone)]
pub struct Tensor<T, const RANK: usize, D: Device = Cpu>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: D::Storage<T>,
    device: D,
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        let strides = compute_strides(&shape);
        Ok(Self {
            shape,
            strides,
            data,
            device: Cpu,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self::from_vec_unchecked(vec![T::zero(); size], shape)
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        let size: usize = shape.iter().product();
        Self::from_vec_unchecked(vec![T::one(); size], shape)
    }

    /// Creates a new Tensor whose element at flat index `i` is `f(i)`.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: Fn(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self::from_vec_unchecked((0..size).map(f).collect(), shape)
    }

    /// Builds a tensor from a buffer that the caller already sized to `shape`.
    pub(crate) fn from_vec_unchecked(data: Vec<T>, shape: [usize; RANK]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        let strides = compute_strides(&shape);
        Self {
            shape,
            strides,
            data,
            device: Cpu,
        }
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK, Cpu>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        let strides = compute_strides(&new_shape);
        Ok(Tensor {
            shape: new_shape,
            strides,
            data: self.data,
            device: self.device,
        })
    }

    /// Flattens the tensor into rank 1 without copying.
    pub fn flatten(self) -> Tensor<T, 1, Cpu> {
        let size = self.size();
        Tensor::from_vec_unchecked(self.data, [size])
    }

    /// Consumes the tensor and returns its flat buffer.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

/// Computes the strides for a given shape.
///
/// This implementation assumes a row-major (C-style) memory layout.
const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize, D: Device> Tensor<T, RANK, D>
where
    T: TensorElem,
{
    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        self.data.as_slice()
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }

    /// Returns the total number of elements in the tensor.
    pub const fn size(&self) -> usize {
        let mut size = 1;
        let mut i = 0;
        while i < RANK {
            size *= self.shape[i];
            i += 1;
        }
        size
    }
}

impl<T, const RANK: usize, D: Device> Debug for Tensor<T, RANK, D>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("device", &self.device.name())
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl<T, const RANK: usize> PartialEq for Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        // Size mismatch
        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros_ones_from_fn() {
        let zeros = Tensor::<f32, 2>::zeros([2, 3]);
        assert_eq!(zeros.data(), &[0.0; 6]);

        let ones = Tensor::<f32, 2>::ones([2, 3]);
        assert_eq!(ones.data(), &[1.0; 6]);

        let iota = Tensor::<i64, 1>::from_fn([4], |i| i as i64);
        assert_eq!(iota.data(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_reshape_and_flatten() {
        let tensor = Tensor::<f32, 2>::zeros([2, 3]);

        let reshaped = tensor.reshape([3, 2]).unwrap();
        assert_eq!(reshaped.shape(), &[3, 2]);

        let err = reshaped.clone().reshape([4, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));

        let flat = reshaped.flatten();
        assert_eq!(flat.shape(), &[6]);
    }

    #[test]
    fn test_compute_strides() {
        let strides = compute_strides(&[2, 3, 4]);
        assert_eq!(strides, [12, 4, 1]);
    }

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![2, 2],
            got: vec![4],
        };
        assert_eq!(
            format!("{}", err),
            "Shape mismatch: expected [2, 2], got [4]"
        );

        let err = TensorError::Unsupported("foo".to_string());
        assert_eq!(format!("{}", err), "Unsupported operation: foo");
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: TensorError = shard_rs_kernels::KernelError::OutOfBounds {
            dim: 0,
            start: 3,
            len: 2,
            size: 4,
        }
        .into();
        assert!(matches!(err, TensorError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn test_tensor_debug() {
        let t = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        let debug_str = format!("{:?}", t);
        assert!(debug_str.contains("Tensor"));
        assert!(debug_str.contains("CPU"));
    }

    #[test]
    fn test_tensor_eq() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = a.clone().reshape([2]).unwrap();
        assert_eq!(a, b);
        let c = Tensor::<f32, 2>::new(vec![1.0, 2.0], [1, 2]).unwrap();
        assert_ne!(a.data().len(), 0);
        assert_eq!(c.clone().flatten(), a);
    }
}
