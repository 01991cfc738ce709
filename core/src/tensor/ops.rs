//! Tensor operations.
//!
//! # Overview
//!
//! This module implements the small mathematical engine that sharding needs:
//! - **Element-wise Arithmetic**: `+`, `-`, `*`, `/` with strict shape checking.
//! - **Data Movement**: `narrow`, `cat` and `chunk`, the building blocks of shard, gather and
//!   all-to-all.
//! - **Accumulation**: in-place `accumulate` and `scale`, used when gradients are summed into a
//!   persistent shard.
//!
//! # Parallelism
//!
//! > [!TIP]
//! > **Efficiency Note**: Operations are parallelized using `rayon`. For the tiny shards in unit
//! > tests the thread-pool overhead dominates; for real parameter shards (millions of elements)
//! > the copy bandwidth does.
//!
//! # Examples
//!
//! ```rust
//! use shard_rs::tensor::Tensor;
//!
//! let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
//! let parts = t.chunk(2, 0).unwrap();
//! assert_eq!(parts[1].data(), &[3.0, 4.0]);
//!
//! let back = Tensor::cat(&parts, 0).unwrap();
//! assert_eq!(back.data(), t.data());
//! ```

use super::{ComputeElem, Cpu, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// This macro handles the boilerplate of:
/// 1. Checking shape compatibility.
/// 2. Creating a new output tensor.
/// 3. Performing the element-wise operation in parallel using `rayon`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK, Cpu>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK, Cpu>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(self.data.as_slice().par_iter())
                    .zip(rhs.data.as_slice().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use shard_rs::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.data.as_slice().par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Returns the slab `[start, start + len)` of dimension `dim` as a new tensor.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let data = shard_rs_kernels::cpu_narrow(self.data.as_slice(), &self.shape, dim, start, len)?;
        let mut shape = self.shape;
        shape[dim] = len;
        Ok(Tensor::from_vec_unchecked(data, shape))
    }

    /// Concatenates tensors along `dim`.
    ///
    /// # Errors
    ///
    /// Fails on an empty list or when the parts disagree on any dimension other than `dim`.
    pub fn cat(parts: &[Self], dim: usize) -> Result<Self> {
        let views: Vec<(&[T], [usize; RANK])> =
            parts.iter().map(|p| (p.data.as_slice(), p.shape)).collect();
        let (data, shape) = shard_rs_kernels::cpu_concat(&views, dim)?;
        Ok(Tensor::from_vec_unchecked(data, shape))
    }

    /// Splits the tensor into `parts` equal pieces along `dim`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` when `shape[dim]` is not divisible by `parts`.
    pub fn chunk(&self, parts: usize, dim: usize) -> Result<Vec<Self>> {
        if dim >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![dim],
                shape: self.shape.to_vec(),
            });
        }
        if parts == 0 || self.shape[dim] % parts != 0 {
            return Err(TensorError::Unsupported(format!(
                "cannot split dim {dim} of size {} into {parts} equal chunks",
                self.shape[dim]
            )));
        }
        let len = self.shape[dim] / parts;
        (0..parts).map(|i| self.narrow(dim, i * len, len)).collect()
    }

    /// Adds `other` into `self` in place.
    pub fn accumulate(&mut self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Multiplies every element by `factor` in place.
    pub fn scale(&mut self, factor: T) {
        self.data.par_iter_mut().for_each(|x| *x *= factor);
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data
            .par_iter()
            .copied()
            .reduce(T::zero, |a, b| a + b)
    }
}

impl<T, const RANK: usize> Tensor<T, RANK, Cpu>
where
    T: ComputeElem,
{
    /// Converts between floating-point precisions through `f32`.
    pub fn cast<U: ComputeElem>(&self) -> Tensor<U, RANK, Cpu> {
        let data: Vec<U> = self
            .data
            .par_iter()
            .map(|x| U::from_master(x.to_master()))
            .collect();
        Tensor::from_vec_unchecked(data, self.shape)
    }
}
