use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_concat;
pub mod cpu_narrow;
pub mod cpu_pad;

pub use cpu_concat::cpu_concat;
pub use cpu_narrow::cpu_narrow;
pub use cpu_pad::{cpu_pad_to_multiple, padded_len};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Slice [{start}, {start}+{len}) out of bounds for dim {dim} of size {size}")]
    OutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        size: usize,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
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

/// Splits `shape` around `dim` into `(outer, size, inner)` element counts.
///
/// Every row-major slice along `dim` is `outer` repetitions of a contiguous
/// `size * inner` block.
pub(crate) fn split_at_dim<const RANK: usize>(shape: &[usize; RANK], dim: usize) -> (usize, usize, usize) {
    let outer = shape[..dim].iter().product();
    let inner = shape[dim + 1..].iter().product();
    (outer, shape[dim], inner)
}
