use crate::{KernelElem, KernelError, Result, split_at_dim};
use rayon::prelude::*;

/// CPU implementation of `narrow`.
///
/// Copies the slab `[start, start + len)` of dimension `dim` into a new contiguous buffer.
/// This is the local half of every shard operation: a rank keeps only its own slab and
/// no communication is needed.
pub fn cpu_narrow<T, const RANK: usize>(
    data: &[T],
    shape: &[usize; RANK],
    dim: usize,
    start: usize,
    len: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    if dim >= RANK {
        return Err(KernelError::InvalidArgument(format!(
            "dim {dim} out of range for rank {RANK}"
        )));
    }
    if start + len > shape[dim] {
        return Err(KernelError::OutOfBounds {
            dim,
            start,
            len,
            size: shape[dim],
        });
    }

    let (outer, dim_size, inner) = split_at_dim(shape, dim);
    let block = len * inner;
    let mut out = vec![T::zero(); outer * block];
    if block == 0 {
        return Ok(out);
    }

    // One output block per outer index; each is a contiguous copy from the source.
    out.par_chunks_mut(block).enumerate().for_each(|(o, dst)| {
        let src = o * dim_size * inner + start * inner;
        dst.copy_from_slice(&data[src..src + block]);
    });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_rows() {
        // [[1, 2], [3, 4], [5, 6]] rows 1..3
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = cpu_narrow(&data, &[3, 2], 0, 1, 2).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_narrow_cols() {
        // [[1, 2, 3], [4, 5, 6]] col 1..3
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let out = cpu_narrow(&data, &[2, 3], 1, 1, 2).unwrap();
        assert_eq!(out, vec![2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn test_narrow_middle_dim() {
        let data: Vec<i32> = (0..8).collect();
        // [2, 2, 2], keep index 1 of dim 1
        let out = cpu_narrow(&data, &[2, 2, 2], 1, 1, 1).unwrap();
        assert_eq!(out, vec![2, 3, 6, 7]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let data = vec![0.0f32; 4];
        let err = cpu_narrow(&data, &[2, 2], 0, 1, 2);
        assert!(matches!(err, Err(KernelError::OutOfBounds { .. })));
    }
}
