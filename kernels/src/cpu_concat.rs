use crate::{KernelElem, KernelError, Result, split_at_dim};
use rayon::prelude::*;

/// CPU implementation of `cat` along one dimension.
///
/// All parts must agree on every dimension except `dim`. Returns the concatenated
/// buffer and its shape.
pub fn cpu_concat<T, const RANK: usize>(
    parts: &[(&[T], [usize; RANK])],
    dim: usize,
) -> Result<(Vec<T>, [usize; RANK])>
where
    T: KernelElem,
{
    let Some((_, first_shape)) = parts.first() else {
        return Err(KernelError::InvalidArgument(
            "cannot concatenate an empty list".into(),
        ));
    };
    if dim >= RANK {
        return Err(KernelError::InvalidArgument(format!(
            "dim {dim} out of range for rank {RANK}"
        )));
    }

    let mut out_shape = *first_shape;
    out_shape[dim] = 0;
    for (data, shape) in parts {
        for d in 0..RANK {
            if d != dim && shape[d] != first_shape[d] {
                return Err(KernelError::ShapeMismatch {
                    expected: first_shape.to_vec(),
                    got: shape.to_vec(),
                });
            }
        }
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(KernelError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }
        out_shape[dim] += shape[dim];
    }

    let (outer, total_dim, inner) = split_at_dim(&out_shape, dim);
    let row = total_dim * inner;
    let mut out = vec![T::zero(); outer * row];
    if row == 0 {
        return Ok((out, out_shape));
    }

    out.par_chunks_mut(row).enumerate().for_each(|(o, dst)| {
        let mut offset = 0;
        for (data, shape) in parts {
            let block = shape[dim] * inner;
            dst[offset..offset + block].copy_from_slice(&data[o * block..(o + 1) * block]);
            offset += block;
        }
    });

    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_dim0() {
        let a = vec![1.0, 2.0];
        let b = vec![3.0, 4.0, 5.0, 6.0];
        let (out, shape) = cpu_concat(&[(&a[..], [1, 2]), (&b[..], [2, 2])], 0).unwrap();
        assert_eq!(shape, [3, 2]);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_concat_dim1() {
        // [[1], [2]] ++ [[3, 4], [5, 6]]
        let a = vec![1, 2];
        let b = vec![3, 4, 5, 6];
        let (out, shape) = cpu_concat(&[(&a[..], [2, 1]), (&b[..], [2, 2])], 1).unwrap();
        assert_eq!(shape, [2, 3]);
        assert_eq!(out, vec![1, 3, 4, 2, 5, 6]);
    }

    #[test]
    fn test_concat_mismatch() {
        let a = vec![1.0f32; 4];
        let b = vec![1.0f32; 6];
        let err = cpu_concat(&[(&a[..], [2, 2]), (&b[..], [2, 3])], 0);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_concat_empty() {
        let parts: [(&[f32], [usize; 1]); 0] = [];
        assert!(cpu_concat(&parts, 0).is_err());
    }
}
