use crate::{KernelElem, KernelError, Result};

/// Smallest multiple of `multiple` that is `>= len`.
pub fn padded_len(len: usize, multiple: usize) -> usize {
    len.div_ceil(multiple) * multiple
}

/// Zero-pads a flat buffer up to the next multiple of `multiple`.
///
/// Returns the padded buffer and the number of padding elements appended.
pub fn cpu_pad_to_multiple<T>(data: &[T], multiple: usize) -> Result<(Vec<T>, usize)>
where
    T: KernelElem,
{
    if multiple == 0 {
        return Err(KernelError::InvalidArgument(
            "padding multiple must be positive".into(),
        ));
    }
    let target = padded_len(data.len(), multiple);
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(data);
    out.resize(target, T::zero());
    Ok((out, target - data.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_ten_to_four() {
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let (out, pad) = cpu_pad_to_multiple(&data, 4).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(pad, 2);
        assert_eq!(&out[10..], &[0.0, 0.0]);
    }

    #[test]
    fn test_pad_already_aligned() {
        let (out, pad) = cpu_pad_to_multiple(&[1, 2, 3, 4], 2).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(pad, 0);
    }

    #[test]
    fn test_pad_zero_multiple() {
        assert!(cpu_pad_to_multiple(&[1.0f32], 0).is_err());
    }
}
