//! A parameter stored as a flat, padded shard.

use super::stateful::StatefulTensor;
use super::{Result, ZeroError};
use crate::tensor::{ComputeElem, Tensor, TensorElem, TensorError};

/// Zero-pads a flat tensor to a multiple of `num_chunks` and splits it into equal chunks.
///
/// ```rust
/// use shard_rs::tensor::Tensor;
/// use shard_rs::zero::chunk_and_pad;
///
/// let t = Tensor::<f32, 1>::from_fn([10], |i| i as f32);
/// let chunks = chunk_and_pad(&t, 4).unwrap();
/// assert_eq!(chunks.len(), 4);
/// assert_eq!(chunks[3].data(), &[9.0, 0.0, 0.0]);
/// ```
pub fn chunk_and_pad<T: TensorElem>(
    tensor: &Tensor<T, 1>,
    num_chunks: usize,
) -> crate::tensor::Result<Vec<Tensor<T, 1>>> {
    let (padded, _) = shard_rs_kernels::cpu_pad_to_multiple(tensor.data(), num_chunks)?;
    let len = padded.len();
    Tensor::new(padded, [len])?.chunk(num_chunks, 0)
}

/// Splits averaging over `world_size` ranks into a divide before the reduction and one after.
///
/// Returns the pre-divide factor: the first power of two `f` for which `world_size / f <= f` or
/// `f` no longer divides `world_size`. The post-divide factor is `world_size / f`.
pub fn get_gradient_predivide_factor(world_size: usize) -> f32 {
    let mut factor = 1;
    while world_size % factor == 0 && world_size / factor > factor {
        factor *= 2;
    }
    factor as f32
}

/// Which storage the parameter's data currently refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStorage {
    Fp32Shard,
    Fp16Shard,
    Full,
}

/// A parameter gradient, either full-sized (just produced, or accumulated under `no_sync`) or a
/// reduced shard aligned with the fp32 master shard.
#[derive(Debug, Clone)]
pub enum GradSlot<C: ComputeElem> {
    Full(Tensor<C, 1>),
    Shard(Tensor<f32, 1>),
}

impl<C: ComputeElem> GradSlot<C> {
    pub fn numel(&self) -> usize {
        match self {
            GradSlot::Full(t) => t.size(),
            GradSlot::Shard(t) => t.size(),
        }
    }
}

/// One managed parameter.
///
/// Outside forward and backward its data is the fp32 master shard. The full buffer is padded to
/// a multiple of the world size; [`full_data`](Self::full_data) hides the padding.
#[derive(Debug)]
pub struct ShardedParam<C: ComputeElem> {
    name: String,
    orig_shape: Vec<usize>,
    orig_numel: usize,
    num_padded: usize,
    is_sharded: bool,
    requires_grad: bool,
    pub(crate) fp32_shard: Tensor<f32, 1>,
    pub(crate) fp16_shard: StatefulTensor<C>,
    pub(crate) full: StatefulTensor<C>,
    pub(crate) storage: ParamStorage,
    pub(crate) grad: Option<GradSlot<C>>,
    pub(crate) saved_grad_shard: Option<Tensor<f32, 1>>,
    pub(crate) bwd_hook_registered: bool,
}

impl<C: ComputeElem> ShardedParam<C> {
    /// Wraps a full, unsharded parameter given in row-major order.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ZeroError::ParamSize {
                name,
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            name,
            orig_shape: shape,
            orig_numel: expected,
            num_padded: 0,
            is_sharded: false,
            requires_grad: true,
            fp32_shard: Tensor::new(data, [expected])?,
            fp16_shard: StatefulTensor::null(),
            full: StatefulTensor::null(),
            storage: ParamStorage::Fp32Shard,
            grad: None,
            saved_grad_shard: None,
            bwd_hook_registered: false,
        })
    }

    /// Excludes the parameter from gradient hooks.
    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Keeps only chunk `rank` of the padded parameter. A world of one leaves it unsharded.
    pub fn shard(&mut self, rank: usize, world_size: usize) -> Result<()> {
        if self.is_sharded || world_size == 1 {
            return Ok(());
        }
        self.fp32_shard = self.local_chunk(&self.fp32_shard, rank, world_size)?;
        self.num_padded = self.fp32_shard.size() * world_size - self.orig_numel;
        self.is_sharded = true;
        Ok(())
    }

    /// Replaces the master shard with chunk `rank` of a full, unpadded parameter.
    pub fn load_full(&mut self, full: &Tensor<f32, 1>, rank: usize, world_size: usize) -> Result<()> {
        if full.size() != self.orig_numel {
            return Err(ZeroError::ParamSize {
                name: self.name.clone(),
                shape: self.orig_shape.clone(),
                expected: self.orig_numel,
                got: full.size(),
            });
        }
        self.fp32_shard = if self.is_sharded {
            self.local_chunk(full, rank, world_size)?
        } else {
            full.clone()
        };
        self.fp16_shard.set_null();
        self.full.set_null();
        self.storage = ParamStorage::Fp32Shard;
        Ok(())
    }

    fn local_chunk(&self, flat: &Tensor<f32, 1>, rank: usize, world_size: usize) -> Result<Tensor<f32, 1>> {
        chunk_and_pad(flat, world_size)?
            .into_iter()
            .nth(rank)
            .ok_or_else(|| {
                ZeroError::Tensor(TensorError::IndexOutOfBounds {
                    index: vec![rank],
                    shape: vec![world_size],
                })
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn orig_shape(&self) -> &[usize] {
        &self.orig_shape
    }

    pub fn orig_numel(&self) -> usize {
        self.orig_numel
    }

    /// Zeros appended before sharding.
    pub fn num_padded(&self) -> usize {
        self.num_padded
    }

    pub fn is_sharded(&self) -> bool {
        self.is_sharded
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn storage(&self) -> ParamStorage {
        self.storage
    }

    pub fn fp32_shard(&self) -> &Tensor<f32, 1> {
        &self.fp32_shard
    }

    pub fn fp16_shard(&self) -> &StatefulTensor<C> {
        &self.fp16_shard
    }

    pub fn full(&self) -> &StatefulTensor<C> {
        &self.full
    }

    /// The gathered parameter without padding, while it is materialized.
    pub fn full_data(&self) -> Option<&[C]> {
        self.full.payload().map(|t| &t.data()[..self.orig_numel])
    }

    /// Number of elements the parameter's data currently exposes.
    pub fn data_numel(&self) -> usize {
        match self.storage {
            ParamStorage::Full => self.orig_numel,
            ParamStorage::Fp16Shard => self.fp16_shard.numel(),
            ParamStorage::Fp32Shard => self.fp32_shard.size(),
        }
    }

    pub fn grad(&self) -> Option<&GradSlot<C>> {
        self.grad.as_ref()
    }

    pub fn bwd_hook_registered(&self) -> bool {
        self.bwd_hook_registered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predivide_factors() {
        assert_eq!(get_gradient_predivide_factor(1), 1.0);
        assert_eq!(get_gradient_predivide_factor(2), 2.0);
        assert_eq!(get_gradient_predivide_factor(4), 2.0);
        assert_eq!(get_gradient_predivide_factor(8), 4.0);
        assert_eq!(get_gradient_predivide_factor(16), 4.0);
        // post-divide absorbs the rest
        assert_eq!(16.0 / get_gradient_predivide_factor(16), 4.0);
    }

    #[test]
    fn test_padding_round_trip() {
        let data: Vec<f32> = (0..10).map(|i| i as f32 + 0.5).collect();
        let shards: Vec<Tensor<f32, 1>> = (0..4)
            .map(|rank| {
                let mut p = ShardedParam::<f32>::new("w", vec![2, 5], data.clone()).unwrap();
                p.shard(rank, 4).unwrap();
                assert_eq!(p.num_padded(), 2);
                assert_eq!(p.fp32_shard().size(), 3);
                p.fp32_shard().clone()
            })
            .collect();

        let full = Tensor::cat(&shards, 0).unwrap();
        assert_eq!(full.size(), 12);
        let unpadded = full.narrow(0, 0, 10).unwrap();
        assert_eq!(unpadded.data(), data.as_slice());
    }

    #[test]
    fn test_single_rank_stays_unsharded() {
        let mut p = ShardedParam::<f32>::new("b", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        p.shard(0, 1).unwrap();
        assert!(!p.is_sharded());
        assert_eq!(p.data_numel(), 3);
    }

    #[test]
    fn test_size_checked() {
        let err = ShardedParam::<f32>::new("w", vec![2, 2], vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, ZeroError::ParamSize { expected: 4, got: 3, .. }));
    }

    #[test]
    fn test_load_full_reshards() {
        let mut p = ShardedParam::<f32>::new("w", vec![4], vec![0.0; 4]).unwrap();
        p.shard(1, 2).unwrap();
        let full = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [4]).unwrap();
        p.load_full(&full, 1, 2).unwrap();
        assert_eq!(p.fp32_shard().data(), &[3.0, 4.0]);
    }
}
