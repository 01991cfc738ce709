//! Materializing and releasing full parameters.

use super::sharded_param::{ParamStorage, ShardedParam};
use super::stateful::TensorState;
use super::{Result, ZeroError};
use crate::checkpoint::ParamTensor;
use crate::distributed::{CollectiveBackend, ProcessGroup};
use crate::tensor::{ComputeElem, Tensor};
use std::collections::HashSet;
use tracing::debug;

/// Owns the parameters of one sharded unit and moves them between shard and full form.
///
/// Every method that communicates issues its collectives in parameter order, so all members of
/// the group must call it together.
#[derive(Debug)]
pub struct ParamManager<C: ComputeElem> {
    params: Vec<ShardedParam<C>>,
    group: ProcessGroup,
    group_rank: usize,
    mixed_precision: bool,
}

impl<C: ComputeElem> ParamManager<C> {
    pub fn new(
        params: Vec<ShardedParam<C>>,
        group: ProcessGroup,
        global_rank: usize,
        mixed_precision: bool,
    ) -> Result<Self> {
        let group_rank = group.require_member(global_rank)?;
        let mut seen = HashSet::new();
        for p in &params {
            if !seen.insert(p.name()) {
                return Err(ZeroError::DuplicateParam(p.name().to_string()));
            }
        }
        Ok(Self {
            params,
            group,
            group_rank,
            mixed_precision,
        })
    }

    pub fn params(&self) -> &[ShardedParam<C>] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [ShardedParam<C>] {
        &mut self.params
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name() == name)
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn group_rank(&self) -> usize {
        self.group_rank
    }

    pub fn world_size(&self) -> usize {
        self.group.size()
    }

    /// Replaces every parameter by its local shard. Already sharded parameters are skipped.
    pub fn shard_parameters(&mut self) -> Result<()> {
        let world_size = self.world_size();
        for p in &mut self.params {
            p.shard(self.group_rank, world_size)?;
            debug!(
                param = p.name(),
                shard = p.fp32_shard().size(),
                padded = p.num_padded(),
                "sharded parameter"
            );
        }
        Ok(())
    }

    /// All-gathers every parameter that is not already materialized and points its data at the
    /// full buffer. Calling it twice without a free in between does not communicate again.
    pub fn rebuild_full_params<B: CollectiveBackend>(&mut self, backend: &B) -> Result<()> {
        for p in &mut self.params {
            if !p.full.is_null() {
                p.storage = ParamStorage::Full;
                continue;
            }

            let local: Tensor<C, 1> = if self.mixed_precision {
                let cached = p.fp16_shard.payload().cloned();
                match cached {
                    Some(t) => t,
                    None => {
                        let t = p.fp32_shard.cast::<C>();
                        p.fp16_shard.reset_payload(t.clone());
                        t
                    }
                }
            } else {
                p.fp32_shard.cast::<C>()
            };

            let full = if p.is_sharded() {
                let parts = backend.all_gather(&local, &self.group)?;
                Tensor::cat(&parts, 0)?
            } else {
                local
            };
            p.full.reset_payload(full);
            p.storage = ParamStorage::Full;

            if self.mixed_precision {
                p.fp16_shard.set_null();
            }
        }
        Ok(())
    }

    /// Points data at full buffers that are still materialized.
    ///
    /// # Errors
    ///
    /// [`ZeroError::NotMaterialized`] if a parameter's full buffer was freed.
    pub fn use_full_params(&mut self) -> Result<()> {
        for p in &mut self.params {
            if p.full.is_null() {
                return Err(ZeroError::NotMaterialized(p.name().to_string()));
            }
            p.storage = ParamStorage::Full;
        }
        Ok(())
    }

    /// Releases full buffers of the selected parameters (all when `which` is `None`).
    pub fn free_full_params(&mut self, which: Option<&[usize]>) {
        for i in self.selection(which) {
            let p = &mut self.params[i];
            p.full.set_null();
            if p.storage == ParamStorage::Full {
                p.storage = if p.fp16_shard.is_null() {
                    ParamStorage::Fp32Shard
                } else {
                    ParamStorage::Fp16Shard
                };
            }
        }
    }

    pub fn use_fp32_shards(&mut self, which: Option<&[usize]>) {
        for i in self.selection(which) {
            self.params[i].storage = ParamStorage::Fp32Shard;
        }
    }

    /// Casts master shards to the compute precision. Without mixed precision this is a no-op.
    pub fn use_fp16_shards(&mut self, which: Option<&[usize]>) -> Result<()> {
        if !self.mixed_precision {
            return Ok(());
        }
        for i in self.selection(which) {
            let p = &mut self.params[i];
            if p.fp16_shard.is_null() {
                p.fp16_shard.reset_payload(p.fp32_shard.cast::<C>());
            }
            p.fp16_shard.trans_state(TensorState::Hold)?;
            p.storage = ParamStorage::Fp16Shard;
        }
        Ok(())
    }

    pub fn free_fp16_shards(&mut self, which: Option<&[usize]>) {
        for i in self.selection(which) {
            let p = &mut self.params[i];
            p.fp16_shard.set_null();
            if p.storage == ParamStorage::Fp16Shard {
                p.storage = ParamStorage::Fp32Shard;
            }
        }
    }

    /// Gathers the fp32 master copy of every parameter, padding stripped.
    pub fn gather_fp32_params<B: CollectiveBackend>(
        &self,
        backend: &B,
    ) -> Result<Vec<(String, ParamTensor)>> {
        self.params
            .iter()
            .map(|p| {
                let flat = if p.is_sharded() {
                    let parts = backend.all_gather(p.fp32_shard(), &self.group)?;
                    Tensor::cat(&parts, 0)?.narrow(0, 0, p.orig_numel())?
                } else {
                    p.fp32_shard().clone()
                };
                Ok((
                    p.name().to_string(),
                    ParamTensor {
                        shape: p.orig_shape().to_vec(),
                        data: flat,
                    },
                ))
            })
            .collect()
    }

    fn selection(&self, which: Option<&[usize]>) -> Vec<usize> {
        match which {
            Some(indices) => indices.to_vec(),
            None => (0..self.params.len()).collect(),
        }
    }
}
