//! Shape consistency: planning and pricing layout conversions.
//!
//! Conversions are decided by placement category, never by search:
//!
//! | from → to | plan                                                                 |
//! |-----------|----------------------------------------------------------------------|
//! | R → R     | nothing                                                              |
//! | R → S     | local `Shard` (narrow), free                                         |
//! | S → R     | `AllGather` over every sharded axis                                  |
//! | S → S     | `AllToAll` when both sides shard exactly one dim over the same axes,  |
//! |           | otherwise `AllGather` followed by `Shard`                            |
//!
//! The all-to-all choice is fixed by construction, not by comparing measured costs.
//!
//! Costs are element volumes per device. Forward cost prices the plan `old → new`; backward
//! cost prices the mirrored plan `new → old` that the gradient takes.

use super::{Result, ShardingError, ShardingSpec};
use crate::distributed::CollectiveBackend;
use crate::tensor::{Tensor, TensorElem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::Mutex;
use tracing::trace;

/// A cost split by training phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainCycleItem {
    pub fwd: f64,
    pub bwd: f64,
    pub total: f64,
}

impl TrainCycleItem {
    pub fn new(fwd: f64, bwd: f64) -> Self {
        Self {
            fwd,
            bwd,
            total: fwd + bwd,
        }
    }

    /// Multiplies every field, e.g. to turn element counts into bytes.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            fwd: self.fwd * factor,
            bwd: self.bwd * factor,
            total: self.total * factor,
        }
    }
}

impl Add for TrainCycleItem {
    type Output = TrainCycleItem;

    fn add(self, rhs: Self) -> Self {
        Self {
            fwd: self.fwd + rhs.fwd,
            bwd: self.bwd + rhs.bwd,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for TrainCycleItem {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for TrainCycleItem {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// One step of a conversion plan.
#[derive(Debug, Clone, PartialEq)]
pub enum CommAction {
    /// Keep the local slab of each newly sharded dimension.
    Shard {
        partition: BTreeMap<usize, Vec<usize>>,
    },
    /// Reassemble every sharded dimension.
    AllGather {
        partition: BTreeMap<usize, Vec<usize>>,
    },
    /// Move the split from `gather_dim` to `scatter_dim` over the same axes.
    AllToAll {
        gather_dim: usize,
        scatter_dim: usize,
        axes: Vec<usize>,
    },
}

/// Ordered list of actions converting one layout into another.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformPath {
    pub actions: Vec<CommAction>,
}

impl TransformPath {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

type CacheKey = (String, String, Vec<usize>, Vec<usize>, Vec<usize>);

/// Plans, prices and executes conversions between layouts of the same tensor.
///
/// Plans are memoised per (source, target, tensor shape, mesh shapes).
#[derive(Debug, Default)]
pub struct ShapeConsistencyManager {
    cache: Mutex<HashMap<CacheKey, (TransformPath, TrainCycleItem)>>,
}

impl ShapeConsistencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plans the conversion `old → new` and prices it in elements.
    ///
    /// # Errors
    ///
    /// [`ShardingError::CrossGroup`] when the layouts live on different meshes; this is never
    /// expected from a correct strategy search.
    pub fn shape_consistency(
        &self,
        old: &ShardingSpec,
        new: &ShardingSpec,
    ) -> Result<(TransformPath, TrainCycleItem)> {
        let key = (
            old.to_string(),
            new.to_string(),
            old.entire_shape().to_vec(),
            old.mesh().shape().to_vec(),
            new.mesh().shape().to_vec(),
        );
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let path = plan(old, new)?;
        let fwd = path_cost(&path, old);
        let bwd = path_cost(&plan(new, old)?, new);
        let cost = TrainCycleItem::new(fwd, bwd);
        trace!(from = %old, to = %new, steps = path.actions.len(), fwd, bwd, "planned reshard");

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, (path.clone(), cost));
        }
        Ok((path, cost))
    }

    /// Cost of `old → new` in bytes for elements of `element_size` bytes.
    pub fn resharding_cost(
        &self,
        old: &ShardingSpec,
        new: &ShardingSpec,
        element_size: usize,
    ) -> Result<TrainCycleItem> {
        let (_, cost) = self.shape_consistency(old, new)?;
        Ok(cost.scaled(element_size as f64))
    }

    /// Converts this rank's piece of a tensor from `old` to `new`, returning the new local
    /// piece together with the (element) cost of the conversion.
    pub fn apply<B, T, const RANK: usize>(
        &self,
        local: &Tensor<T, RANK>,
        old: &ShardingSpec,
        new: &ShardingSpec,
        backend: &B,
    ) -> Result<(Tensor<T, RANK>, TrainCycleItem)>
    where
        B: CollectiveBackend,
        T: TensorElem + 'static,
    {
        let (_, cost) = self.shape_consistency(old, new)?;
        let out = super::reshard(local, old, new, backend)?;
        Ok((out, cost))
    }
}

/// Category-based plan, see the module table.
pub(crate) fn plan(old: &ShardingSpec, new: &ShardingSpec) -> Result<TransformPath> {
    if !old.same_mesh(new) {
        return Err(ShardingError::CrossGroup {
            from: old.to_string(),
            to: new.to_string(),
        });
    }
    if old.entire_shape() != new.entire_shape() {
        return Err(ShardingError::ShapeMismatch {
            spec: old.entire_shape().to_vec(),
            tensor: new.entire_shape().to_vec(),
        });
    }

    let actions = if old.dim_partition() == new.dim_partition() {
        vec![]
    } else if old.is_replicated() {
        vec![CommAction::Shard {
            partition: new.dim_partition().clone(),
        }]
    } else if new.is_replicated() {
        vec![CommAction::AllGather {
            partition: old.dim_partition().clone(),
        }]
    } else if let Some(action) = single_dim_all_to_all(old, new) {
        vec![action]
    } else {
        vec![
            CommAction::AllGather {
                partition: old.dim_partition().clone(),
            },
            CommAction::Shard {
                partition: new.dim_partition().clone(),
            },
        ]
    };
    Ok(TransformPath { actions })
}

fn single_dim_all_to_all(old: &ShardingSpec, new: &ShardingSpec) -> Option<CommAction> {
    if old.dim_partition().len() != 1 || new.dim_partition().len() != 1 {
        return None;
    }
    let (&gather_dim, old_axes) = old.dim_partition().iter().next()?;
    let (&scatter_dim, new_axes) = new.dim_partition().iter().next()?;
    (old_axes == new_axes && gather_dim != scatter_dim).then(|| CommAction::AllToAll {
        gather_dim,
        scatter_dim,
        axes: old_axes.clone(),
    })
}

/// Element volume of `path` starting from layout `start`.
fn path_cost(path: &TransformPath, start: &ShardingSpec) -> f64 {
    let mesh = start.mesh();
    let mut local = start.local_numel();
    let mut cost = 0.0;
    for action in &path.actions {
        match action {
            CommAction::Shard { partition } => {
                let parts: usize = partition.values().map(|a| mesh.partitions(a)).product();
                local /= parts.max(1);
            }
            CommAction::AllGather { partition } => {
                let axes: Vec<usize> = partition.values().flatten().copied().collect();
                cost += mesh.all_gather_cost(local, &axes);
                local *= mesh.partitions(&axes);
            }
            CommAction::AllToAll { axes, .. } => {
                cost += mesh.all_to_all_cost(local, axes);
            }
        }
    }
    cost
}
