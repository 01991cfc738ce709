//! Strategy generators: one per operator family.
//!
//! A generator receives the operand mapping its handler built and enumerates every layout
//! assignment the operator admits on the mesh. Candidates that do not split evenly are dropped
//! here and logged; resharding costs are left empty for the handler to fill in.

use super::strategy::{OperandMap, OperandSpec, OperandValue, OperationData, ShardingStrategy};
use super::{Result, StrategyError};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, ShardingSpec, TrainCycleItem};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

mod contraction;
mod elementwise;
mod embedding;
mod io;
mod sum;

pub use contraction::{Conv2dStrategyGenerator, LinearStrategyGenerator};
pub use elementwise::ElementwiseGenerator;
pub use embedding::EmbeddingStrategyGenerator;
pub use io::{GetattrGenerator, OutputGenerator, PlaceholderGenerator};
pub use sum::SumGenerator;

/// Enumerates the candidate strategies of one operator.
pub trait StrategyGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>>;
}

/// Tensor dimension → mesh axes.
pub(crate) type Layout = BTreeMap<usize, Vec<usize>>;

pub(crate) fn layout(entries: &[(usize, &[usize])]) -> Layout {
    entries.iter().map(|(d, a)| (*d, a.to_vec())).collect()
}

/// Compact sharding sequence of `layout` for a tensor of `rank` dims, e.g. `S0RS1`.
pub(crate) fn sequence(layout: &Layout, rank: usize) -> String {
    (0..rank)
        .map(|d| match layout.get(&d) {
            Some(axes) => format!("S{}", axes.iter().join("")),
            None => "R".to_string(),
        })
        .collect()
}

/// Every layout of a `rank`-dim tensor using one axis, two axes on two dims, or all axes
/// flattened onto one dim. The replicated layout comes first.
pub(crate) fn enumerate_layouts(rank: usize, mesh: &DeviceMesh) -> Vec<Layout> {
    let mut out = vec![Layout::new()];
    for dim in 0..rank {
        for axis in 0..mesh.ndim() {
            out.push(layout(&[(dim, &[axis])]));
        }
    }
    if mesh.ndim() >= 2 {
        for dims in (0..rank).permutations(2) {
            for axes in (0..mesh.ndim()).permutations(2) {
                // ordered dims already cover both assignments
                if axes[0] < axes[1] {
                    out.push(layout(&[(dims[0], &[axes[0]]), (dims[1], &[axes[1]])]));
                }
            }
        }
        let all: Vec<usize> = (0..mesh.ndim()).collect();
        for dim in 0..rank {
            out.push(layout(&[(dim, &all)]));
        }
    }
    out
}

/// Operand mapping plus mesh, shared by every generator.
#[derive(Debug, Clone)]
pub struct GeneratorBase {
    pub op_data: OperandMap,
    pub mesh: Arc<DeviceMesh>,
}

impl GeneratorBase {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self { op_data, mesh }
    }

    pub(crate) fn op(&self, role: &str) -> Result<&OperationData> {
        self.op_data
            .get(role)
            .ok_or_else(|| StrategyError::MissingMetaData {
                node: role.to_string(),
            })
    }

    /// Logical shape of a tensor operand.
    pub(crate) fn shape(&self, role: &str) -> Result<&[usize]> {
        let op = self.op(role)?;
        op.logical_shape()
            .ok_or_else(|| StrategyError::MissingMetaData {
                node: op.name.clone(),
            })
    }

    pub(crate) fn has(&self, role: &str) -> bool {
        self.op_data.contains_key(role)
    }

    /// Builds a strategy from per-role layouts; roles not listed are replicated.
    ///
    /// Fails with the first layout that does not fit its logical shape.
    pub(crate) fn build(
        &self,
        name: String,
        layouts: &[(&str, Layout)],
    ) -> std::result::Result<ShardingStrategy, ShardingError> {
        let mut specs = BTreeMap::new();
        for (role, op) in &self.op_data {
            let spec = match &op.data {
                OperandValue::Tensor(meta) => {
                    let shape = op.logical_shape.clone().unwrap_or_else(|| meta.shape.clone());
                    let partition = layouts
                        .iter()
                        .find(|(r, _)| r == role)
                        .map(|(_, l)| l.clone())
                        .unwrap_or_default();
                    OperandSpec::Tensor(ShardingSpec::new(self.mesh.clone(), shape, partition)?)
                }
                OperandValue::NonTensor => OperandSpec::NonTensor,
                OperandValue::Tuple(metas) => OperandSpec::Tuple(
                    metas
                        .iter()
                        .map(|m| ShardingSpec::replicated(self.mesh.clone(), m.shape.clone()))
                        .collect(),
                ),
            };
            specs.insert(role.clone(), spec);
        }
        Ok(ShardingStrategy {
            name,
            operands: self.op_data.clone(),
            sharding_specs: specs,
            compute_cost: TrainCycleItem::default(),
            memory_cost: TrainCycleItem::default(),
            communication_cost: TrainCycleItem::default(),
            resharding_costs: BTreeMap::new(),
        })
    }

    /// Fills compute and memory costs.
    ///
    /// Compute is `flops` divided by the devices the strategy spreads over; memory is the local
    /// bytes of every tensor operand forward, and of every non-output operand's gradient
    /// backward.
    pub(crate) fn price(&self, strategy: &mut ShardingStrategy, flops: f64, comm: TrainCycleItem) {
        let axes: BTreeSet<usize> = strategy.sharded_mesh_axes().into_iter().collect();
        let devices = axes.iter().map(|&a| self.mesh.get_world_size(a)).product::<usize>() as f64;
        let local_flops = flops / devices;
        strategy.compute_cost = TrainCycleItem::new(local_flops, 2.0 * local_flops);

        let mut fwd = 0.0;
        let mut bwd = 0.0;
        for (role, spec) in &strategy.sharding_specs {
            let Some(op) = strategy.operands.get(role) else { continue };
            let bytes = match (spec, &op.data) {
                (OperandSpec::Tensor(spec), OperandValue::Tensor(meta)) => {
                    (spec.local_numel() * meta.dtype.element_size()) as f64
                }
                (OperandSpec::Tuple(specs), OperandValue::Tuple(metas)) => specs
                    .iter()
                    .zip(metas)
                    .map(|(s, m)| (s.local_numel() * m.dtype.element_size()) as f64)
                    .sum(),
                _ => 0.0,
            };
            fwd += bytes;
            if op.kind != super::OperationDataType::Output {
                bwd += bytes;
            }
        }
        strategy.memory_cost = TrainCycleItem::new(fwd, bwd);
        strategy.communication_cost = comm;
    }

    /// Local element count of `role` under `strategy`.
    pub(crate) fn local_numel(strategy: &ShardingStrategy, role: &str) -> usize {
        strategy.spec(role).map_or(0, ShardingSpec::local_numel)
    }

    /// Element size of a tensor operand, 4 bytes when unknown.
    pub(crate) fn element_size(&self, role: &str) -> usize {
        self.op_data
            .get(role)
            .and_then(OperationData::meta)
            .map_or(4, |m| m.dtype.element_size())
    }

    /// Keeps the candidates that built; logs the rest.
    pub(crate) fn collect(
        &self,
        generator: &str,
        candidates: Vec<std::result::Result<ShardingStrategy, ShardingError>>,
    ) -> Result<Vec<ShardingStrategy>> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match candidate {
                Ok(strategy) => out.push(strategy),
                Err(ShardingError::NotDivisible {
                    dim,
                    dim_size,
                    partitions,
                }) => {
                    debug!(generator, dim, dim_size, partitions, "discarding candidate");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

/// Mesh axes as used by the contraction-style generators: single axes, ordered pairs of
/// distinct axes, and all axes flattened.
pub(crate) struct AxisSets {
    pub singles: Vec<usize>,
    pub pairs: Vec<(usize, usize)>,
    pub all: Option<Vec<usize>>,
}

impl AxisSets {
    pub fn of(mesh: &DeviceMesh) -> Self {
        let n = mesh.ndim();
        let pairs = (0..n)
            .permutations(2)
            .map(|p| (p[0], p[1]))
            .collect();
        Self {
            singles: (0..n).collect(),
            pairs,
            all: (n >= 2).then(|| (0..n).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence() {
        assert_eq!(sequence(&layout(&[(0, &[0, 1])]), 3), "S01RR");
        assert_eq!(sequence(&Layout::new(), 2), "RR");
    }

    #[test]
    fn test_enumerate_layouts_2d_mesh() {
        let mesh = DeviceMesh::logical(vec![2, 2]).unwrap();
        let layouts = enumerate_layouts(2, &mesh);
        // R, 2 dims x 2 axes, 2 dim orders x 1 axis pair, 2 flattened
        assert_eq!(layouts.len(), 1 + 4 + 2 + 2);
        let names: BTreeSet<String> = layouts.iter().map(|l| sequence(l, 2)).collect();
        assert_eq!(names.len(), layouts.len());
        assert!(names.contains("S0S1") && names.contains("S1S0"));
    }

    #[test]
    fn test_axis_sets_1d() {
        let mesh = DeviceMesh::logical(vec![4]).unwrap();
        let sets = AxisSets::of(&mesh);
        assert_eq!(sets.singles, vec![0]);
        assert!(sets.pairs.is_empty());
        assert!(sets.all.is_none());
    }
}
