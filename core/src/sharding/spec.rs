use super::{Result, ShardingError};
use crate::device_mesh::DeviceMesh;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Placement of one tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingAxis {
    /// Replicated on every device.
    R,
    /// Split over the listed mesh axes, first axis major.
    S(Vec<usize>),
}

impl fmt::Display for ShardingAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingAxis::R => f.write_str("R"),
            ShardingAxis::S(axes) => {
                f.write_str("S")?;
                for a in axes {
                    write!(f, "{a}")?;
                }
                Ok(())
            }
        }
    }
}

/// Layout of one logical tensor on a device mesh.
///
/// Immutable once built: every constructor validates that no mesh axis is claimed twice and
/// that every sharded dimension divides evenly.
#[derive(Clone)]
pub struct ShardingSpec {
    mesh: Arc<DeviceMesh>,
    entire_shape: Vec<usize>,
    dim_partition: BTreeMap<usize, Vec<usize>>,
}

impl ShardingSpec {
    /// # Errors
    ///
    /// - [`ShardingError::NotDivisible`] when a sharded dimension does not split evenly.
    /// - [`ShardingError::DuplicateAxis`] when two dimensions (or one dimension twice) use the
    ///   same mesh axis.
    pub fn new(
        mesh: Arc<DeviceMesh>,
        entire_shape: Vec<usize>,
        dim_partition: BTreeMap<usize, Vec<usize>>,
    ) -> Result<Self> {
        let dim_partition: BTreeMap<usize, Vec<usize>> = dim_partition
            .into_iter()
            .filter(|(_, axes)| !axes.is_empty())
            .collect();

        let mut seen = BTreeSet::new();
        for (&dim, axes) in &dim_partition {
            if dim >= entire_shape.len() {
                return Err(ShardingError::DimOutOfRange {
                    dim,
                    rank: entire_shape.len(),
                });
            }
            for &axis in axes {
                if axis >= mesh.ndim() {
                    return Err(crate::device_mesh::MeshError::AxisOutOfRange {
                        axis,
                        ndim: mesh.ndim(),
                    }
                    .into());
                }
                if !seen.insert(axis) {
                    return Err(ShardingError::DuplicateAxis { axis });
                }
            }
            let partitions = mesh.partitions(axes);
            if entire_shape[dim] % partitions != 0 {
                return Err(ShardingError::NotDivisible {
                    dim,
                    dim_size: entire_shape[dim],
                    partitions,
                });
            }
        }

        Ok(Self {
            mesh,
            entire_shape,
            dim_partition,
        })
    }

    /// Fully replicated layout.
    pub fn replicated(mesh: Arc<DeviceMesh>, entire_shape: Vec<usize>) -> Self {
        Self {
            mesh,
            entire_shape,
            dim_partition: BTreeMap::new(),
        }
    }

    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    pub fn entire_shape(&self) -> &[usize] {
        &self.entire_shape
    }

    pub fn dim_partition(&self) -> &BTreeMap<usize, Vec<usize>> {
        &self.dim_partition
    }

    pub fn is_replicated(&self) -> bool {
        self.dim_partition.is_empty()
    }

    /// Mesh axes used, in dimension order.
    pub fn sharded_axes(&self) -> Vec<usize> {
        self.dim_partition.values().flatten().copied().collect()
    }

    /// Number of pieces dimension `dim` is split into.
    pub fn num_partitions(&self, dim: usize) -> usize {
        self.dim_partition
            .get(&dim)
            .map_or(1, |axes| self.mesh.partitions(axes))
    }

    /// One placement per tensor dimension.
    pub fn sharding_sequence(&self) -> Vec<ShardingAxis> {
        (0..self.entire_shape.len())
            .map(|d| match self.dim_partition.get(&d) {
                Some(axes) => ShardingAxis::S(axes.clone()),
                None => ShardingAxis::R,
            })
            .collect()
    }

    /// Shape of the piece each device holds.
    pub fn sharded_shape_per_device(&self) -> Vec<usize> {
        self.entire_shape
            .iter()
            .enumerate()
            .map(|(d, &size)| size / self.num_partitions(d))
            .collect()
    }

    /// Number of elements each device holds.
    pub fn local_numel(&self) -> usize {
        self.sharded_shape_per_device().iter().product()
    }

    /// `true` when both layouts live on the same mesh.
    pub fn same_mesh(&self, other: &ShardingSpec) -> bool {
        Arc::ptr_eq(&self.mesh, &other.mesh) || *self.mesh == *other.mesh
    }

    /// Re-targets a logical layout onto a physical shape.
    ///
    /// Each logical dimension listed in `dim_mapping` moves to the mapped physical dimension;
    /// unlisted dimensions keep their index. Fails with [`ShardingError::NotDivisible`] when
    /// the physical dimension does not split evenly, so fan-out callers can drop that branch.
    pub fn update_partition_dim(
        &self,
        dim_mapping: &BTreeMap<usize, usize>,
        physical_shape: &[usize],
    ) -> Result<ShardingSpec> {
        let remapped = self
            .dim_partition
            .iter()
            .map(|(dim, axes)| (*dim_mapping.get(dim).unwrap_or(dim), axes.clone()))
            .collect();
        ShardingSpec::new(self.mesh.clone(), physical_shape.to_vec(), remapped)
    }
}

impl PartialEq for ShardingSpec {
    fn eq(&self, other: &Self) -> bool {
        self.same_mesh(other)
            && self.entire_shape == other.entire_shape
            && self.dim_partition == other.dim_partition
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, axis) in self.sharding_sequence().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{axis}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardingSpec")
            .field("sequence", &self.to_string())
            .field("entire_shape", &self.entire_shape)
            .field("mesh_shape", &self.mesh.shape())
            .finish()
    }
}

/// Checks that `spec` describes a tensor of `physical_shape`.
pub fn check_sharding_spec_validity(spec: &ShardingSpec, physical_shape: &[usize]) -> Result<()> {
    if spec.entire_shape() != physical_shape {
        return Err(ShardingError::ShapeMismatch {
            spec: spec.entire_shape().to_vec(),
            tensor: physical_shape.to_vec(),
        });
    }
    for (&dim, axes) in spec.dim_partition() {
        if dim >= physical_shape.len() {
            return Err(ShardingError::DimOutOfRange {
                dim,
                rank: physical_shape.len(),
            });
        }
        let partitions = spec.mesh().partitions(axes);
        if physical_shape[dim] % partitions != 0 {
            return Err(ShardingError::NotDivisible {
                dim,
                dim_size: physical_shape[dim],
                partitions,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mesh_2x2() -> Arc<DeviceMesh> {
        Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap())
    }

    #[test]
    fn test_sequence_display() {
        let spec = ShardingSpec::new(
            mesh_2x2(),
            vec![8, 6, 4],
            BTreeMap::from([(0, vec![0, 1]), (2, vec![])]),
        )
        .unwrap();
        assert_eq!(spec.to_string(), "[S01, R, R]");
        assert_eq!(spec.sharded_shape_per_device(), vec![2, 6, 4]);
        assert_eq!(spec.local_numel(), 48);
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let err = ShardingSpec::new(
            mesh_2x2(),
            vec![4, 4],
            BTreeMap::from([(0, vec![0]), (1, vec![0])]),
        );
        assert!(matches!(err, Err(ShardingError::DuplicateAxis { axis: 0 })));
    }

    #[test]
    fn test_not_divisible_names_dim() {
        let err = ShardingSpec::new(mesh_2x2(), vec![4, 3], BTreeMap::from([(1, vec![1])]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "dimension 1 of size 3 is not divisible into 2 partitions"
        );
    }

    #[test]
    fn test_update_partition_dim() {
        let logical =
            ShardingSpec::new(mesh_2x2(), vec![24], BTreeMap::from([(0, vec![0])])).unwrap();
        let physical = logical
            .update_partition_dim(&BTreeMap::from([(0, 2)]), &[3, 2, 4])
            .unwrap();
        assert_eq!(physical.to_string(), "[R, R, S0]");

        let err = logical.update_partition_dim(&BTreeMap::from([(0, 0)]), &[3, 2, 4]);
        assert!(matches!(err, Err(ShardingError::NotDivisible { dim: 0, .. })));
    }

    #[test]
    fn test_validity_check() {
        let spec = ShardingSpec::new(mesh_2x2(), vec![4, 4], BTreeMap::from([(0, vec![1])]))
            .unwrap();
        assert!(check_sharding_spec_validity(&spec, &[4, 4]).is_ok());
        assert!(matches!(
            check_sharding_spec_validity(&spec, &[4, 2]),
            Err(ShardingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_equality_across_mesh_instances() {
        let a = ShardingSpec::replicated(mesh_2x2(), vec![2]);
        let b = ShardingSpec::replicated(mesh_2x2(), vec![2]);
        assert_eq!(a, b);
        let other = Arc::new(DeviceMesh::logical(vec![4]).unwrap());
        assert_ne!(a, ShardingSpec::replicated(other, vec![2]));
    }

    proptest! {
        #[test]
        fn prop_divisibility_invariant(size in 1usize..64, axis in 0usize..2, mesh_dim in 1usize..5) {
            let mesh = Arc::new(DeviceMesh::logical(vec![mesh_dim, 2]).unwrap());
            let partitions = mesh.partitions(&[axis]);
            let result = ShardingSpec::new(mesh, vec![size], BTreeMap::from([(0, vec![axis])]));
            if size % partitions == 0 {
                let spec = result.unwrap();
                prop_assert_eq!(spec.sharded_shape_per_device()[0] * partitions, size);
            } else {
                let is_not_divisible = matches!(
                    result,
                    Err(ShardingError::NotDivisible { dim: 0, dim_size, partitions: p })
                        if dim_size == size && p == partitions
                );
                prop_assert!(is_not_divisible);
            }
        }
    }
}
