//! Logical device meshes.
//!
//! A [`DeviceMesh`] arranges the physical ranks of a job into an N-dimensional grid. Each mesh
//! axis stands for one parallelism dimension: on a `(2, 4)` mesh axis 0 might be data parallel
//! and axis 1 tensor parallel. Sharding specs name mesh axes, and the mesh turns an axis (or a
//! list of axes) into the concrete [`ProcessGroup`] a collective runs over.
//!
//! ```rust
//! use shard_rs::device_mesh::DeviceMesh;
//!
//! let mesh = DeviceMesh::new(vec![2, 2], vec![0, 1, 2, 3], 3).unwrap();
//! assert_eq!(mesh.get_world_size(0), 2);
//! // rank 3 sits at (1, 1); along axis 1 it talks to rank 2
//! assert_eq!(mesh.get_group(1).ranks(), &[2, 3]);
//! ```

use crate::distributed::ProcessGroup;
use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MeshError {
    #[error("mesh shape must have at least one axis and no zero-sized axis, got {0:?}")]
    InvalidShape(Vec<usize>),
    #[error("mesh shape {shape:?} holds {expected} devices but {got} ranks were given")]
    RankCountMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("rank {0} appears more than once in the mesh")]
    DuplicateRank(usize),
    #[error("local rank {0} is not part of the mesh")]
    LocalRankNotInMesh(usize),
    #[error("mesh axis {axis} out of range for a {ndim}-D mesh")]
    AxisOutOfRange { axis: usize, ndim: usize },
    #[error("mesh axis {0} listed twice")]
    DuplicateAxis(usize),
}

pub type Result<T> = std::result::Result<T, MeshError>;

/// An immutable N-dimensional view of physical ranks.
///
/// `ranks` lists physical ranks in row-major order of their logical coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMesh {
    shape: Vec<usize>,
    ranks: Vec<usize>,
    local_rank: usize,
    axis_groups: Vec<ProcessGroup>,
}

impl DeviceMesh {
    /// Builds a mesh seen from `local_rank`.
    ///
    /// # Errors
    ///
    /// A rank list whose length differs from the product of `shape` is a configuration error
    /// and is rejected here, before any communication can happen.
    pub fn new(shape: Vec<usize>, ranks: Vec<usize>, local_rank: usize) -> Result<Self> {
        if shape.is_empty() || shape.contains(&0) {
            return Err(MeshError::InvalidShape(shape));
        }
        let expected: usize = shape.iter().product();
        if ranks.len() != expected {
            return Err(MeshError::RankCountMismatch {
                shape,
                expected,
                got: ranks.len(),
            });
        }
        if let Some(dup) = ranks.iter().duplicates().next() {
            return Err(MeshError::DuplicateRank(*dup));
        }
        if !ranks.contains(&local_rank) {
            return Err(MeshError::LocalRankNotInMesh(local_rank));
        }

        let mut mesh = Self {
            shape,
            ranks,
            local_rank,
            axis_groups: Vec::new(),
        };
        mesh.axis_groups = (0..mesh.ndim())
            .map(|axis| mesh.group_for(&[axis]))
            .collect();
        Ok(mesh)
    }

    /// A mesh over ranks `0..prod(shape)` seen from rank 0, for offline strategy search.
    pub fn logical(shape: Vec<usize>) -> Result<Self> {
        let n = shape.iter().product();
        Self::new(shape, (0..n).collect(), 0)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn num_devices(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Number of devices along `axis`.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= ndim()`.
    pub fn get_world_size(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Product of the sizes of `axes`.
    pub fn partitions(&self, axes: &[usize]) -> usize {
        axes.iter().map(|&a| self.shape[a]).product()
    }

    /// The local rank's group along `axis`.
    ///
    /// # Panics
    ///
    /// Panics if `axis >= ndim()`.
    pub fn get_group(&self, axis: usize) -> &ProcessGroup {
        &self.axis_groups[axis]
    }

    /// Physical rank of the process this mesh was built for.
    pub fn get_rank(&self) -> usize {
        self.local_rank
    }

    /// The local rank's group spanning several axes, first axis major.
    pub fn get_group_along_axes(&self, axes: &[usize]) -> Result<ProcessGroup> {
        self.check_axes(axes)?;
        Ok(self.group_for(axes))
    }

    /// Position of the local rank inside the group spanning `axes`.
    pub fn local_index_along_axes(&self, axes: &[usize]) -> Result<usize> {
        self.check_axes(axes)?;
        let coord = self.local_coordinate();
        Ok(axes
            .iter()
            .fold(0, |idx, &a| idx * self.shape[a] + coord[a]))
    }

    /// Logical coordinate of a physical rank.
    pub fn logical_coordinate(&self, rank: usize) -> Option<Vec<usize>> {
        let flat = self.ranks.iter().position(|&r| r == rank)?;
        let mut coord = vec![0; self.ndim()];
        let mut rem = flat;
        for axis in (0..self.ndim()).rev() {
            coord[axis] = rem % self.shape[axis];
            rem /= self.shape[axis];
        }
        Some(coord)
    }

    /// Physical rank at a logical coordinate.
    pub fn global_rank_at(&self, coord: &[usize]) -> Option<usize> {
        if coord.len() != self.ndim() || coord.iter().zip(&self.shape).any(|(c, s)| c >= s) {
            return None;
        }
        let flat = coord
            .iter()
            .zip(&self.shape)
            .fold(0, |idx, (&c, &s)| idx * s + c);
        Some(self.ranks[flat])
    }

    fn local_coordinate(&self) -> Vec<usize> {
        // `new` checked that the local rank is part of the mesh
        self.logical_coordinate(self.local_rank)
            .unwrap_or_else(|| vec![0; self.ndim()])
    }

    fn check_axes(&self, axes: &[usize]) -> Result<()> {
        for &axis in axes {
            if axis >= self.ndim() {
                return Err(MeshError::AxisOutOfRange {
                    axis,
                    ndim: self.ndim(),
                });
            }
        }
        if let Some(dup) = axes.iter().duplicates().next() {
            return Err(MeshError::DuplicateAxis(*dup));
        }
        Ok(())
    }

    /// Ranks sharing the local coordinate on every axis not in `axes`.
    fn group_for(&self, axes: &[usize]) -> ProcessGroup {
        let local_only = || ProcessGroup::single(self.local_rank);
        if axes.is_empty() {
            return local_only();
        }
        let base = self.local_coordinate();
        let members = axes
            .iter()
            .map(|&a| 0..self.shape[a])
            .multi_cartesian_product()
            .filter_map(|idxs| {
                let mut coord = base.clone();
                for (&a, i) in axes.iter().zip(idxs) {
                    coord[a] = i;
                }
                self.global_rank_at(&coord)
            })
            .collect::<Vec<_>>();
        ProcessGroup::new(members).unwrap_or_else(|_| local_only())
    }

    /// Communication volume, in elements received per device, of an all-gather over `axes`
    /// for a local shard of `local_elems` elements.
    pub fn all_gather_cost(&self, local_elems: usize, axes: &[usize]) -> f64 {
        let p = self.partitions(axes) as f64;
        local_elems as f64 * (p - 1.0)
    }

    /// Volume of an all-to-all over `axes` for a local tensor of `local_elems` elements.
    pub fn all_to_all_cost(&self, local_elems: usize, axes: &[usize]) -> f64 {
        let p = self.partitions(axes) as f64;
        local_elems as f64 * (p - 1.0) / p
    }

    /// Volume of a ring all-reduce over `axes`.
    pub fn all_reduce_cost(&self, local_elems: usize, axes: &[usize]) -> f64 {
        let p = self.partitions(axes) as f64;
        2.0 * local_elems as f64 * (p - 1.0) / p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_2x2_world_sizes() {
        let mesh = DeviceMesh::new(vec![2, 2], vec![0, 1, 2, 3], 0).unwrap();
        assert_eq!(mesh.get_world_size(0), 2);
        assert_eq!(mesh.get_world_size(1), 2);
        assert_eq!(mesh.get_rank(), 0);
        assert_eq!(mesh.num_devices(), 4);
    }

    #[test]
    fn test_axis_groups() {
        let mesh = DeviceMesh::new(vec![2, 3], (0..6).collect(), 4).unwrap();
        // rank 4 is at (1, 1)
        assert_eq!(mesh.logical_coordinate(4), Some(vec![1, 1]));
        assert_eq!(mesh.get_group(0).ranks(), &[1, 4]);
        assert_eq!(mesh.get_group(1).ranks(), &[3, 4, 5]);
        assert_eq!(
            mesh.get_group_along_axes(&[0, 1]).unwrap().ranks(),
            &[0, 1, 2, 3, 4, 5]
        );
        assert_eq!(
            mesh.get_group_along_axes(&[1, 0]).unwrap().ranks(),
            &[0, 3, 1, 4, 2, 5]
        );
        assert_eq!(mesh.local_index_along_axes(&[1, 0]).unwrap(), 3);
    }

    #[test]
    fn test_permuted_physical_ranks() {
        let mesh = DeviceMesh::new(vec![2, 2], vec![3, 2, 1, 0], 1).unwrap();
        assert_eq!(mesh.logical_coordinate(1), Some(vec![1, 0]));
        assert_eq!(mesh.get_group(1).ranks(), &[1, 0]);
        assert_eq!(mesh.global_rank_at(&[0, 1]), Some(2));
    }

    #[test]
    fn test_rank_count_mismatch_is_fatal() {
        let err = DeviceMesh::new(vec![2, 2], vec![0, 1, 2], 0).unwrap_err();
        assert_eq!(
            err,
            MeshError::RankCountMismatch {
                shape: vec![2, 2],
                expected: 4,
                got: 3
            }
        );
    }

    #[test]
    fn test_invalid_meshes() {
        assert!(matches!(
            DeviceMesh::new(vec![], vec![], 0),
            Err(MeshError::InvalidShape(_))
        ));
        assert!(matches!(
            DeviceMesh::new(vec![2], vec![1, 1], 1),
            Err(MeshError::DuplicateRank(1))
        ));
        assert!(matches!(
            DeviceMesh::new(vec![2], vec![0, 1], 5),
            Err(MeshError::LocalRankNotInMesh(5))
        ));
        let mesh = DeviceMesh::logical(vec![4]).unwrap();
        assert!(matches!(
            mesh.get_group_along_axes(&[1]),
            Err(MeshError::AxisOutOfRange { .. })
        ));
    }

    #[test]
    fn test_costs() {
        let mesh = DeviceMesh::logical(vec![2, 4]).unwrap();
        assert_eq!(mesh.all_gather_cost(8, &[1]), 24.0);
        assert_eq!(mesh.all_to_all_cost(8, &[1]), 6.0);
        assert_eq!(mesh.all_reduce_cost(8, &[0]), 8.0);
        assert_eq!(mesh.partitions(&[0, 1]), 8);
    }
}
