//! # Sharding Specs and Resharding
//!
//! A [`ShardingSpec`] says how one logical tensor is laid out on a [`DeviceMesh`]: which tensor
//! dimensions are split, and over which mesh axes.
//!
//! ```text
//!   tensor [8, 6] on a 2x2 mesh, spec [S0, S1]
//!
//!            mesh axis 1
//!           ┌─────────┬─────────┐
//!   mesh    │ [0:4,   │ [0:4,   │
//!   axis 0  │  0:3]   │  3:6]   │
//!           ├─────────┼─────────┤
//!           │ [4:8,   │ [4:8,   │
//!           │  0:3]   │  3:6]   │
//!           └─────────┴─────────┘
//! ```
//!
//! When a producer emits layout `A` and a consumer needs layout `B`, the
//! [`ShapeConsistencyManager`] plans the collectives that convert one into the other and prices
//! them. The same plan runs at training time through [`transform`], where every forward
//! transform is paired with its mirrored backward transform for the gradient.
//!
//! [`DeviceMesh`]: crate::device_mesh::DeviceMesh

use thiserror::Error;

pub mod consistency;
pub mod spec;
pub mod transform;

pub use consistency::{CommAction, ShapeConsistencyManager, TrainCycleItem, TransformPath};
pub use spec::{ShardingAxis, ShardingSpec, check_sharding_spec_validity};
pub use transform::{TransformPair, handle_trans_spec, reshard, reshard_variable};

#[derive(Error, Debug)]
pub enum ShardingError {
    /// A sharded dimension does not split evenly. Strategy enumeration treats this as
    /// "discard this candidate".
    #[error("dimension {dim} of size {dim_size} is not divisible into {partitions} partitions")]
    NotDivisible {
        dim: usize,
        dim_size: usize,
        partitions: usize,
    },
    #[error("mesh axis {axis} is assigned to more than one tensor dimension")]
    DuplicateAxis { axis: usize },
    #[error("tensor dimension {dim} out of range for a rank-{rank} tensor")]
    DimOutOfRange { dim: usize, rank: usize },
    #[error("sharding spec for shape {spec:?} applied to a tensor of shape {tensor:?}")]
    ShapeMismatch { spec: Vec<usize>, tensor: Vec<usize> },
    /// Resharding between layouts that live on different meshes or process groups.
    #[error("cannot reshard from {from} to {to}: the layouts belong to different device meshes")]
    CrossGroup { from: String, to: String },
    #[error(transparent)]
    Mesh(#[from] crate::device_mesh::MeshError),
    #[error(transparent)]
    Comm(#[from] crate::distributed::CommError),
    #[error(transparent)]
    Tensor(#[from] crate::tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, ShardingError>;
