//! # Collective Communication
//!
//! Every sharding decision eventually turns into one of a handful of collectives:
//!
//! | Collective       | Used by                                                         |
//! |------------------|-----------------------------------------------------------------|
//! | `all_gather`     | S→R resharding, rebuilding full ZeRO parameters                  |
//! | `all_to_all`     | S→S resharding when only the sharded dimension moves             |
//! | `reduce_scatter` | ZeRO gradient reduction (each rank keeps the sum of its shard)   |
//! | `all_reduce_sum` | partial-sum outputs of contraction-sharded matmuls               |
//! | `broadcast`      | checkpoint gather/scatter through the coordinating rank          |
//!
//! ## 🎓 Process groups
//!
//! A collective never runs over "the world" implicitly: it runs over a [`ProcessGroup`], the
//! ordered list of global ranks that take part. A 2×2 device mesh has four ranks but its
//! axis-1 collectives only ever involve pairs like `[0, 1]` and `[2, 3]`.
//!
//! Every member must issue the same collectives over the same group in the same order. A
//! mismatch is a distributed deadlock, not an error this layer can detect.
//!
//! ## 📦 Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): the interface for communication.
//! *   [`CpuBackend`](cpu_backend::CpuBackend): an in-process backend where each rank is a thread
//!     and every pair of ranks is connected by a `crossbeam` channel. `all_reduce_sum` runs the
//!     classic **Ring All-Reduce**.

use thiserror::Error;

pub mod backend;
pub mod cpu_backend;
pub mod group;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use group::ProcessGroup;

/// Error type for collective communication.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("rank {rank} is not a member of process group {group:?}")]
    NotInGroup { rank: usize, group: Vec<usize> },
    #[error("collective over a group of {expected} ranks received {got} inputs")]
    GroupSizeMismatch { expected: usize, got: usize },
    #[error("peer rank {peer} disconnected")]
    Disconnected { peer: usize },
    #[error("payload from rank {peer} has an unexpected type")]
    PayloadMismatch { peer: usize },
    #[error("invalid process group: {0}")]
    InvalidGroup(String),
    #[error(transparent)]
    Tensor(#[from] crate::tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, CommError>;
