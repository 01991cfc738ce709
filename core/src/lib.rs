//! # shard-rs
//!
//! `shard-rs` is a pure Rust toolkit for distributing tensor programs over a grid of devices.
//! It has two halves:
//!
//! - **Strategy search** ([`auto_parallel`]): for every node of a traced computation graph,
//!   enumerate the ways its operands can be sharded over a [`DeviceMesh`], and price each
//!   candidate in compute, memory and resharding communication. The output feeds a global
//!   solver.
//! - **ZeRO parameter sharding** ([`zero`]): keep only a 1/N slice of every parameter per rank,
//!   gather full parameters just in time for forward and backward, and reduce-scatter gradients
//!   in size-bounded buckets.
//!
//! Collectives run through a [`CollectiveBackend`]; the bundled [`CpuBackend`] runs every rank
//! as a thread of the current process.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: the dense CPU tensor everything is built on.
//! - [`device_mesh`]: logical N-D arrangement of ranks and per-axis process groups.
//! - [`sharding`]: sharding specs, resharding plans and their costs.
//! - [`distributed`]: process groups and collectives.
//! - [`auto_parallel`]: graph, handlers, generators and the strategies constructor.
//! - [`zero`]: sharded parameters, reduce-scatter bucketing, the training-state machine.
//! - [`checkpoint`]: sharded safetensors checkpoints.
//! - [`config`]: TOML configuration for strategy search.
//!
//! ## Example
//!
//! ```rust
//! use shard_rs::device_mesh::DeviceMesh;
//! use shard_rs::sharding::{ShapeConsistencyManager, ShardingSpec};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! let mesh = Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap());
//! // [S0, R] -> [R, S1]
//! let source =
//!     ShardingSpec::new(mesh.clone(), vec![8, 6], BTreeMap::from([(0, vec![0])])).unwrap();
//! let target = ShardingSpec::new(mesh, vec![8, 6], BTreeMap::from([(1, vec![1])])).unwrap();
//!
//! let manager = ShapeConsistencyManager::new();
//! let (path, cost) = manager.shape_consistency(&source, &target).unwrap();
//! assert!(!path.is_noop());
//! assert!(cost.total > 0.0);
//! ```

pub mod auto_parallel;
pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod device_mesh;
pub mod distributed;
pub mod optim;
pub mod sharding;
pub mod tensor;
pub mod zero;

pub use autograd::Variable;
pub use device_mesh::DeviceMesh;
pub use distributed::{CollectiveBackend, CpuBackend, ProcessGroup};
pub use sharding::{ShapeConsistencyManager, ShardingSpec};
pub use tensor::{ComputeElem, Cpu, DType, Device, Storage, Tensor, TensorElem, TensorError};
pub use zero::{ShardedParam, ZeroConfig, ZeroModel};
