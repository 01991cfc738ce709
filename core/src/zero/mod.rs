//! # ZeRO parameter sharding
//!
//! Every managed parameter lives as a flat fp32 shard holding `1/world_size` of the (zero-padded)
//! parameter. Full tensors only exist around a unit's forward and backward:
//!
//! ```text
//!  forward:   rebuild_full_params (all-gather) ──► compute ──► free_full_params
//!  backward:  pre_backward_hook (all-gather again) ──► grads ready ──► post_backward_hook
//!             ──► reduce-scatter (bucketed, on the worker thread) ──► final_backward_hook waits
//! ```
//!
//! Gradient reduce-scatters run on a [`ReduceWorker`] thread so they overlap with the rest of
//! backward; the final hook is where the compute thread waits for them.
//!
//! After the final hook every parameter's gradient is the reduced shard matching its fp32 master
//! shard, so an [`Optimizer`](crate::optim::Optimizer) can update shards without ever seeing a full
//! tensor.
//!
//! ## Training states
//!
//! Each [`ZeroUnit`] moves through
//! `Idle → Forward → Idle → PreBackward → PostBackward → Idle`. Reaching a hook in any other state
//! means forward and backward calls were interleaved incorrectly. That is a bug in the caller, so
//! the unit logs the state with a backtrace and panics instead of returning an error.
//!
//! > [!TIP]
//! > **Gradient accumulation**: inside [`ZeroModel::no_sync`] gradients stay full-sized and are
//! > summed locally. The first synced backward after the guard drops reduces the accumulated sum
//! > once, which gives the same shard as reducing every micro-batch separately.

use crate::distributed::CommError;
use crate::tensor::TensorError;
use thiserror::Error;

pub mod config;
pub mod model;
pub mod param_manager;
pub mod reduce_scatter;
pub mod reduce_worker;
pub mod sharded_param;
pub mod stateful;

pub use config::ZeroConfig;
pub use model::{FullParams, NoSyncGuard, ParamId, TrainingState, ZeroModel, ZeroUnit};
pub use param_manager::ParamManager;
pub use reduce_scatter::{ReduceScatterBucketer, Reduced};
pub use reduce_worker::ReduceWorker;
pub use sharded_param::{
    GradSlot, ParamStorage, ShardedParam, chunk_and_pad, get_gradient_predivide_factor,
};
pub use stateful::{StatefulTensor, TensorState};

#[derive(Error, Debug)]
pub enum ZeroError {
    #[error("invalid ZeRO configuration: {0}")]
    InvalidConfig(String),
    #[error("parameter {name:?} has {got} elements but shape {shape:?} needs {expected}")]
    ParamSize {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("parameter name {0:?} is used twice")]
    DuplicateParam(String),
    #[error("unknown parameter {0:?}")]
    UnknownParam(String),
    #[error("gradient for {name:?} has {got} elements, expected {expected}")]
    GradSize {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("parameter {name:?} of shape {shape:?} requested as a rank-{rank} tensor")]
    RankMismatch {
        name: String,
        shape: Vec<usize>,
        rank: usize,
    },
    #[error("state dict has no entry for parameter {0:?}")]
    MissingState(String),
    #[error("full parameter {0:?} is not materialized")]
    NotMaterialized(String),
    #[error("cannot move a tensor without payload to state {0:?}")]
    NullPayload(TensorState),
    #[error("reduce-scatter worker: {0}")]
    Worker(String),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

pub type Result<T> = std::result::Result<T, ZeroError>;
