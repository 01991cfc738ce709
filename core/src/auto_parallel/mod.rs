//! # Auto-Parallel Strategy Search
//!
//! Given a traced computation [`Graph`] and a [`DeviceMesh`], this module enumerates, for every
//! node, the ways its operands could be laid out across the mesh and prices each one.
//!
//! ```text
//!   Graph ──▶ OperatorRegistry ──▶ NodeHandler ──▶ StrategyGenerator(s)
//!                                      │                 │
//!                                      │   logical strategies
//!                                      ▼                 │
//!                         post_process (fan-out) ◀───────┘
//!                                      │
//!                         update_resharding_cost (ShapeConsistencyManager)
//!                                      │
//!                         validate ─▶ filter by ShardOption ─▶ StrategiesVector
//! ```
//!
//! The result, a [`StrategyMap`], is the complete input of a global solver (ILP or heuristic)
//! which picks one strategy per node. The solver itself lives outside this crate; its contract
//! is [`StrategyMap::to_solver_input`].
//!
//! > [!TIP]
//! > **Logical vs physical shapes**: some operators shard most naturally on a reshaped view.
//! > An embedding lookup treats every dimension of its index tensor as one flattened batch
//! > dimension. Generators enumerate on that *logical* view; the handler then fans each logical
//! > strategy out into one *physical* strategy per candidate physical dimension, dropping the
//! > ones whose dimension does not split evenly.
//!
//! [`DeviceMesh`]: crate::device_mesh::DeviceMesh

use thiserror::Error;

pub mod constructor;
pub mod generators;
pub mod graph;
pub mod handlers;
pub mod options;
pub mod strategy;

pub use constructor::{StrategiesConstructor, StrategyMap};
pub use generators::StrategyGenerator;
pub use graph::{Graph, Node, NodeArg, NodeOp, OpKind, TensorMeta};
pub use handlers::{HandlerContext, NodeHandler, OperatorRegistry};
pub use options::{ShardOption, SolverPreference};
pub use strategy::{
    OperandSpec, OperandValue, OperationData, OperationDataType, ShardingStrategy,
    StrategiesVector,
};

#[derive(Error, Debug)]
pub enum StrategyError {
    /// The tracer did not attach shape/dtype metadata to a node the handler needs.
    #[error("node `{node}` has no tensor meta data")]
    MissingMetaData { node: String },
    #[error("node `{node}` has no parameter `{param}`")]
    MissingParameter { node: String, param: String },
    #[error("parameter `{param}` of node `{node}` must have rank {expected}, got {got}")]
    ParameterRank {
        node: String,
        param: String,
        expected: usize,
        got: usize,
    },
    #[error("unsupported operator `{target}` at node `{node}`")]
    UnsupportedOperator { node: String, target: String },
    #[error("node `{node}` references unknown node `{name}`")]
    UnknownNode { node: String, name: String },
    #[error("node `{node}` expects {expected} tensor argument(s), got {got}")]
    ArgumentCount {
        node: String,
        expected: usize,
        got: usize,
    },
    /// A predecessor was handled without producing a strategies vector.
    #[error("predecessor `{predecessor}` of `{node}` has no strategies vector")]
    MissingPredecessorStrategies { node: String, predecessor: String },
    /// A strategy survived generation but does not fit the physical tensor.
    #[error("strategy `{strategy}` of node `{node}` is physically inconsistent: {source}")]
    InvalidShardingSpec {
        node: String,
        strategy: String,
        #[source]
        source: crate::sharding::ShardingError,
    },
    /// Predecessor and consumer disagree on whether an operand is a tensor or a tuple.
    #[error("operand `{operand}` of node `{node}` changes kind between producer and consumer")]
    OperandKindMismatch { node: String, operand: String },
    #[error(transparent)]
    Sharding(#[from] crate::sharding::ShardingError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StrategyError>;
