//! Walks a graph in topological order, registering every node's strategies, and exports the
//! result for a solver.

use super::graph::Graph;
use super::handlers::{HandlerContext, OperatorRegistry};
use super::options::{ShardOption, SolverPreference};
use super::strategy::StrategiesVector;
use super::Result;
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShapeConsistencyManager, TrainCycleItem};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Node name → its strategies, remembering registration order.
#[derive(Debug, Default)]
pub struct StrategyMap {
    order: Vec<String>,
    vectors: HashMap<String, StrategiesVector>,
    predecessors: HashMap<String, Vec<String>>,
    mesh_shape: Vec<usize>,
    shard_option: ShardOption,
    solver_preference: SolverPreference,
}

impl StrategyMap {
    pub fn get(&self, node: &str) -> Option<&StrategiesVector> {
        self.vectors.get(node)
    }

    /// Node names in registration (topological) order.
    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn insert(&mut self, vector: StrategiesVector, predecessors: Vec<String>) {
        self.order.push(vector.node.clone());
        self.predecessors.insert(vector.node.clone(), predecessors);
        self.vectors.insert(vector.node.clone(), vector);
    }

    /// The solver contract: per node, its strategies with costs, and for each predecessor the
    /// resharding-cost table indexed parallel to that predecessor's strategies.
    pub fn solver_input(&self) -> SolverInput {
        let nodes = self
            .order
            .iter()
            .filter_map(|name| self.vectors.get(name))
            .map(|vector| SolverNode {
                name: vector.node.clone(),
                predecessors: self
                    .predecessors
                    .get(&vector.node)
                    .cloned()
                    .unwrap_or_default(),
                strategies: vector
                    .iter()
                    .map(|s| SolverStrategy {
                        name: s.name.clone(),
                        sharding_specs: s.describe_specs(),
                        compute_cost: s.compute_cost,
                        memory_cost: s.memory_cost,
                        communication_cost: s.communication_cost,
                        resharding_costs: s.resharding_costs.clone(),
                    })
                    .collect(),
            })
            .collect();
        SolverInput {
            mesh_shape: self.mesh_shape.clone(),
            shard_option: self.shard_option,
            solver_preference: self.solver_preference,
            nodes,
        }
    }

    /// [`solver_input`](Self::solver_input) as pretty JSON.
    pub fn to_solver_input(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.solver_input())?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SolverInput {
    pub mesh_shape: Vec<usize>,
    pub shard_option: ShardOption,
    pub solver_preference: SolverPreference,
    pub nodes: Vec<SolverNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolverNode {
    pub name: String,
    pub predecessors: Vec<String>,
    pub strategies: Vec<SolverStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SolverStrategy {
    pub name: String,
    pub sharding_specs: BTreeMap<String, String>,
    pub compute_cost: TrainCycleItem,
    pub memory_cost: TrainCycleItem,
    pub communication_cost: TrainCycleItem,
    pub resharding_costs: BTreeMap<String, Vec<TrainCycleItem>>,
}

/// Drives strategy registration over a whole graph.
///
/// ```rust
/// use std::sync::Arc;
/// use shard_rs::auto_parallel::{Graph, Node, NodeOp, OpKind, StrategiesConstructor, TensorMeta};
/// use shard_rs::device_mesh::DeviceMesh;
///
/// let graph = Graph::new(vec![
///     Node::placeholder("x", TensorMeta::f32(vec![8, 16])),
///     Node::new("fc", NodeOp::CallModule, OpKind::Linear)
///         .with_args(&["x"])
///         .with_param("weight", TensorMeta::f32(vec![32, 16]))
///         .with_meta(TensorMeta::f32(vec![8, 32])),
///     Node::output(&["fc"]),
/// ]).unwrap();
///
/// let mesh = Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap());
/// let map = StrategiesConstructor::new(mesh).build_strategies_and_cost(&graph).unwrap();
/// assert_eq!(map.get("fc").unwrap().len(), 16);
/// ```
#[derive(Debug)]
pub struct StrategiesConstructor {
    mesh: Arc<DeviceMesh>,
    registry: OperatorRegistry,
    shard_option: ShardOption,
    solver_preference: SolverPreference,
    consistency: Arc<ShapeConsistencyManager>,
}

impl StrategiesConstructor {
    pub fn new(mesh: Arc<DeviceMesh>) -> Self {
        Self {
            mesh,
            registry: OperatorRegistry::default(),
            shard_option: ShardOption::default(),
            solver_preference: SolverPreference::default(),
            consistency: Arc::new(ShapeConsistencyManager::new()),
        }
    }

    pub fn with_shard_option(mut self, option: ShardOption) -> Self {
        self.shard_option = option;
        self
    }

    pub fn with_solver_preference(mut self, preference: SolverPreference) -> Self {
        self.solver_preference = preference;
        self
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry_mut(&mut self) -> &mut OperatorRegistry {
        &mut self.registry
    }

    /// Registers every node's strategies, pricing each against its predecessors' strategies.
    ///
    /// # Errors
    ///
    /// The first node failure: an unsupported operator, missing meta data, or a strategy that
    /// is inconsistent with its physical tensor.
    pub fn build_strategies_and_cost(&self, graph: &Graph) -> Result<StrategyMap> {
        let mut map = StrategyMap {
            mesh_shape: self.mesh.shape().to_vec(),
            shard_option: self.shard_option,
            solver_preference: self.solver_preference,
            ..StrategyMap::default()
        };

        for node in graph.nodes() {
            let ctx = HandlerContext {
                node,
                graph,
                mesh: self.mesh.clone(),
                shard_option: self.shard_option,
                solver_preference: self.solver_preference,
                consistency: self.consistency.clone(),
            };
            let handler = self.registry.handler(ctx)?;
            let vector = handler.register_strategy(&map, true)?;
            let predecessors = node.input_nodes().iter().map(|s| s.to_string()).collect();
            map.insert(vector, predecessors);
        }

        info!(
            nodes = map.len(),
            strategies = map.vectors.values().map(|v| v.len()).sum::<usize>(),
            "built strategies"
        );
        Ok(map)
    }
}
