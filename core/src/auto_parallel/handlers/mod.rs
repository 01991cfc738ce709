//! Node handlers: one per operator family, driving generation, fan-out, pricing and filtering
//! for a single graph node.

use super::constructor::StrategyMap;
use super::generators::StrategyGenerator;
use super::graph::{Graph, Node, NodeArg};
use super::options::{ShardOption, SolverPreference};
use super::strategy::{
    OperandMap, OperandSpec, OperandValue, OperationData, OperationDataType, ShardingStrategy,
    StrategiesVector,
};
use super::{Result, StrategyError};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{
    ShapeConsistencyManager, ShardingError, ShardingSpec, TrainCycleItem,
    check_sharding_spec_validity,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

mod elementwise;
mod embedding;
mod io;
mod linear;
mod registry;

pub use elementwise::{ElementwiseHandler, SumHandler};
pub use embedding::EmbeddingHandler;
pub use io::{GetattrHandler, OutputHandler, PlaceholderHandler};
pub use linear::{Conv2dHandler, LinearHandler};
pub use registry::{HandlerCtor, OperatorRegistry};

/// Everything a handler needs to know about its node and the search it is part of.
#[derive(Debug, Clone)]
pub struct HandlerContext<'g> {
    pub node: &'g Node,
    pub graph: &'g Graph,
    pub mesh: Arc<DeviceMesh>,
    pub shard_option: ShardOption,
    pub solver_preference: SolverPreference,
    pub consistency: Arc<ShapeConsistencyManager>,
}

impl<'g> HandlerContext<'g> {
    /// Nodes behind the tensor arguments, in argument order.
    pub fn tensor_args(&self) -> Result<Vec<&'g Node>> {
        self.node
            .args
            .iter()
            .filter_map(|arg| match arg {
                NodeArg::Node(name) => Some(self.graph.require(self.node, name)),
                NodeArg::Scalar(_) => None,
            })
            .collect()
    }

    /// Exactly `n` tensor arguments.
    pub fn expect_args(&self, n: usize) -> Result<Vec<&'g Node>> {
        let args = self.tensor_args()?;
        if args.len() != n {
            return Err(StrategyError::ArgumentCount {
                node: self.node.name.clone(),
                expected: n,
                got: args.len(),
            });
        }
        Ok(args)
    }

    /// The output of `arg` as an operand of this node.
    pub fn arg_operand(&self, arg: &Node) -> Result<OperationData> {
        let kind = if arg.op == super::NodeOp::GetAttr {
            OperationDataType::Param
        } else {
            OperationDataType::Arg
        };
        Ok(OperationData::tensor(&arg.name, kind, arg.meta()?.clone()))
    }

    pub fn param_operand(&self, name: &str) -> Result<OperationData> {
        Ok(OperationData::tensor(
            name,
            OperationDataType::Param,
            self.node.param(name)?.clone(),
        ))
    }

    /// Like [`Self::param_operand`], rejecting a parameter whose rank is not `rank`.
    pub fn param_operand_of_rank(&self, name: &str, rank: usize) -> Result<OperationData> {
        let meta = self.node.param(name)?;
        if meta.shape.len() != rank {
            return Err(StrategyError::ParameterRank {
                node: self.node.name.clone(),
                param: name.to_string(),
                expected: rank,
                got: meta.shape.len(),
            });
        }
        self.param_operand(name)
    }

    pub fn output_operand(&self) -> Result<OperationData> {
        Ok(OperationData::tensor(
            &self.node.name,
            OperationDataType::Output,
            self.node.meta()?.clone(),
        ))
    }
}

/// Generates the strategies of one node.
///
/// Implementors describe the node's operands and pick generators; registration, pricing,
/// validation and filtering are shared.
pub trait NodeHandler<'g> {
    fn context(&self) -> &HandlerContext<'g>;

    /// Role → operand, e.g. `input`, `other`, `bias`, `output`.
    fn get_operation_data_mapping(&self) -> Result<OperandMap>;

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>>;

    /// Maps a generated (logical) strategy onto physical shapes; may fan out.
    fn post_process(&self, strategy: ShardingStrategy) -> Result<Vec<ShardingStrategy>> {
        Ok(vec![strategy])
    }

    /// Prices moving each predecessor's output, under each of its strategies, into the layout
    /// `strategy` needs.
    fn update_resharding_cost(
        &self,
        strategy: &mut ShardingStrategy,
        registered: &StrategyMap,
    ) -> Result<()> {
        let ctx = self.context();
        let mut costs = BTreeMap::new();
        for pred in ctx.node.input_nodes() {
            let Some((role, op_data)) = strategy.get_op_data_by_name(pred) else {
                continue;
            };
            let Some(current) = strategy.sharding_specs.get(role) else {
                continue;
            };
            let prev_vector =
                registered
                    .get(pred)
                    .ok_or_else(|| StrategyError::MissingPredecessorStrategies {
                        node: ctx.node.name.clone(),
                        predecessor: pred.to_string(),
                    })?;
            let list = prev_vector
                .iter()
                .map(|prev| {
                    resharding_cost(
                        &ctx.consistency,
                        prev.get_sharding_spec_by_name(pred),
                        current,
                        &op_data.data,
                    )
                    .ok_or_else(|| StrategyError::OperandKindMismatch {
                        node: ctx.node.name.clone(),
                        operand: pred.to_string(),
                    })?
                })
                .collect::<Result<Vec<_>>>()?;
            costs.insert(pred.to_string(), list);
        }
        strategy.resharding_costs = costs;
        Ok(())
    }

    /// Runs generate → post-process → resharding cost → validate → filter.
    fn register_strategy(
        &self,
        registered: &StrategyMap,
        compute_resharding_cost: bool,
    ) -> Result<StrategiesVector> {
        let ctx = self.context();
        let node = ctx.node.name.as_str();
        let mut vector = StrategiesVector::new(node);

        for generator in self.get_strategy_generator()? {
            for strategy in generator.generate()? {
                for mut physical in self.post_process(strategy)? {
                    if compute_resharding_cost {
                        self.update_resharding_cost(&mut physical, registered)?;
                    }
                    vector.push(physical);
                }
            }
        }

        for strategy in vector.iter() {
            validate(node, strategy)?;
        }

        let last_axis = ctx.mesh.ndim().saturating_sub(1);
        let option = ctx.shard_option;
        vector.retain(|s| {
            let keep = option.keeps(&s.sharded_mesh_axes(), last_axis);
            if !keep {
                debug!(node, strategy = %s.name, ?option, "filtered out");
            }
            keep
        });

        info!(node, strategies = vector.len(), "registered strategies");
        Ok(vector)
    }
}

fn validate(node: &str, strategy: &ShardingStrategy) -> Result<()> {
    for (role, spec) in &strategy.sharding_specs {
        let (OperandSpec::Tensor(spec), Some(shape)) = (
            spec,
            strategy.operands.get(role).and_then(|op| op.physical_shape()),
        ) else {
            continue;
        };
        if let Err(source) = check_sharding_spec_validity(spec, shape) {
            error!(node, strategy = %strategy.name, role, %source, "invalid sharding spec");
            return Err(StrategyError::InvalidShardingSpec {
                node: node.to_string(),
                strategy: strategy.name.clone(),
                source,
            });
        }
    }
    Ok(())
}

fn tensor_cost(
    manager: &ShapeConsistencyManager,
    prev: &ShardingSpec,
    current: &ShardingSpec,
    element_size: usize,
) -> Result<TrainCycleItem> {
    Ok(manager.resharding_cost(prev, current, element_size)?)
}

/// Cost of one predecessor strategy. Missing or non-tensor data is free; tuples add up
/// elementwise. `None` when producer and consumer disagree on the operand's kind.
pub(crate) fn resharding_cost(
    manager: &ShapeConsistencyManager,
    prev: Option<&OperandSpec>,
    current: &OperandSpec,
    data: &OperandValue,
) -> Option<Result<TrainCycleItem>> {
    let Some(prev) = prev else {
        return Some(Ok(TrainCycleItem::default()));
    };
    let cost = match (prev, current, data) {
        (_, _, OperandValue::NonTensor) | (OperandSpec::NonTensor, _, _) => {
            Ok(TrainCycleItem::default())
        }
        (OperandSpec::Tensor(p), OperandSpec::Tensor(c), OperandValue::Tensor(meta)) => {
            tensor_cost(manager, p, c, meta.dtype.element_size())
        }
        (OperandSpec::Tuple(ps), OperandSpec::Tuple(cs), OperandValue::Tuple(metas)) => ps
            .iter()
            .zip(cs)
            .zip(metas)
            .map(|((p, c), meta)| tensor_cost(manager, p, c, meta.dtype.element_size()))
            .sum(),
        _ => return None,
    };
    Some(cost)
}

/// Turns a strategy generated on a flattened batch view into physical strategies.
///
/// Logical dim 0 of `input` and `output` is the flattened batch. When it is sharded, one
/// strategy is emitted per physical batch dimension, renamed `{name}_{i}`, and candidates that
/// do not split evenly are dropped. The output's
/// logical dim 1 always maps to its last physical dim; with `input_has_feature` so does the
/// input's.
pub(crate) fn convert_logical_to_physical(
    node: &str,
    strategy: ShardingStrategy,
    input_role: &str,
    output_role: &str,
    input_has_feature: bool,
) -> Result<Vec<ShardingStrategy>> {
    let missing = || StrategyError::MissingMetaData {
        node: node.to_string(),
    };
    let in_phys = strategy
        .operands
        .get(input_role)
        .and_then(OperationData::physical_shape)
        .ok_or_else(missing)?
        .to_vec();
    let out_phys = strategy
        .operands
        .get(output_role)
        .and_then(OperationData::physical_shape)
        .ok_or_else(missing)?
        .to_vec();
    let in_spec = strategy.spec(input_role).ok_or_else(missing)?.clone();
    let out_spec = strategy.spec(output_role).ok_or_else(missing)?.clone();

    let batch_dims = if input_has_feature {
        in_phys.len().saturating_sub(1)
    } else {
        in_phys.len()
    };
    let remap = |batch: Option<usize>| -> std::result::Result<(ShardingSpec, ShardingSpec), ShardingError> {
        let mut in_map = BTreeMap::new();
        let mut out_map = BTreeMap::from([(1, out_phys.len().saturating_sub(1))]);
        if let Some(i) = batch {
            in_map.insert(0, i);
            out_map.insert(0, i);
        }
        if input_has_feature {
            in_map.insert(1, in_phys.len().saturating_sub(1));
        }
        Ok((
            in_spec.update_partition_dim(&in_map, &in_phys)?,
            out_spec.update_partition_dim(&out_map, &out_phys)?,
        ))
    };
    let rebind = |mut s: ShardingStrategy, (i, o): (ShardingSpec, ShardingSpec)| {
        s.sharding_specs
            .insert(input_role.to_string(), OperandSpec::Tensor(i));
        s.sharding_specs
            .insert(output_role.to_string(), OperandSpec::Tensor(o));
        s
    };

    if !in_spec.dim_partition().contains_key(&0) || batch_dims == 0 {
        let batch = (batch_dims == 1).then_some(0);
        let specs = remap(batch)?;
        return Ok(vec![rebind(strategy, specs)]);
    }

    let mut out = Vec::with_capacity(batch_dims);
    for i in 0..batch_dims {
        match remap(Some(i)) {
            Ok(specs) => {
                let mut copy = rebind(strategy.clone(), specs);
                copy.name = format!("{}_{i}", strategy.name);
                out.push(copy);
            }
            Err(ShardingError::NotDivisible {
                dim,
                dim_size,
                partitions,
            }) => {
                debug!(node, strategy = %strategy.name, dim, dim_size, partitions,
                    "dropping physical candidate");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}
