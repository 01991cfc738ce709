use super::graph::TensorMeta;
use crate::sharding::{ShardingSpec, TrainCycleItem};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Deref;

/// Role of an operand in its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationDataType {
    Input,
    Arg,
    Param,
    Buffer,
    Output,
}

/// What an operand holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OperandValue {
    Tensor(TensorMeta),
    /// Scalars and other non-tensor arguments; never sharded, never priced.
    NonTensor,
    Tuple(Vec<TensorMeta>),
}

/// One named operand of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationData {
    /// Node name for activations, local parameter name for parameters.
    pub name: String,
    pub kind: OperationDataType,
    pub data: OperandValue,
    /// View the generator shards, when it differs from the physical shape.
    pub logical_shape: Option<Vec<usize>>,
}

impl OperationData {
    pub fn tensor(name: impl Into<String>, kind: OperationDataType, meta: TensorMeta) -> Self {
        Self {
            name: name.into(),
            kind,
            data: OperandValue::Tensor(meta),
            logical_shape: None,
        }
    }

    pub fn non_tensor(name: impl Into<String>, kind: OperationDataType) -> Self {
        Self {
            name: name.into(),
            kind,
            data: OperandValue::NonTensor,
            logical_shape: None,
        }
    }

    pub fn with_logical_shape(mut self, shape: Vec<usize>) -> Self {
        self.logical_shape = Some(shape);
        self
    }

    pub fn meta(&self) -> Option<&TensorMeta> {
        match &self.data {
            OperandValue::Tensor(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn physical_shape(&self) -> Option<&[usize]> {
        self.meta().map(|m| m.shape.as_slice())
    }

    /// Shape used for strategy enumeration: the logical view if set, else the physical shape.
    pub fn logical_shape(&self) -> Option<&[usize]> {
        self.logical_shape.as_deref().or_else(|| self.physical_shape())
    }
}

/// Layout chosen for one operand.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandSpec {
    Tensor(ShardingSpec),
    NonTensor,
    Tuple(Vec<ShardingSpec>),
}

impl OperandSpec {
    pub fn as_tensor(&self) -> Option<&ShardingSpec> {
        match self {
            OperandSpec::Tensor(spec) => Some(spec),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            OperandSpec::Tensor(spec) => spec.to_string(),
            OperandSpec::NonTensor => "-".to_string(),
            OperandSpec::Tuple(specs) => {
                let parts: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
                format!("({})", parts.join(", "))
            }
        }
    }
}

/// Operands of a node keyed by role (`input`, `other`, `bias`, `output`, ...).
pub type OperandMap = BTreeMap<String, OperationData>;

/// One candidate execution plan for a node.
#[derive(Debug, Clone)]
pub struct ShardingStrategy {
    pub name: String,
    pub operands: OperandMap,
    /// Layout per role; same keys as `operands`.
    pub sharding_specs: BTreeMap<String, OperandSpec>,
    pub compute_cost: TrainCycleItem,
    pub memory_cost: TrainCycleItem,
    pub communication_cost: TrainCycleItem,
    /// Predecessor node name → cost of arriving from each of its strategies, in its order.
    pub resharding_costs: BTreeMap<String, Vec<TrainCycleItem>>,
}

impl ShardingStrategy {
    /// Finds the operand whose data is called `name`, returning its role too.
    pub fn get_op_data_by_name(&self, name: &str) -> Option<(&str, &OperationData)> {
        self.operands
            .iter()
            .find(|(_, op)| op.name == name)
            .map(|(role, op)| (role.as_str(), op))
    }

    pub fn get_sharding_spec_by_name(&self, name: &str) -> Option<&OperandSpec> {
        let (role, _) = self.get_op_data_by_name(name)?;
        self.sharding_specs.get(role)
    }

    /// Tensor layout of `role`.
    pub fn spec(&self, role: &str) -> Option<&ShardingSpec> {
        self.sharding_specs.get(role).and_then(OperandSpec::as_tensor)
    }

    /// Distinct mesh axes used by tensor operands, in first-use order.
    pub fn sharded_mesh_axes(&self) -> Vec<usize> {
        let mut axes = Vec::new();
        for spec in self.sharding_specs.values().filter_map(OperandSpec::as_tensor) {
            for axis in spec.sharded_axes() {
                if !axes.contains(&axis) {
                    axes.push(axis);
                }
            }
        }
        axes
    }

    /// Role → rendered layout, e.g. `input → [S0, R]`.
    pub fn describe_specs(&self) -> BTreeMap<String, String> {
        self.sharding_specs
            .iter()
            .map(|(role, spec)| (role.clone(), spec.describe()))
            .collect()
    }
}

/// The strategies registered for one node, in generation order.
#[derive(Debug, Clone, Default)]
pub struct StrategiesVector {
    pub node: String,
    strategies: Vec<ShardingStrategy>,
}

impl StrategiesVector {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            strategies: Vec::new(),
        }
    }

    pub fn push(&mut self, strategy: ShardingStrategy) {
        self.strategies.push(strategy);
    }

    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&ShardingStrategy) -> bool,
    {
        self.strategies.retain(keep);
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn into_inner(self) -> Vec<ShardingStrategy> {
        self.strategies
    }
}

impl Deref for StrategiesVector {
    type Target = [ShardingStrategy];

    fn deref(&self) -> &Self::Target {
        &self.strategies
    }
}

impl Extend<ShardingStrategy> for StrategiesVector {
    fn extend<I: IntoIterator<Item = ShardingStrategy>>(&mut self, iter: I) {
        self.strategies.extend(iter);
    }
}
