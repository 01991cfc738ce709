//! Generators for graph boundary nodes: inputs, attributes, and the output.

use super::{GeneratorBase, StrategyGenerator, enumerate_layouts, sequence};
use crate::auto_parallel::Result;
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, TrainCycleItem};
use std::sync::Arc;

/// Graph inputs arrive replicated; any other layout is reached through resharding.
pub struct PlaceholderGenerator {
    base: GeneratorBase,
}

impl PlaceholderGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }
}

impl StrategyGenerator for PlaceholderGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let mut strategy = self.base.build("Replica Placeholder".into(), &[])?;
        self.base.price(&mut strategy, 0.0, TrainCycleItem::default());
        Ok(vec![strategy])
    }
}

/// Attributes (constant tensors, parameters read directly) can be materialised in any layout.
pub struct GetattrGenerator {
    base: GeneratorBase,
}

impl GetattrGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }
}

impl StrategyGenerator for GetattrGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let rank = self.base.shape("output")?.len();
        let built = enumerate_layouts(rank, &self.base.mesh)
            .into_iter()
            .map(|l| {
                let mut strategy = self.base.build(sequence(&l, rank), &[("output", l)])?;
                self.base.price(&mut strategy, 0.0, TrainCycleItem::default());
                Ok::<_, ShardingError>(strategy)
            })
            .collect();
        self.base.collect("getattr", built)
    }
}

/// The graph output gathers every returned tensor back to a replicated layout.
pub struct OutputGenerator {
    base: GeneratorBase,
}

impl OutputGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }
}

impl StrategyGenerator for OutputGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let mut strategy = self.base.build("Replica Output".into(), &[])?;
        self.base.price(&mut strategy, 0.0, TrainCycleItem::default());
        Ok(vec![strategy])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_parallel::graph::TensorMeta;
    use crate::auto_parallel::strategy::{OperandSpec, OperandValue, OperationData, OperationDataType};

    #[test]
    fn test_output_is_replicated_tuple() {
        let mesh = Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap());
        let a = TensorMeta::f32(vec![4, 4]);
        let mut ops = OperandMap::new();
        ops.insert(
            "input_0".into(),
            OperationData::tensor("x", OperationDataType::Arg, a.clone()),
        );
        ops.insert(
            "output".into(),
            OperationData {
                name: "output".into(),
                kind: OperationDataType::Output,
                data: OperandValue::Tuple(vec![a.clone(), a]),
                logical_shape: None,
            },
        );
        let strategies = OutputGenerator::new(ops, mesh).generate().unwrap();
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].name, "Replica Output");
        match &strategies[0].sharding_specs["output"] {
            OperandSpec::Tuple(specs) => {
                assert_eq!(specs.len(), 2);
                assert!(specs.iter().all(|s| s.is_replicated()));
            }
            other => panic!("unexpected spec {other:?}"),
        }
        assert!(strategies[0].spec("input_0").unwrap().is_replicated());
    }

    #[test]
    fn test_getattr_enumerates_layouts() {
        let mesh = Arc::new(DeviceMesh::logical(vec![2]).unwrap());
        let mut ops = OperandMap::new();
        ops.insert(
            "output".into(),
            OperationData::tensor("w", OperationDataType::Output, TensorMeta::f32(vec![4, 3])),
        );
        let strategies = GetattrGenerator::new(ops, mesh).generate().unwrap();
        let names: Vec<&str> = strategies.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["RR", "S0R"]);
    }
}
