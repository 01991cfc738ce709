use super::{GeneratorBase, StrategyGenerator, enumerate_layouts, sequence};
use crate::auto_parallel::Result;
use crate::auto_parallel::strategy::{OperandMap, OperandValue, ShardingStrategy};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, TrainCycleItem};
use std::sync::Arc;

/// Unary ops and same-shape binary ops: every tensor operand follows the output's layout, so
/// no communication is ever needed inside the op.
pub struct ElementwiseGenerator {
    base: GeneratorBase,
    symbol: &'static str,
}

impl ElementwiseGenerator {
    /// `symbol` is used in strategy names for binary ops, e.g. `+`.
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>, symbol: &'static str) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
            symbol,
        }
    }
}

impl StrategyGenerator for ElementwiseGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let shape = self.base.shape("output")?;
        let rank = shape.len();
        let numel = shape.iter().product::<usize>() as f64;
        let other_is_tensor = self
            .base
            .op_data
            .get("other")
            .map(|op| matches!(op.data, OperandValue::Tensor(_)));

        let built = enumerate_layouts(rank, &self.base.mesh)
            .into_iter()
            .map(|l| {
                let seq = sequence(&l, rank);
                let name = match other_is_tensor {
                    None => format!("{seq} = {seq}"),
                    Some(true) => format!("{seq} = {seq} {} {seq}", self.symbol),
                    Some(false) => format!("{seq} = {seq} {} scalar", self.symbol),
                };
                let mut layouts = vec![("input", l.clone()), ("output", l.clone())];
                if other_is_tensor == Some(true) {
                    layouts.push(("other", l));
                }
                let mut strategy = self.base.build(name, &layouts)?;
                self.base
                    .price(&mut strategy, numel, TrainCycleItem::default());
                Ok::<_, ShardingError>(strategy)
            })
            .collect();
        self.base.collect("elementwise", built)
    }
}
