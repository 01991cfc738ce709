use super::{GeneratorBase, Layout, StrategyGenerator, enumerate_layouts, sequence};
use crate::auto_parallel::Result;
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, TrainCycleItem};
use std::sync::Arc;

/// Sum over one dimension, dropping it from the output.
///
/// Sharding the reduced dimension leaves every device with a partial sum; those candidates pay
/// an all-reduce of the output over the reduced dimension's axes.
pub struct SumGenerator {
    base: GeneratorBase,
    dim: usize,
}

impl SumGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>, dim: usize) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
            dim,
        }
    }

    fn output_layout(&self, input: &Layout) -> Layout {
        input
            .iter()
            .filter(|(d, _)| **d != self.dim)
            .map(|(&d, axes)| (if d > self.dim { d - 1 } else { d }, axes.clone()))
            .collect()
    }
}

impl StrategyGenerator for SumGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let in_shape = self.base.shape("input")?;
        let in_rank = in_shape.len();
        if self.dim >= in_rank {
            return Err(ShardingError::DimOutOfRange {
                dim: self.dim,
                rank: in_rank,
            }
            .into());
        }
        let out_rank = self.base.shape("output")?.len();
        let numel = in_shape.iter().product::<usize>() as f64;
        let elem = self.base.element_size("output") as f64;

        let built = enumerate_layouts(in_rank, &self.base.mesh)
            .into_iter()
            .map(|input| {
                let output = self.output_layout(&input);
                let name = format!(
                    "{} = {}",
                    sequence(&output, out_rank),
                    sequence(&input, in_rank)
                );
                let reduce = input.get(&self.dim).cloned();
                let mut strategy =
                    self.base
                        .build(name, &[("input", input), ("output", output)])?;
                let fwd = reduce.map_or(0.0, |axes| {
                    let local = GeneratorBase::local_numel(&strategy, "output");
                    self.base.mesh.all_reduce_cost(local, &axes)
                });
                self.base
                    .price(&mut strategy, numel, TrainCycleItem::new(fwd, 0.0).scaled(elem));
                Ok::<_, ShardingError>(strategy)
            })
            .collect();
        self.base.collect("sum", built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_parallel::graph::TensorMeta;
    use crate::auto_parallel::strategy::{OperationData, OperationDataType};

    #[test]
    fn test_sum_over_sharded_dim_needs_all_reduce() {
        let mesh = Arc::new(DeviceMesh::logical(vec![2]).unwrap());
        let mut ops = OperandMap::new();
        ops.insert(
            "input".into(),
            OperationData::tensor("x", OperationDataType::Arg, TensorMeta::f32(vec![4, 8])),
        );
        ops.insert(
            "output".into(),
            OperationData::tensor("s", OperationDataType::Output, TensorMeta::f32(vec![8])),
        );
        let strategies = SumGenerator::new(ops, mesh, 0).generate().unwrap();
        let names: Vec<&str> = strategies.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["R = RR", "R = S0R", "S0 = RS0"]);

        assert_eq!(strategies[0].communication_cost.total, 0.0);
        // all-reduce of 8 f32 elements over 2 devices
        assert_eq!(strategies[1].communication_cost.fwd, 8.0 * 4.0);
        assert_eq!(strategies[2].communication_cost.total, 0.0);
    }
}
