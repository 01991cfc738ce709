use super::{AxisSets, GeneratorBase, Layout, StrategyGenerator, layout, sequence};
use crate::auto_parallel::Result;
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, TrainCycleItem};
use std::sync::Arc;

/// Embedding lookup on the logical view: `input [B]`, `other [vocab, dim]`, `output [B, dim]`,
/// where `B` is the product of every index dimension.
pub struct EmbeddingStrategyGenerator {
    base: GeneratorBase,
}

impl EmbeddingStrategyGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }

    /// (input, weight, output, axes the output is a partial sum over)
    fn candidates(&self) -> Vec<(Layout, Layout, Layout, Vec<usize>)> {
        let sets = AxisSets::of(&self.base.mesh);
        let mut out = Vec::new();
        for &i in &sets.singles {
            out.push((layout(&[(0, &[i])]), Layout::new(), layout(&[(0, &[i])]), vec![]));
            out.push((Layout::new(), layout(&[(1, &[i])]), layout(&[(1, &[i])]), vec![]));
            // vocabulary split: each device looks up its rows, the rest contribute zeros
            out.push((Layout::new(), layout(&[(0, &[i])]), Layout::new(), vec![i]));
        }
        for &(i, j) in &sets.pairs {
            out.push((
                layout(&[(0, &[i])]),
                layout(&[(1, &[j])]),
                layout(&[(0, &[i]), (1, &[j])]),
                vec![],
            ));
            out.push((
                layout(&[(0, &[i])]),
                layout(&[(0, &[j])]),
                layout(&[(0, &[i])]),
                vec![j],
            ));
        }
        if let Some(all) = &sets.all {
            out.push((layout(&[(0, all)]), Layout::new(), layout(&[(0, all)]), vec![]));
            out.push((Layout::new(), layout(&[(1, all)]), layout(&[(1, all)]), vec![]));
        }
        out.push((Layout::new(), Layout::new(), Layout::new(), vec![]));
        out
    }
}

impl StrategyGenerator for EmbeddingStrategyGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let out_shape = self.base.shape("output")?;
        let lookups = out_shape.iter().product::<usize>() as f64;
        let elem = self.base.element_size("output") as f64;

        let built = self
            .candidates()
            .into_iter()
            .map(|(input, weight, output, reduce)| {
                let name = format!(
                    "{} = {} x {}",
                    sequence(&output, 2),
                    sequence(&input, 1),
                    sequence(&weight, 2)
                );
                let mut strategy = self.base.build(
                    name,
                    &[("input", input), ("other", weight), ("output", output)],
                )?;
                let fwd = if reduce.is_empty() {
                    0.0
                } else {
                    let local = GeneratorBase::local_numel(&strategy, "output");
                    self.base.mesh.all_reduce_cost(local, &reduce)
                };
                self.base
                    .price(&mut strategy, lookups, TrainCycleItem::new(fwd, 0.0).scaled(elem));
                Ok::<_, ShardingError>(strategy)
            })
            .collect();
        self.base.collect("embedding", built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_parallel::graph::TensorMeta;
    use crate::auto_parallel::strategy::{OperationData, OperationDataType};
    use crate::tensor::DType;

    #[test]
    fn test_embedding_strategies_2d() {
        let mesh = Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap());
        let mut ops = OperandMap::new();
        ops.insert(
            "input".into(),
            OperationData::tensor("ids", OperationDataType::Arg, TensorMeta::new(vec![4, 4], DType::I64))
                .with_logical_shape(vec![16]),
        );
        ops.insert(
            "other".into(),
            OperationData::tensor("weight", OperationDataType::Param, TensorMeta::f32(vec![32, 8])),
        );
        ops.insert(
            "output".into(),
            OperationData::tensor("emb", OperationDataType::Output, TensorMeta::f32(vec![4, 4, 8]))
                .with_logical_shape(vec![16, 8]),
        );
        let strategies = EmbeddingStrategyGenerator::new(ops, mesh).generate().unwrap();
        let names: Vec<&str> = strategies.iter().map(|s| s.name.as_str()).collect();

        assert_eq!(strategies.len(), 6 + 4 + 2 + 1);
        assert_eq!(names[0], "S0R = S0 x RR");
        assert!(names.contains(&"RR = R x S1R"));
        assert!(names.contains(&"S1S0 = S1 x RS0"));
        assert!(names.contains(&"S01R = S01 x RR"));

        let vocab = strategies.iter().find(|s| s.name == "RR = R x S0R").unwrap();
        assert!(vocab.communication_cost.fwd > 0.0);
        // specs are built on the logical view
        assert_eq!(vocab.spec("input").unwrap().entire_shape(), &[16]);
    }
}
