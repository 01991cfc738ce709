//! Linear and conv2d share one enumeration: both contract the input's dim 1 against the
//! weight's dim 1, keep the input's dim 0 as batch, and produce the weight's dim 0 as the
//! output's dim 1. Only the FLOP count differs.

use super::{AxisSets, GeneratorBase, Layout, StrategyGenerator, layout, sequence};
use crate::auto_parallel::{Result, StrategyError};
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};
use crate::device_mesh::DeviceMesh;
use crate::sharding::{ShardingError, TrainCycleItem};
use std::sync::Arc;

/// One assignment of mesh axes to the contraction's operands.
struct Candidate {
    input: Layout,
    weight: Layout,
    output: Layout,
    /// Output is a partial sum over these axes.
    reduce_output: Vec<usize>,
    /// Input gradient is a partial sum over these axes.
    reduce_input_grad: Vec<usize>,
}

fn candidates(mesh: &DeviceMesh) -> Vec<Candidate> {
    let sets = AxisSets::of(mesh);
    let mut out = Vec::new();

    for &i in &sets.singles {
        // batch split
        out.push(Candidate {
            input: layout(&[(0, &[i])]),
            weight: Layout::new(),
            output: layout(&[(0, &[i])]),
            reduce_output: vec![],
            reduce_input_grad: vec![],
        });
        // output-feature split
        out.push(Candidate {
            input: Layout::new(),
            weight: layout(&[(0, &[i])]),
            output: layout(&[(1, &[i])]),
            reduce_output: vec![],
            reduce_input_grad: vec![i],
        });
        // contraction split
        out.push(Candidate {
            input: layout(&[(1, &[i])]),
            weight: layout(&[(1, &[i])]),
            output: Layout::new(),
            reduce_output: vec![i],
            reduce_input_grad: vec![],
        });
    }

    for &(i, j) in &sets.pairs {
        out.push(Candidate {
            input: layout(&[(0, &[i])]),
            weight: layout(&[(0, &[j])]),
            output: layout(&[(0, &[i]), (1, &[j])]),
            reduce_output: vec![],
            reduce_input_grad: vec![j],
        });
        out.push(Candidate {
            input: layout(&[(0, &[i]), (1, &[j])]),
            weight: layout(&[(1, &[j])]),
            output: layout(&[(0, &[i])]),
            reduce_output: vec![j],
            reduce_input_grad: vec![],
        });
        out.push(Candidate {
            input: layout(&[(1, &[i])]),
            weight: layout(&[(0, &[j]), (1, &[i])]),
            output: layout(&[(1, &[j])]),
            reduce_output: vec![i],
            reduce_input_grad: vec![j],
        });
    }

    if let Some(all) = &sets.all {
        out.push(Candidate {
            input: layout(&[(0, all)]),
            weight: Layout::new(),
            output: layout(&[(0, all)]),
            reduce_output: vec![],
            reduce_input_grad: vec![],
        });
        out.push(Candidate {
            input: Layout::new(),
            weight: layout(&[(0, all)]),
            output: layout(&[(1, all)]),
            reduce_output: vec![],
            reduce_input_grad: all.clone(),
        });
        out.push(Candidate {
            input: layout(&[(1, all)]),
            weight: layout(&[(1, all)]),
            output: Layout::new(),
            reduce_output: all.clone(),
            reduce_input_grad: vec![],
        });
    }

    out.push(Candidate {
        input: Layout::new(),
        weight: Layout::new(),
        output: Layout::new(),
        reduce_output: vec![],
        reduce_input_grad: vec![],
    });
    out
}

fn generate(base: &GeneratorBase, generator: &str, flops: f64) -> Result<Vec<ShardingStrategy>> {
    let in_rank = base.shape("input")?.len();
    let w_rank = base.shape("other")?.len();
    let out_rank = base.shape("output")?.len();
    let has_bias = base.has("bias");
    let elem = base.element_size("output") as f64;

    let built = candidates(&base.mesh)
        .into_iter()
        .map(|c| {
            let name = format!(
                "{} = {} x {}",
                sequence(&c.output, out_rank),
                sequence(&c.input, in_rank),
                sequence(&c.weight, w_rank),
            );
            let mut layouts = vec![
                ("input", c.input.clone()),
                ("other", c.weight.clone()),
                ("output", c.output.clone()),
            ];
            if has_bias {
                let bias = c
                    .weight
                    .get(&0)
                    .map(|axes| layout(&[(0, axes)]))
                    .unwrap_or_default();
                layouts.push(("bias", bias));
            }
            let mut strategy = base.build(name, &layouts)?;

            let mesh = &base.mesh;
            let out_local = GeneratorBase::local_numel(&strategy, "output");
            let in_local = GeneratorBase::local_numel(&strategy, "input");
            let fwd = if c.reduce_output.is_empty() {
                0.0
            } else {
                mesh.all_reduce_cost(out_local, &c.reduce_output)
            };
            let bwd = if c.reduce_input_grad.is_empty() {
                0.0
            } else {
                mesh.all_reduce_cost(in_local, &c.reduce_input_grad)
            };
            let comm = TrainCycleItem::new(fwd, bwd).scaled(elem);
            base.price(&mut strategy, flops, comm);
            Ok::<_, ShardingError>(strategy)
        })
        .collect();
    base.collect(generator, built)
}

/// `output = input x weight^T + bias` with the weight in its `[out, in]` layout and the input
/// viewed as `[batch, in]`.
pub struct LinearStrategyGenerator {
    base: GeneratorBase,
}

impl LinearStrategyGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }
}

impl StrategyGenerator for LinearStrategyGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let input = self.base.shape("input")?;
        let weight = self.base.shape("other")?;
        let batch = input.first().copied().unwrap_or(1);
        let &[out_features, in_features] = weight else {
            return Err(StrategyError::ParameterRank {
                node: self.base.op("other")?.name.clone(),
                param: "weight".into(),
                expected: 2,
                got: weight.len(),
            });
        };
        let flops = 2.0 * (batch * in_features * out_features) as f64;
        generate(&self.base, "linear", flops)
    }
}

/// 2-D convolution over `[N, C, H, W]` with weight `[O, C, kh, kw]`.
pub struct Conv2dStrategyGenerator {
    base: GeneratorBase,
}

impl Conv2dStrategyGenerator {
    pub fn new(op_data: OperandMap, mesh: Arc<DeviceMesh>) -> Self {
        Self {
            base: GeneratorBase::new(op_data, mesh),
        }
    }
}

impl StrategyGenerator for Conv2dStrategyGenerator {
    fn generate(&self) -> Result<Vec<ShardingStrategy>> {
        let weight = self.base.shape("other")?;
        let output = self.base.shape("output")?;
        // every output element is a dot product over C * kh * kw
        let kernel_volume: usize = weight.iter().skip(1).product();
        let flops = 2.0 * (output.iter().product::<usize>() * kernel_volume) as f64;
        generate(&self.base, "conv2d", flops)
    }
}
