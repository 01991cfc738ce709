use super::{HandlerContext, NodeHandler};
use crate::auto_parallel::generators::{ElementwiseGenerator, StrategyGenerator, SumGenerator};
use crate::auto_parallel::graph::{NodeArg, OpKind};
use crate::auto_parallel::strategy::{OperandMap, OperationData, OperationDataType};
use crate::auto_parallel::{Result, StrategyError};

/// Unary activations and same-shape binary arithmetic.
pub struct ElementwiseHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> ElementwiseHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }

    fn symbol(&self) -> &'static str {
        match self.ctx.node.target {
            OpKind::Add => "+",
            OpKind::Mul => "*",
            _ => "",
        }
    }
}

impl<'g> NodeHandler<'g> for ElementwiseHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let node = self.ctx.node;
        let mut operands = Vec::with_capacity(node.args.len());
        for arg in &node.args {
            operands.push(match arg {
                NodeArg::Node(name) => {
                    self.ctx.arg_operand(self.ctx.graph.require(node, name)?)?
                }
                NodeArg::Scalar(v) => OperationData::non_tensor(v.to_string(), OperationDataType::Arg),
            });
        }
        if operands.is_empty() || operands.len() > 2 || operands[0].meta().is_none() {
            return Err(StrategyError::ArgumentCount {
                node: node.name.clone(),
                expected: if self.symbol().is_empty() { 1 } else { 2 },
                got: operands.len(),
            });
        }

        let mut mapping = OperandMap::new();
        let mut operands = operands.into_iter();
        if let Some(input) = operands.next() {
            mapping.insert("input".into(), input);
        }
        if let Some(other) = operands.next() {
            mapping.insert("other".into(), other);
        }
        mapping.insert("output".into(), self.ctx.output_operand()?);
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(ElementwiseGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
            self.symbol(),
        ))])
    }
}

/// `sum(x, dim)` without keepdim.
pub struct SumHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> SumHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }

    fn dim(&self) -> Result<usize> {
        self.ctx
            .node
            .dim
            .ok_or_else(|| StrategyError::MissingParameter {
                node: self.ctx.node.name.clone(),
                param: "dim".to_string(),
            })
    }
}

impl<'g> NodeHandler<'g> for SumHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let input = self.ctx.expect_args(1)?[0];
        let mut mapping = OperandMap::new();
        mapping.insert("input".into(), self.ctx.arg_operand(input)?);
        mapping.insert("output".into(), self.ctx.output_operand()?);
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(SumGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
            self.dim()?,
        ))])
    }
}
