use super::{HandlerContext, NodeHandler, convert_logical_to_physical};
use crate::auto_parallel::Result;
use crate::auto_parallel::generators::{
    Conv2dStrategyGenerator, LinearStrategyGenerator, StrategyGenerator,
};
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};

/// Collapses every leading dimension of `shape` into one, keeping the last.
fn flatten_leading(shape: &[usize]) -> Vec<usize> {
    match shape.split_last() {
        Some((last, lead)) => vec![lead.iter().product(), *last],
        None => vec![1, 1],
    }
}

/// `nn.Linear`-style module: one activation argument, `weight [out, in]` and optional `bias`.
///
/// Inputs of any rank are handled on a `[batch, in]` view and fanned out afterwards.
pub struct LinearHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> LinearHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for LinearHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let input = self.ctx.arg_operand(self.ctx.expect_args(1)?[0])?;
        let input_logical = flatten_leading(input.physical_shape().unwrap_or_default());
        let output = self.ctx.output_operand()?;
        let output_logical = flatten_leading(output.physical_shape().unwrap_or_default());

        let mut mapping = OperandMap::new();
        mapping.insert("input".into(), input.with_logical_shape(input_logical));
        mapping.insert("other".into(), self.ctx.param_operand_of_rank("weight", 2)?);
        if self.ctx.node.params.contains_key("bias") {
            mapping.insert("bias".into(), self.ctx.param_operand("bias")?);
        }
        mapping.insert("output".into(), output.with_logical_shape(output_logical));
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(LinearStrategyGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }

    fn post_process(&self, strategy: ShardingStrategy) -> Result<Vec<ShardingStrategy>> {
        convert_logical_to_physical(&self.ctx.node.name, strategy, "input", "output", true)
    }
}

/// `nn.Conv2d`-style module over `[N, C, H, W]`.
pub struct Conv2dHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> Conv2dHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for Conv2dHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let input = self.ctx.expect_args(1)?[0];
        let mut mapping = OperandMap::new();
        mapping.insert("input".into(), self.ctx.arg_operand(input)?);
        mapping.insert("other".into(), self.ctx.param_operand_of_rank("weight", 4)?);
        if self.ctx.node.params.contains_key("bias") {
            mapping.insert("bias".into(), self.ctx.param_operand("bias")?);
        }
        mapping.insert("output".into(), self.ctx.output_operand()?);
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(Conv2dStrategyGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_leading() {
        assert_eq!(flatten_leading(&[2, 3, 4]), vec![6, 4]);
        assert_eq!(flatten_leading(&[5, 4]), vec![5, 4]);
    }
}
