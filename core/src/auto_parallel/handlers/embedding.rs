use super::{HandlerContext, NodeHandler, convert_logical_to_physical};
use crate::auto_parallel::Result;
use crate::auto_parallel::generators::{EmbeddingStrategyGenerator, StrategyGenerator};
use crate::auto_parallel::strategy::{OperandMap, ShardingStrategy};

/// Embedding lookup, as a module (`weight` parameter) or as a function (`ids, weight` args).
///
/// Every index dimension is one flattened batch dimension for the generator; [`post_process`]
/// maps it back onto each physical index dimension in turn.
///
/// [`post_process`]: NodeHandler::post_process
pub struct EmbeddingHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> EmbeddingHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for EmbeddingHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let (input, other) = if self.ctx.node.params.contains_key("weight") {
            let input = self.ctx.expect_args(1)?[0];
            (self.ctx.arg_operand(input)?, self.ctx.param_operand("weight")?)
        } else {
            let args = self.ctx.expect_args(2)?;
            (self.ctx.arg_operand(args[0])?, self.ctx.arg_operand(args[1])?)
        };
        let ids: usize = input.physical_shape().unwrap_or_default().iter().product();
        let output = self.ctx.output_operand()?;
        let embed_dim = output
            .physical_shape()
            .and_then(|s| s.last().copied())
            .unwrap_or(1);

        let mut mapping = OperandMap::new();
        mapping.insert("input".into(), input.with_logical_shape(vec![ids]));
        mapping.insert("other".into(), other);
        mapping.insert(
            "output".into(),
            output.with_logical_shape(vec![ids, embed_dim]),
        );
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(EmbeddingStrategyGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }

    fn post_process(&self, strategy: ShardingStrategy) -> Result<Vec<ShardingStrategy>> {
        convert_logical_to_physical(&self.ctx.node.name, strategy, "input", "output", false)
    }
}
