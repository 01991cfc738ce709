use super::{HandlerContext, NodeHandler};
use crate::auto_parallel::Result;
use crate::auto_parallel::generators::{
    GetattrGenerator, OutputGenerator, PlaceholderGenerator, StrategyGenerator,
};
use crate::auto_parallel::strategy::{OperandMap, OperandValue, OperationData, OperationDataType};

pub struct PlaceholderHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> PlaceholderHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for PlaceholderHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        Ok(OperandMap::from([("output".to_string(), self.ctx.output_operand()?)]))
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(PlaceholderGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }
}

pub struct GetattrHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> GetattrHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for GetattrHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        Ok(OperandMap::from([("output".to_string(), self.ctx.output_operand()?)]))
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(GetattrGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }
}

/// Returns every argument as `input_{i}` and the whole result as a tuple.
pub struct OutputHandler<'g> {
    ctx: HandlerContext<'g>,
}

impl<'g> OutputHandler<'g> {
    pub fn new(ctx: HandlerContext<'g>) -> Self {
        Self { ctx }
    }
}

impl<'g> NodeHandler<'g> for OutputHandler<'g> {
    fn context(&self) -> &HandlerContext<'g> {
        &self.ctx
    }

    fn get_operation_data_mapping(&self) -> Result<OperandMap> {
        let mut mapping = OperandMap::new();
        let mut metas = Vec::new();
        for name in self.ctx.node.input_nodes() {
            let arg = self.ctx.graph.require(self.ctx.node, name)?;
            let op = self.ctx.arg_operand(arg)?;
            metas.extend(op.meta().cloned());
            mapping.insert(format!("input_{}", mapping.len()), op);
        }
        mapping.insert(
            "output".to_string(),
            OperationData {
                name: self.ctx.node.name.clone(),
                kind: OperationDataType::Output,
                data: OperandValue::Tuple(metas),
                logical_shape: None,
            },
        );
        Ok(mapping)
    }

    fn get_strategy_generator(&self) -> Result<Vec<Box<dyn StrategyGenerator>>> {
        Ok(vec![Box::new(OutputGenerator::new(
            self.get_operation_data_mapping()?,
            self.ctx.mesh.clone(),
        ))])
    }
}
