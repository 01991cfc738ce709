use super::{
    Conv2dHandler, ElementwiseHandler, EmbeddingHandler, GetattrHandler, HandlerContext,
    LinearHandler, NodeHandler, OutputHandler, PlaceholderHandler, SumHandler,
};
use crate::auto_parallel::graph::OpKind;
use crate::auto_parallel::{Result, StrategyError};
use std::collections::HashMap;

/// Builds the handler for one node.
pub type HandlerCtor = for<'g> fn(HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g>;

/// Operator kind → handler constructor.
///
/// [`OperatorRegistry::default`] registers every built-in handler; [`OperatorRegistry::register`]
/// adds or overrides one.
pub struct OperatorRegistry {
    handlers: HashMap<OpKind, HandlerCtor>,
}

fn placeholder<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(PlaceholderHandler::new(ctx))
}

fn getattr<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(GetattrHandler::new(ctx))
}

fn output<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(OutputHandler::new(ctx))
}

fn linear<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(LinearHandler::new(ctx))
}

fn conv2d<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(Conv2dHandler::new(ctx))
}

fn embedding<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(EmbeddingHandler::new(ctx))
}

fn elementwise<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(ElementwiseHandler::new(ctx))
}

fn sum<'g>(ctx: HandlerContext<'g>) -> Box<dyn NodeHandler<'g> + 'g> {
    Box::new(SumHandler::new(ctx))
}

impl OperatorRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: OpKind, ctor: HandlerCtor) -> &mut Self {
        self.handlers.insert(kind, ctor);
        self
    }

    pub fn contains(&self, kind: &OpKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// # Errors
    ///
    /// [`StrategyError::UnsupportedOperator`] when nothing is registered for the node's target.
    pub fn handler<'g>(&self, ctx: HandlerContext<'g>) -> Result<Box<dyn NodeHandler<'g> + 'g>> {
        match self.handlers.get(&ctx.node.target) {
            Some(ctor) => Ok(ctor(ctx)),
            None => Err(StrategyError::UnsupportedOperator {
                node: ctx.node.name.clone(),
                target: ctx.node.target.to_string(),
            }),
        }
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(OpKind::Placeholder, placeholder)
            .register(OpKind::GetAttr, getattr)
            .register(OpKind::Output, output)
            .register(OpKind::Linear, linear)
            .register(OpKind::Conv2d, conv2d)
            .register(OpKind::Embedding, embedding)
            .register(OpKind::Relu, elementwise)
            .register(OpKind::Add, elementwise)
            .register(OpKind::Mul, elementwise)
            .register(OpKind::Sum, sum);
        registry
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
