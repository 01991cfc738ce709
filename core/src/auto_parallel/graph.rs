//! A traced computation graph, reduced to what strategy search needs: operator identity,
//! argument wiring, and per-node tensor metadata.

use super::{Result, StrategyError};
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Shape and dtype of a tensor, without data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
}

fn default_dtype() -> DType {
    DType::F32
}

impl TensorMeta {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    pub fn f32(shape: Vec<usize>) -> Self {
        Self::new(shape, DType::F32)
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// How a node was produced by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOp {
    Placeholder,
    GetAttr,
    CallModule,
    CallFunction,
    CallMethod,
    Output,
}

/// Operator identity used to look up a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Placeholder,
    GetAttr,
    Output,
    Linear,
    Embedding,
    Relu,
    Add,
    Mul,
    Sum,
    Conv2d,
    /// Anything the tracer emitted that has no handler.
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Other(name) => f.write_str(name),
            kind => write!(f, "{kind:?}"),
        }
    }
}

/// One positional argument of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeArg {
    /// Output of another node.
    Node(String),
    /// A plain number, e.g. the `2` in `x * 2`.
    Scalar(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: NodeOp,
    pub target: OpKind,
    #[serde(default)]
    pub args: Vec<NodeArg>,
    /// Output metadata attached by the tracer.
    #[serde(default)]
    pub meta: Option<TensorMeta>,
    /// Module parameters by local name (`weight`, `bias`).
    #[serde(default)]
    pub params: BTreeMap<String, TensorMeta>,
    /// Reduction dimension, for reductions.
    #[serde(default)]
    pub dim: Option<usize>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: NodeOp, target: OpKind) -> Self {
        Self {
            name: name.into(),
            op,
            target,
            args: Vec::new(),
            meta: None,
            params: BTreeMap::new(),
            dim: None,
        }
    }

    pub fn placeholder(name: impl Into<String>, meta: TensorMeta) -> Self {
        Self::new(name, NodeOp::Placeholder, OpKind::Placeholder).with_meta(meta)
    }

    pub fn get_attr(name: impl Into<String>, meta: TensorMeta) -> Self {
        Self::new(name, NodeOp::GetAttr, OpKind::GetAttr).with_meta(meta)
    }

    pub fn output(args: &[&str]) -> Self {
        let mut node = Self::new("output", NodeOp::Output, OpKind::Output);
        node.args = args.iter().map(|a| NodeArg::Node(a.to_string())).collect();
        node
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| NodeArg::Node(a.to_string())).collect();
        self
    }

    pub fn with_scalar(mut self, value: f64) -> Self {
        self.args.push(NodeArg::Scalar(value));
        self
    }

    pub fn with_meta(mut self, meta: TensorMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, meta: TensorMeta) -> Self {
        self.params.insert(name.into(), meta);
        self
    }

    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }

    /// Output metadata.
    ///
    /// # Errors
    ///
    /// [`StrategyError::MissingMetaData`] when the tracer attached none.
    pub fn meta(&self) -> Result<&TensorMeta> {
        self.meta.as_ref().ok_or_else(|| StrategyError::MissingMetaData {
            node: self.name.clone(),
        })
    }

    pub fn param(&self, name: &str) -> Result<&TensorMeta> {
        self.params
            .get(name)
            .ok_or_else(|| StrategyError::MissingParameter {
                node: self.name.clone(),
                param: name.to_string(),
            })
    }

    /// Names of the nodes this node reads, in argument order, without repeats.
    pub fn input_nodes(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for arg in &self.args {
            if let NodeArg::Node(name) = arg {
                if !seen.contains(&name.as_str()) {
                    seen.push(name.as_str());
                }
            }
        }
        seen
    }
}

/// Nodes in topological order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Node>", into = "Vec<Node>")]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Graph {
    /// # Errors
    ///
    /// [`StrategyError::UnknownNode`] when a node reads a node that is not defined before it.
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            for input in node.input_nodes() {
                if !index.contains_key(input) {
                    return Err(StrategyError::UnknownNode {
                        node: node.name.clone(),
                        name: input.to_string(),
                    });
                }
            }
            index.insert(node.name.clone(), i);
        }
        Ok(Self { nodes, index })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Looks up an argument of `of`.
    pub fn require(&self, of: &Node, name: &str) -> Result<&Node> {
        self.node(name).ok_or_else(|| StrategyError::UnknownNode {
            node: of.name.clone(),
            name: name.to_string(),
        })
    }

    /// Nodes that read `name`.
    pub fn users(&self, name: &str) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.input_nodes().contains(&name))
            .collect()
    }
}

impl TryFrom<Vec<Node>> for Graph {
    type Error = StrategyError;

    fn try_from(nodes: Vec<Node>) -> Result<Self> {
        Graph::new(nodes)
    }
}

impl From<Graph> for Vec<Node> {
    fn from(graph: Graph) -> Self {
        graph.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp() -> Graph {
        Graph::new(vec![
            Node::placeholder("x", TensorMeta::f32(vec![4, 8])),
            Node::new("fc", NodeOp::CallModule, OpKind::Linear)
                .with_args(&["x"])
                .with_param("weight", TensorMeta::f32(vec![16, 8]))
                .with_meta(TensorMeta::f32(vec![4, 16])),
            Node::output(&["fc"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup_and_users() {
        let g = mlp();
        assert_eq!(g.nodes().len(), 3);
        assert_eq!(g.node("fc").unwrap().meta().unwrap().shape, vec![4, 16]);
        let users: Vec<_> = g.users("x").iter().map(|n| n.name.as_str()).collect();
        assert_eq!(users, vec!["fc"]);
    }

    #[test]
    fn test_forward_reference_rejected() {
        let err = Graph::new(vec![Node::output(&["x"])]).unwrap_err();
        assert!(matches!(err, StrategyError::UnknownNode { .. }));
    }

    #[test]
    fn test_missing_meta() {
        let node = Node::new("y", NodeOp::CallFunction, OpKind::Relu);
        assert!(matches!(
            node.meta(),
            Err(StrategyError::MissingMetaData { .. })
        ));
    }

    #[test]
    fn test_scalar_args_are_not_inputs() {
        let node = Node::new("mul", NodeOp::CallFunction, OpKind::Mul)
            .with_args(&["x", "x"])
            .with_scalar(2.0);
        assert_eq!(node.input_nodes(), vec!["x"]);
    }

    #[test]
    fn test_json_graph() {
        let json = r#"[
            {"name": "x", "op": "placeholder", "target": "placeholder",
             "meta": {"shape": [4, 4]}},
            {"name": "y", "op": "call_function", "target": "gelu", "args": ["x"],
             "meta": {"shape": [4, 4]}}
        ]"#;
        let g: Graph = serde_json::from_str(json).unwrap();
        assert_eq!(g.node("y").unwrap().target, OpKind::Other("gelu".into()));
    }
}
