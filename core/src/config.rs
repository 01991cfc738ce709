//! Configuration for the strategy search.
//!
//! An [`AutoParallelConfig`] is normally read from TOML:
//!
//! ```toml
//! mesh_shape = [2, 2]
//! shard_option = "full_shard"
//!
//! [[graph]]
//! name = "x"
//! op = "placeholder"
//! target = "placeholder"
//! meta = { shape = [8, 16] }
//! ```
//!
//! Missing fields fall back to the `default_*` helpers below. Invalid combinations are rejected by
//! [`AutoParallelConfig::validate`] before any mesh or graph is built.

use crate::auto_parallel::{Graph, Node, ShardOption, SolverPreference, StrategiesConstructor};
use crate::device_mesh::{DeviceMesh, MeshError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Strategy(#[from] crate::auto_parallel::StrategyError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoParallelConfig {
    #[serde(default = "default_mesh_shape")]
    pub mesh_shape: Vec<usize>,
    /// Physical ranks in row-major mesh order. Defaults to `0..num_devices`.
    #[serde(default)]
    pub ranks: Option<Vec<usize>>,
    #[serde(default)]
    pub local_rank: usize,
    #[serde(default)]
    pub shard_option: ShardOption,
    #[serde(default)]
    pub solver_preference: SolverPreference,
    #[serde(default)]
    pub graph: Vec<Node>,
}

fn default_mesh_shape() -> Vec<usize> {
    vec![1]
}

impl Default for AutoParallelConfig {
    fn default() -> Self {
        Self {
            mesh_shape: default_mesh_shape(),
            ranks: None,
            local_rank: 0,
            shard_option: ShardOption::default(),
            solver_preference: SolverPreference::default(),
            graph: Vec::new(),
        }
    }
}

impl AutoParallelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mesh_shape.is_empty() || self.mesh_shape.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "mesh_shape {:?} must be non-empty with positive extents",
                self.mesh_shape
            )));
        }
        let devices: usize = self.mesh_shape.iter().product();
        if let Some(ranks) = &self.ranks {
            if ranks.len() != devices {
                return Err(ConfigError::Invalid(format!(
                    "{} ranks given for a mesh of {devices} devices",
                    ranks.len()
                )));
            }
        }
        if matches!(self.shard_option, ShardOption::FullShard) && self.mesh_shape.len() < 2 {
            return Err(ConfigError::Invalid(
                "full_shard needs a mesh with at least two axes".into(),
            ));
        }
        Ok(())
    }

    pub fn build_mesh(&self) -> Result<DeviceMesh> {
        let ranks = self
            .ranks
            .clone()
            .unwrap_or_else(|| (0..self.mesh_shape.iter().product()).collect());
        Ok(DeviceMesh::new(
            self.mesh_shape.clone(),
            ranks,
            self.local_rank,
        )?)
    }

    pub fn build_graph(&self) -> Result<Graph> {
        Ok(Graph::new(self.graph.clone())?)
    }

    /// A constructor carrying this config's mesh and policies.
    pub fn constructor(&self) -> Result<StrategiesConstructor> {
        let mesh = Arc::new(self.build_mesh()?);
        Ok(StrategiesConstructor::new(mesh)
            .with_shard_option(self.shard_option)
            .with_solver_preference(self.solver_preference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AutoParallelConfig::from_toml_str("").unwrap();
        assert_eq!(config.mesh_shape, vec![1]);
        assert_eq!(config.shard_option, ShardOption::Standard);
        assert!(config.graph.is_empty());
    }

    #[test]
    fn test_rank_count_checked() {
        let err = AutoParallelConfig::from_toml_str("mesh_shape = [2, 2]\nranks = [0, 1, 2]")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_full_shard_needs_two_axes() {
        let err = AutoParallelConfig::from_toml_str("mesh_shape = [4]\nshard_option = \"full_shard\"")
            .unwrap_err();
        assert!(err.to_string().contains("two axes"));
    }

    #[test]
    fn test_graph_from_toml() {
        let config = AutoParallelConfig::from_toml_str(
            r#"
            mesh_shape = [2]

            [[graph]]
            name = "x"
            op = "placeholder"
            target = "placeholder"
            meta = { shape = [4, 8] }

            [[graph]]
            name = "fc"
            op = "call_module"
            target = "linear"
            args = ["x"]
            meta = { shape = [4, 2] }
            params = { weight = { shape = [2, 8] } }

            [[graph]]
            name = "output"
            op = "output"
            target = "output"
            args = ["fc"]
            "#,
        )
        .unwrap();
        let graph = config.build_graph().unwrap();
        assert_eq!(graph.nodes().len(), 3);
        let strategies = config
            .constructor()
            .unwrap()
            .build_strategies_and_cost(&graph)
            .unwrap();
        assert!(!strategies.get("fc").unwrap().is_empty());
    }

    #[test]
    fn test_scalar_linear_weight_rejected() {
        let config = AutoParallelConfig::from_toml_str(
            r#"
            mesh_shape = [2]

            [[graph]]
            name = "x"
            op = "placeholder"
            target = "placeholder"
            meta = { shape = [4, 8] }

            [[graph]]
            name = "fc"
            op = "call_module"
            target = "linear"
            args = ["x"]
            meta = { shape = [4, 2] }
            params = { weight = { shape = [] } }
            "#,
        )
        .unwrap();
        let graph = config.build_graph().unwrap();
        let err = config
            .constructor()
            .unwrap()
            .build_strategies_and_cost(&graph)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::auto_parallel::StrategyError::ParameterRank { ref node, expected: 2, got: 0, .. }
                if node == "fc"
        ));
    }

    #[test]
    fn test_build_mesh() {
        let config =
            AutoParallelConfig::from_toml_str("mesh_shape = [2, 2]\nranks = [4, 5, 6, 7]\nlocal_rank = 6")
                .unwrap();
        let mesh = config.build_mesh().unwrap();
        assert_eq!(mesh.get_world_size(0), 2);
        assert_eq!(mesh.get_rank(), 6);
    }
}
