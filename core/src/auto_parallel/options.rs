use serde::{Deserialize, Serialize};

/// Policy applied to every node's strategies after generation.
///
/// The shard level of a strategy is the number of distinct mesh axes used by any of its tensor
/// operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardOption {
    /// Keep everything.
    #[default]
    Standard,
    /// Keep strategies using at least one mesh axis.
    Shard,
    /// Keep strategies using at least two distinct mesh axes.
    FullShard,
    /// Keep strategies using exactly one mesh axis, the mesh's last.
    ShardLastAxis,
}

impl ShardOption {
    /// `true` when a strategy using `axes` (distinct) survives the policy on a mesh whose last
    /// axis is `last_axis`.
    pub fn keeps(self, axes: &[usize], last_axis: usize) -> bool {
        let level = axes.len();
        match self {
            ShardOption::Standard => true,
            ShardOption::Shard => level > 0,
            ShardOption::FullShard => level > 1,
            ShardOption::ShardLastAxis => level == 1 && axes.contains(&last_axis),
        }
    }
}

/// Hint forwarded to the global solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverPreference {
    #[default]
    Standard,
    /// Prefer data parallelism.
    Dp,
    /// Prefer tensor parallelism.
    Tp,
}
