use super::{CommError, Result};
use serde::{Deserialize, Serialize};

/// An ordered set of global ranks that take part in a collective.
///
/// The position of a rank inside the group is its *group rank*; gathered results are always
/// ordered by group rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessGroup {
    ranks: Vec<usize>,
}

impl ProcessGroup {
    /// Creates a group from distinct global ranks.
    pub fn new(ranks: Vec<usize>) -> Result<Self> {
        if ranks.is_empty() {
            return Err(CommError::InvalidGroup("group must not be empty".into()));
        }
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != ranks.len() {
            return Err(CommError::InvalidGroup(format!(
                "duplicate ranks in {ranks:?}"
            )));
        }
        Ok(Self { ranks })
    }

    /// The group of all ranks `0..world_size`.
    pub fn world(world_size: usize) -> Self {
        Self {
            ranks: (0..world_size.max(1)).collect(),
        }
    }

    /// A group containing only `rank`.
    pub fn single(rank: usize) -> Self {
        Self { ranks: vec![rank] }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Global rank of the member at `group_rank`.
    pub fn global_rank(&self, group_rank: usize) -> usize {
        self.ranks[group_rank]
    }

    /// Position of `global_rank` in the group.
    pub fn rank_of(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    /// Like [`rank_of`](Self::rank_of) but fails for non-members.
    pub fn require_member(&self, global_rank: usize) -> Result<usize> {
        self.rank_of(global_rank).ok_or_else(|| CommError::NotInGroup {
            rank: global_rank,
            group: self.ranks.clone(),
        })
    }
}
