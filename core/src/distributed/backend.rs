use super::{ProcessGroup, Result};
use crate::tensor::{Tensor, TensorElem};

/// Abstraction for a distributed communication backend.
///
/// All methods are blocking and must be called by every member of `group` in the same order.
/// Collectives over a group of size 1 return their input without communicating.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the global rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Gathers every member's tensor; the result is ordered by group rank.
    fn all_gather<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        group: &ProcessGroup,
    ) -> Result<Vec<Tensor<T, RANK>>>;

    /// Sends `inputs[j]` to group member `j`; returns the pieces received, ordered by sender.
    fn all_to_all<T: TensorElem + 'static, const RANK: usize>(
        &self,
        inputs: Vec<Tensor<T, RANK>>,
        group: &ProcessGroup,
    ) -> Result<Vec<Tensor<T, RANK>>>;

    /// Sums `inputs[j]` across members and returns the sum of the piece addressed to this rank.
    fn reduce_scatter<T: TensorElem + 'static, const RANK: usize>(
        &self,
        inputs: Vec<Tensor<T, RANK>>,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>>;

    /// Element-wise sum across all members.
    fn all_reduce_sum<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>>;

    /// Returns the tensor held by group member `root`; non-root inputs are ignored.
    fn broadcast<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: Tensor<T, RANK>,
        root: usize,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>>;

    /// Blocks until every member has reached the barrier.
    fn barrier(&self, group: &ProcessGroup) -> Result<()>;
}
