//! Executing a reshard on real data.
//!
//! [`handle_trans_spec`] turns a planned conversion into a [`TransformPair`]: two plain
//! functions, one converting an activation from the source layout to the target layout and one
//! converting its gradient back. [`reshard_variable`] registers the pair as the gradient rule of
//! a [`Variable`], so resharding composes with the rest of the autograd graph.
//!
//! | Plan | Forward | Backward |
//! |---|---|---|
//! | no-op | identity | identity |
//! | `Shard` | narrow to the local slab | all-gather |
//! | `AllGather` | all-gather | narrow |
//! | `AllToAll` | all-to-all | all-to-all, dims swapped |
//! | `AllGather, Shard` | all-gather then narrow | all-gather then narrow |

use super::consistency::{CommAction, plan};
use super::{Result, ShardingError, ShardingSpec};
use crate::autograd::{self, GradCell, GraphNode, Variable, accumulate_grad};
use crate::distributed::CollectiveBackend;
use crate::tensor::{Tensor, TensorElem, TensorError};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

/// Converts a local piece laid out as `from` into the local piece laid out as `to`.
pub type TransformFn<B, T, const RANK: usize> =
    fn(&Tensor<T, RANK>, &ShardingSpec, &ShardingSpec, &B) -> Result<Tensor<T, RANK>>;

/// Forward and backward conversion between two layouts of one tensor.
pub struct TransformPair<B, T: TensorElem, const RANK: usize> {
    old: ShardingSpec,
    new: ShardingSpec,
    forward_fn: TransformFn<B, T, RANK>,
    backward_fn: TransformFn<B, T, RANK>,
}

impl<B, T, const RANK: usize> TransformPair<B, T, RANK>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    /// Converts an activation from the source layout to the target layout.
    pub fn forward(&self, local: &Tensor<T, RANK>, backend: &B) -> Result<Tensor<T, RANK>> {
        check_local_shape(local, &self.old)?;
        (self.forward_fn)(local, &self.old, &self.new, backend)
    }

    /// Converts a gradient laid out like the forward output back to the source layout.
    pub fn backward(&self, grad: &Tensor<T, RANK>, backend: &B) -> Result<Tensor<T, RANK>> {
        check_local_shape(grad, &self.new)?;
        (self.backward_fn)(grad, &self.new, &self.old, backend)
    }

    pub fn old_spec(&self) -> &ShardingSpec {
        &self.old
    }

    pub fn new_spec(&self) -> &ShardingSpec {
        &self.new
    }
}

impl<B, T: TensorElem, const RANK: usize> fmt::Debug for TransformPair<B, T, RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPair")
            .field("old", &self.old.to_string())
            .field("new", &self.new.to_string())
            .finish()
    }
}

/// Builds the forward/backward pair converting `old` into `new`.
///
/// # Errors
///
/// [`ShardingError::CrossGroup`] when the two layouts live on different meshes.
pub fn handle_trans_spec<B, T, const RANK: usize>(
    old: &ShardingSpec,
    new: &ShardingSpec,
) -> Result<TransformPair<B, T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    if old.entire_shape().len() != RANK {
        return Err(ShardingError::DimOutOfRange {
            dim: old.entire_shape().len(),
            rank: RANK,
        });
    }
    Ok(TransformPair {
        old: old.clone(),
        new: new.clone(),
        forward_fn: select(old, new)?,
        backward_fn: select(new, old)?,
    })
}

/// Converts this rank's piece of a tensor from `old` to `new`.
pub fn reshard<B, T, const RANK: usize>(
    local: &Tensor<T, RANK>,
    old: &ShardingSpec,
    new: &ShardingSpec,
    backend: &B,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    handle_trans_spec::<B, T, RANK>(old, new)?.forward(local, backend)
}

/// Differentiable reshard: the output's gradient flows back through the mirrored transform.
pub fn reshard_variable<B, T, const RANK: usize>(
    input: &Variable<T, RANK>,
    old: &ShardingSpec,
    new: &ShardingSpec,
    backend: Arc<B>,
) -> Result<Variable<T, RANK>>
where
    B: CollectiveBackend + 'static,
    T: TensorElem + 'static,
{
    let pair = handle_trans_spec::<B, T, RANK>(old, new)?;
    let data = pair.forward(&input.data, &backend)?;
    let out_grad = Rc::new(RefCell::new(None));
    let node = Rc::new(ReshardNode {
        pair,
        backend,
        input_grad: input.grad.clone(),
        out_grad: out_grad.clone(),
        parents: Variable::parents_of(&[input]),
    });
    Ok(Variable::with_node(data, out_grad, node))
}

struct ReshardNode<B, T: TensorElem, const RANK: usize> {
    pair: TransformPair<B, T, RANK>,
    backend: Arc<B>,
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<B, T: TensorElem, const RANK: usize> fmt::Debug for ReshardNode<B, T, RANK> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReshardNode").field("pair", &self.pair).finish()
    }
}

impl<B, T, const RANK: usize> GraphNode for ReshardNode<B, T, RANK>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    fn backward(&self) -> autograd::Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let grad = self.pair.backward(&grad, &self.backend)?;
        accumulate_grad(&self.input_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

fn select<B, T, const RANK: usize>(
    from: &ShardingSpec,
    to: &ShardingSpec,
) -> Result<TransformFn<B, T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    let path = plan(from, to)?;
    let f: TransformFn<B, T, RANK> = match path.actions.as_slice() {
        [] => identity,
        [CommAction::Shard { .. }] => split,
        [CommAction::AllGather { .. }] => gather,
        [CommAction::AllToAll { .. }] => all_to_all,
        _ => gather_then_split,
    };
    Ok(f)
}

fn check_local_shape<T: TensorElem, const RANK: usize>(
    local: &Tensor<T, RANK>,
    spec: &ShardingSpec,
) -> Result<()> {
    let expected = spec.sharded_shape_per_device();
    if local.shape().as_slice() != expected.as_slice() {
        return Err(ShardingError::ShapeMismatch {
            spec: expected,
            tensor: local.shape().to_vec(),
        });
    }
    Ok(())
}

fn identity<B, T: TensorElem, const RANK: usize>(
    local: &Tensor<T, RANK>,
    _from: &ShardingSpec,
    _to: &ShardingSpec,
    _backend: &B,
) -> Result<Tensor<T, RANK>> {
    Ok(local.clone())
}

/// Keeps this rank's slab of every dimension `to` shards; `local` must hold those dims whole.
fn split<B, T: TensorElem, const RANK: usize>(
    local: &Tensor<T, RANK>,
    _from: &ShardingSpec,
    to: &ShardingSpec,
    _backend: &B,
) -> Result<Tensor<T, RANK>> {
    let mesh = to.mesh();
    let mut out = local.clone();
    for (&dim, axes) in to.dim_partition() {
        let idx = mesh.local_index_along_axes(axes)?;
        let len = out.shape()[dim] / mesh.partitions(axes);
        out = out.narrow(dim, idx * len, len)?;
    }
    Ok(out)
}

/// Reassembles the full tensor from the pieces held along every sharded axis of `from`.
fn gather<B, T, const RANK: usize>(
    local: &Tensor<T, RANK>,
    from: &ShardingSpec,
    _to: &ShardingSpec,
    backend: &B,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    let mesh = from.mesh();
    let group = mesh.get_group_along_axes(&from.sharded_axes())?;
    let mut pieces = backend.all_gather(local, &group)?;
    trace!(spec = %from, pieces = pieces.len(), "gathered shards");

    // Members are ordered first axis major, so the last sharded dim varies fastest.
    for (&dim, axes) in from.dim_partition().iter().rev() {
        let parts = mesh.partitions(axes);
        pieces = pieces
            .chunks(parts)
            .map(|run| Tensor::cat(run, dim))
            .collect::<crate::tensor::Result<Vec<_>>>()?;
    }
    pieces.pop().ok_or_else(|| {
        ShardingError::Tensor(TensorError::Unsupported(format!(
            "gather for {from} produced no tensor"
        )))
    })
}

/// Moves the split of a single sharded dim to another dim over the same mesh axes.
fn all_to_all<B, T, const RANK: usize>(
    local: &Tensor<T, RANK>,
    from: &ShardingSpec,
    to: &ShardingSpec,
    backend: &B,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    let (Some((&gather_dim, axes)), Some((&scatter_dim, _))) = (
        from.dim_partition().iter().next(),
        to.dim_partition().iter().next(),
    ) else {
        return gather_then_split(local, from, to, backend);
    };
    let mesh = from.mesh();
    let group = mesh.get_group_along_axes(axes)?;
    let outgoing = local.chunk(mesh.partitions(axes), scatter_dim)?;
    let incoming = backend.all_to_all(outgoing, &group)?;
    Ok(Tensor::cat(&incoming, gather_dim)?)
}

fn gather_then_split<B, T, const RANK: usize>(
    local: &Tensor<T, RANK>,
    from: &ShardingSpec,
    to: &ShardingSpec,
    backend: &B,
) -> Result<Tensor<T, RANK>>
where
    B: CollectiveBackend,
    T: TensorElem + 'static,
{
    let full = gather(local, from, to, backend)?;
    split(&full, from, to, backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_mesh::DeviceMesh;
    use crate::distributed::CpuBackend;
    use std::collections::BTreeMap;

    fn spec(mesh: &Arc<DeviceMesh>, shape: &[usize], part: &[(usize, &[usize])]) -> ShardingSpec {
        let part: BTreeMap<usize, Vec<usize>> =
            part.iter().map(|(d, a)| (*d, a.to_vec())).collect();
        ShardingSpec::new(mesh.clone(), shape.to_vec(), part).unwrap()
    }

    #[test]
    fn test_split_single_rank_mesh_is_identity_on_data() {
        let mesh = Arc::new(DeviceMesh::logical(vec![1]).unwrap());
        let r = spec(&mesh, &[2, 2], &[]);
        let s0 = spec(&mesh, &[2, 2], &[(0, &[0])]);
        let backend = CpuBackend::world(1).pop().unwrap();

        let t = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]).unwrap();
        let out = reshard(&t, &r, &s0, &backend).unwrap();
        assert_eq!(out.data(), t.data());
    }

    #[test]
    fn test_local_shape_is_checked() {
        let mesh = Arc::new(DeviceMesh::new(vec![2], vec![0, 1], 0).unwrap());
        let s0 = spec(&mesh, &[4, 2], &[(0, &[0])]);
        let r = spec(&mesh, &[4, 2], &[]);
        let backend = CpuBackend::world(1).pop().unwrap();

        let wrong = Tensor::<f32, 2>::zeros([4, 2]);
        assert!(matches!(
            reshard(&wrong, &s0, &r, &backend),
            Err(ShardingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_split_takes_local_slab() {
        // rank 1 on a 2-device mesh keeps rows 2..4
        let mesh = Arc::new(DeviceMesh::new(vec![2], vec![0, 1], 1).unwrap());
        let r = spec(&mesh, &[4, 1], &[]);
        let s0 = spec(&mesh, &[4, 1], &[(0, &[0])]);
        let backend = CpuBackend::world(1).pop().unwrap();

        let t = Tensor::<f32, 2>::new(vec![0.0, 1.0, 2.0, 3.0], [4, 1]).unwrap();
        let pair = handle_trans_spec::<CpuBackend, f32, 2>(&r, &s0).unwrap();
        assert_eq!(pair.forward(&t, &backend).unwrap().data(), &[2.0, 3.0]);
    }

    #[test]
    fn test_cross_mesh_rejected() {
        let a = Arc::new(DeviceMesh::logical(vec![2]).unwrap());
        let b = Arc::new(DeviceMesh::logical(vec![4]).unwrap());
        let old = spec(&a, &[4], &[(0, &[0])]);
        let new = spec(&b, &[4], &[(0, &[0])]);
        assert!(matches!(
            handle_trans_spec::<CpuBackend, f32, 1>(&old, &new),
            Err(ShardingError::CrossGroup { .. })
        ));
    }
}
