use super::backend::CollectiveBackend;
use super::{CommError, ProcessGroup, Result};
use crate::tensor::{Tensor, TensorElem};
use crossbeam::channel::{Receiver, Sender, unbounded};
use std::any::Any;

type Payload = Box<dyn Any + Send>;

/// A CPU-based collective backend where every rank is a thread.
///
/// Each ordered pair of ranks `(src, dst)` owns one unbounded `crossbeam` channel, so sends never
/// block and messages between two ranks arrive in the order they were sent. That per-pair FIFO
/// order is all the collectives below rely on.
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    /// `to_peer[dst]` sends to rank `dst`.
    to_peer: Vec<Sender<Payload>>,
    /// `from_peer[src]` receives from rank `src`.
    from_peer: Vec<Receiver<Payload>>,
}

impl CpuBackend {
    /// Builds one connected backend per rank. Move each into its own thread.
    pub fn world(world_size: usize) -> Vec<CpuBackend> {
        let mut senders: Vec<Vec<Sender<Payload>>> = vec![Vec::with_capacity(world_size); world_size];
        let mut receivers: Vec<Vec<Receiver<Payload>>> =
            vec![Vec::with_capacity(world_size); world_size];

        // channel (src -> dst): sender kept by src, receiver kept by dst
        for src in 0..world_size {
            for dst in 0..world_size {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                receivers[dst].push(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (to_peer, from_peer))| CpuBackend {
                rank,
                world_size,
                to_peer,
                from_peer,
            })
            .collect()
    }

    fn send<P: Any + Send>(&self, dst: usize, payload: P) -> Result<()> {
        self.to_peer[dst]
            .send(Box::new(payload))
            .map_err(|_| CommError::Disconnected { peer: dst })
    }

    fn recv<P: Any + Send>(&self, src: usize) -> Result<P> {
        let payload = self.from_peer[src]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: src })?;
        payload
            .downcast::<P>()
            .map(|b| *b)
            .map_err(|_| CommError::PayloadMismatch { peer: src })
    }

    fn check_inputs(&self, got: usize, group: &ProcessGroup) -> Result<()> {
        if got != group.size() {
            return Err(CommError::GroupSizeMismatch {
                expected: group.size(),
                got,
            });
        }
        Ok(())
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        group: &ProcessGroup,
    ) -> Result<Vec<Tensor<T, RANK>>> {
        let me = group.require_member(self.rank)?;
        for (i, &peer) in group.ranks().iter().enumerate() {
            if i != me {
                self.send(peer, tensor.clone())?;
            }
        }
        let mut out = Vec::with_capacity(group.size());
        for (i, &peer) in group.ranks().iter().enumerate() {
            if i == me {
                out.push(tensor.clone());
            } else {
                out.push(self.recv::<Tensor<T, RANK>>(peer)?);
            }
        }
        Ok(out)
    }

    fn all_to_all<T: TensorElem + 'static, const RANK: usize>(
        &self,
        inputs: Vec<Tensor<T, RANK>>,
        group: &ProcessGroup,
    ) -> Result<Vec<Tensor<T, RANK>>> {
        let me = group.require_member(self.rank)?;
        self.check_inputs(inputs.len(), group)?;

        let mut own = None;
        for (i, piece) in inputs.into_iter().enumerate() {
            if i == me {
                own = Some(piece);
            } else {
                self.send(group.global_rank(i), piece)?;
            }
        }
        let mut out = Vec::with_capacity(group.size());
        for (i, &peer) in group.ranks().iter().enumerate() {
            if i == me {
                match own.take() {
                    Some(piece) => out.push(piece),
                    None => return Err(CommError::PayloadMismatch { peer }),
                }
            } else {
                out.push(self.recv::<Tensor<T, RANK>>(peer)?);
            }
        }
        Ok(out)
    }

    fn reduce_scatter<T: TensorElem + 'static, const RANK: usize>(
        &self,
        inputs: Vec<Tensor<T, RANK>>,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>> {
        let received = self.all_to_all(inputs, group)?;
        let mut iter = received.into_iter();
        let Some(mut acc) = iter.next() else {
            return Err(CommError::GroupSizeMismatch {
                expected: group.size(),
                got: 0,
            });
        };
        for piece in iter {
            acc.accumulate(&piece)?;
        }
        Ok(acc)
    }

    /// Ring All-Reduce.
    ///
    /// Phase 1 (scatter-reduce): in `n - 1` steps every member passes one chunk to its right
    /// neighbour and adds the chunk arriving from its left. Afterwards member `r` holds the fully
    /// reduced chunk `r + 1`.
    /// Phase 2 (all-gather): another `n - 1` steps circulate the reduced chunks.
    fn all_reduce_sum<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: &Tensor<T, RANK>,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>> {
        let me = group.require_member(self.rank)?;
        let n = group.size();
        if n == 1 {
            return Ok(tensor.clone());
        }

        let mut data = tensor.data().to_vec();
        let total = data.len();
        let chunk_size = total.div_ceil(n);
        let bounds = |idx: usize| {
            let start = (idx * chunk_size).min(total);
            (start, (start + chunk_size).min(total))
        };
        let right = group.global_rank((me + 1) % n);
        let left = group.global_rank((me + n - 1) % n);

        // --- Phase 1: Scatter-Reduce ---
        for step in 0..n - 1 {
            let send_idx = (me + n - step) % n;
            let recv_idx = (me + 2 * n - step - 1) % n;

            let (s, e) = bounds(send_idx);
            self.send(right, data[s..e].to_vec())?;

            let incoming: Vec<T> = self.recv(left)?;
            let (rs, _) = bounds(recv_idx);
            for (slot, val) in data[rs..].iter_mut().zip(incoming) {
                *slot += val;
            }
        }

        // --- Phase 2: All-Gather ---
        for step in 0..n - 1 {
            let send_idx = (me + n + 1 - step) % n;
            let recv_idx = (me + n - step) % n;

            let (s, e) = bounds(send_idx);
            self.send(right, data[s..e].to_vec())?;

            let incoming: Vec<T> = self.recv(left)?;
            let (rs, _) = bounds(recv_idx);
            for (slot, val) in data[rs..].iter_mut().zip(incoming) {
                *slot = val;
            }
        }

        Ok(Tensor::new(data, *tensor.shape())?)
    }

    fn broadcast<T: TensorElem + 'static, const RANK: usize>(
        &self,
        tensor: Tensor<T, RANK>,
        root: usize,
        group: &ProcessGroup,
    ) -> Result<Tensor<T, RANK>> {
        let me = group.require_member(self.rank)?;
        if root >= group.size() {
            return Err(CommError::InvalidGroup(format!(
                "broadcast root {root} outside group of {}",
                group.size()
            )));
        }
        if me == root {
            for (i, &peer) in group.ranks().iter().enumerate() {
                if i != me {
                    self.send(peer, tensor.clone())?;
                }
            }
            Ok(tensor)
        } else {
            self.recv(group.global_rank(root))
        }
    }

    fn barrier(&self, group: &ProcessGroup) -> Result<()> {
        let me = group.require_member(self.rank)?;
        for (i, &peer) in group.ranks().iter().enumerate() {
            if i != me {
                self.send(peer, ())?;
            }
        }
        for (i, &peer) in group.ranks().iter().enumerate() {
            if i != me {
                self.recv::<()>(peer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_properties() {
        let backends = CpuBackend::world(3);
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[2].rank(), 2);
        assert_eq!(backends[2].world_size(), 3);
    }

    #[test]
    fn test_single_member_collectives() {
        let backend = CpuBackend::world(1).remove(0);
        let group = ProcessGroup::world(1);
        let t = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();

        assert_eq!(backend.all_reduce_sum(&t, &group).unwrap(), t);
        assert_eq!(backend.all_gather(&t, &group).unwrap(), vec![t.clone()]);
        assert_eq!(
            backend.reduce_scatter(vec![t.clone()], &group).unwrap(),
            t
        );
        backend.barrier(&group).unwrap();
    }

    #[test]
    fn test_not_in_group() {
        let backend = CpuBackend::world(2).remove(0);
        let group = ProcessGroup::new(vec![1]).unwrap();
        let t = Tensor::<f32, 1>::zeros([1]);
        assert!(matches!(
            backend.all_gather(&t, &group),
            Err(CommError::NotInGroup { rank: 0, .. })
        ));
    }

    #[test]
    fn test_input_count_checked() {
        let backend = CpuBackend::world(2).remove(0);
        let group = ProcessGroup::world(2);
        let t = Tensor::<f32, 1>::zeros([1]);
        assert!(matches!(
            backend.all_to_all(vec![t], &group),
            Err(CommError::GroupSizeMismatch {
                expected: 2,
                got: 1
            })
        ));
    }
}
