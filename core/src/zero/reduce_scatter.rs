//! Bucketed reduce-scatter of gradients.
//!
//! Small gradients are copied into a per-group bucket and reduced together once the bucket is
//! full, so many tiny collectives become one large one. Inputs whose shard alone exceeds the
//! bucket are reduced on the spot.

use super::Result;
use crate::distributed::{CollectiveBackend, CommError, ProcessGroup};
use crate::tensor::{Tensor, TensorElem};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// A finished reduction: the summed shard of the input submitted under `key`.
#[derive(Debug, Clone)]
pub struct Reduced<K, T: TensorElem> {
    pub key: K,
    pub shard: Tensor<T, 1>,
}

#[derive(Debug)]
struct Bucket<K, T> {
    group: ProcessGroup,
    /// One row per group member; row `j` holds the chunks addressed to member `j`.
    rows: Vec<Vec<T>>,
    pending: Vec<(K, Range<usize>)>,
}

impl<K, T: TensorElem + 'static> Bucket<K, T> {
    fn new(group: ProcessGroup) -> Self {
        let rows = (0..group.size()).map(|_| Vec::new()).collect();
        Self {
            group,
            rows,
            pending: Vec::new(),
        }
    }

    fn offset(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    fn flush<B: CollectiveBackend>(&mut self, backend: &B) -> Result<Vec<Reduced<K, T>>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let inputs = self
            .rows
            .iter_mut()
            .map(|row| {
                let data = std::mem::take(row);
                let len = data.len();
                Tensor::new(data, [len])
            })
            .collect::<crate::tensor::Result<Vec<_>>>()?;
        let reduced = backend.reduce_scatter(inputs, &self.group)?;
        debug!(
            inputs = self.pending.len(),
            elements = reduced.size(),
            "flushed reduce-scatter bucket"
        );

        self.pending
            .drain(..)
            .map(|(key, range)| {
                Ok(Reduced {
                    key,
                    shard: reduced.narrow(0, range.start, range.len())?,
                })
            })
            .collect()
    }
}

/// Batches reduce-scatters per process group up to a byte budget.
#[derive(Debug)]
pub struct ReduceScatterBucketer<K, T> {
    bucket_bytes: usize,
    buckets: BTreeMap<Vec<usize>, Bucket<K, T>>,
}

impl<K, T: TensorElem + 'static> ReduceScatterBucketer<K, T> {
    pub fn new(bucket_bytes: usize) -> Self {
        Self {
            bucket_bytes,
            buckets: BTreeMap::new(),
        }
    }

    /// Largest shard, in elements, that fits a bucket for a group of `world_size`.
    pub fn shard_capacity(&self, world_size: usize) -> usize {
        self.bucket_bytes / std::mem::size_of::<T>() / world_size.max(1)
    }

    /// Submits `inputs[j]` (the chunk addressed to group member `j`) for reduction.
    ///
    /// Returns every reduction that completed during the call, in submission order: the input
    /// itself if it bypassed the bucket, or the previous bucket contents if this input forced a
    /// flush. Anything else completes in a later call or in [`flush`](Self::flush).
    pub fn reduce_scatter<B: CollectiveBackend>(
        &mut self,
        key: K,
        inputs: Vec<Tensor<T, 1>>,
        group: &ProcessGroup,
        backend: &B,
    ) -> Result<Vec<Reduced<K, T>>> {
        if inputs.len() != group.size() {
            return Err(CommError::GroupSizeMismatch {
                expected: group.size(),
                got: inputs.len(),
            }
            .into());
        }
        let shard_size = inputs[0].size();
        let capacity = self.shard_capacity(group.size());

        if shard_size > capacity {
            let shard = backend.reduce_scatter(inputs, group)?;
            return Ok(vec![Reduced { key, shard }]);
        }

        let bucket = self
            .buckets
            .entry(group.ranks().to_vec())
            .or_insert_with(|| Bucket::new(group.clone()));

        let ready = if shard_size > capacity - bucket.offset() {
            bucket.flush(backend)?
        } else {
            Vec::new()
        };

        let offset = bucket.offset();
        for (row, input) in bucket.rows.iter_mut().zip(&inputs) {
            row.extend_from_slice(input.data());
        }
        bucket.pending.push((key, offset..offset + shard_size));
        Ok(ready)
    }

    /// Reduces everything still sitting in a bucket.
    pub fn flush<B: CollectiveBackend>(&mut self, backend: &B) -> Result<Vec<Reduced<K, T>>> {
        let mut ready = Vec::new();
        for bucket in self.buckets.values_mut() {
            ready.extend(bucket.flush(backend)?);
        }
        Ok(ready)
    }

    /// Drops the bucket buffers.
    pub fn free(&mut self) {
        debug_assert!(self.buckets.values().all(|b| b.pending.is_empty()));
        self.buckets.clear();
    }

    /// Inputs waiting in a bucket.
    pub fn pending(&self) -> usize {
        self.buckets.values().map(|b| b.pending.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::CpuBackend;
    use std::thread;

    fn t(v: &[f32]) -> Tensor<f32, 1> {
        Tensor::new(v.to_vec(), [v.len()]).unwrap()
    }

    #[test]
    fn test_bucketing_across_two_ranks() {
        let handles: Vec<_> = CpuBackend::world(2)
            .into_iter()
            .map(|backend| {
                thread::spawn(move || {
                    let group = ProcessGroup::world(2);
                    let base = backend.rank() as f32 * 4.0;
                    // 2 elements per shard fit a 16 byte bucket of f32 over 2 ranks
                    let mut bucketer = ReduceScatterBucketer::<&str, f32>::new(16);
                    assert_eq!(bucketer.shard_capacity(2), 2);

                    let a = vec![t(&[base + 1.0, base + 2.0]), t(&[base + 3.0, base + 4.0])];
                    let done = bucketer.reduce_scatter("a", a, &group, &backend).unwrap();
                    assert!(done.is_empty());
                    assert_eq!(bucketer.pending(), 1);

                    // does not fit next to "a": flushes it
                    let b = vec![t(&[1.0, 1.0]), t(&[2.0, 2.0])];
                    let done = bucketer.reduce_scatter("b", b, &group, &backend).unwrap();
                    assert_eq!(done.len(), 1);
                    let a_shard = done[0].shard.data().to_vec();

                    // too large for any bucket: reduced immediately
                    let big = vec![t(&[1.0; 3]), t(&[2.0; 3])];
                    let done = bucketer.reduce_scatter("big", big, &group, &backend).unwrap();
                    assert_eq!(done[0].key, "big");

                    let rest = bucketer.flush(&backend).unwrap();
                    assert_eq!(rest.len(), 1);
                    assert_eq!(rest[0].key, "b");
                    bucketer.free();
                    (a_shard, rest[0].shard.data().to_vec(), done[0].shard.data().to_vec())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0].0, vec![6.0, 8.0]);
        assert_eq!(results[1].0, vec![10.0, 12.0]);
        assert_eq!(results[0].1, vec![2.0, 2.0]);
        assert_eq!(results[1].1, vec![4.0, 4.0]);
        assert_eq!(results[1].2, vec![4.0; 3]);
    }

    #[test]
    fn test_input_count_checked() {
        let backend = CpuBackend::world(1).remove(0);
        let mut bucketer = ReduceScatterBucketer::<u32, f32>::new(1024);
        let err = bucketer
            .reduce_scatter(0, vec![t(&[1.0]), t(&[2.0])], &ProcessGroup::world(1), &backend)
            .unwrap_err();
        assert!(err.to_string().contains("received 2 inputs"));
    }
}
