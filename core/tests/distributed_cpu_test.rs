use shard_rs::distributed::{CollectiveBackend, CpuBackend, ProcessGroup};
use shard_rs::tensor::Tensor;
use std::thread;

fn spawn_world<F>(world_size: usize, f: F)
where
    F: Fn(CpuBackend) + Send + Clone + 'static,
{
    let handles: Vec<_> = CpuBackend::world(world_size)
        .into_iter()
        .map(|backend| {
            let f = f.clone();
            thread::spawn(move || f(backend))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_ring_all_reduce_cpu() {
    spawn_world(4, |backend| {
        let rank = backend.rank();
        // Rank 0 has 1s, rank 1 has 2s, ... so the sum is 1+2+3+4 = 10.
        let tensor = Tensor::<f32, 2>::new(vec![(rank + 1) as f32; 8], [2, 4]).unwrap();
        let result = backend.all_reduce_sum(&tensor, &ProcessGroup::world(4)).unwrap();
        assert_eq!(result.shape(), &[2, 4]);
        assert!(result.data().iter().all(|&v| v == 10.0), "rank {rank}: {:?}", result.data());
    });
}

#[test]
fn test_ring_all_reduce_uneven_chunks() {
    // 7 elements over 3 ranks leaves a short last chunk
    spawn_world(3, |backend| {
        let rank = backend.rank() as f32;
        let tensor = Tensor::<f32, 1>::from_fn([7], |i| i as f32 + rank);
        let result = backend.all_reduce_sum(&tensor, &ProcessGroup::world(3)).unwrap();
        let expected: Vec<f32> = (0..7).map(|i| 3.0 * i as f32 + 3.0).collect();
        assert_eq!(result.data(), expected.as_slice());
    });
}

#[test]
fn test_collectives_on_disjoint_subgroups() {
    spawn_world(4, |backend| {
        let rank = backend.rank();
        // {0, 2} and {1, 3} run concurrently
        let group = ProcessGroup::new(vec![rank % 2, rank % 2 + 2]).unwrap();
        let mine = Tensor::<f32, 1>::new(vec![rank as f32; 2], [2]).unwrap();

        let gathered = backend.all_gather(&mine, &group).unwrap();
        let owners: Vec<f32> = gathered.iter().map(|t| t.data()[0]).collect();
        assert_eq!(owners, vec![(rank % 2) as f32, (rank % 2 + 2) as f32]);

        let sum = backend.all_reduce_sum(&mine, &group).unwrap();
        assert_eq!(sum.data()[0], (2 * (rank % 2) + 2) as f32);

        let root = backend.broadcast(mine.clone(), 1, &group).unwrap();
        assert_eq!(root.data()[0], (rank % 2 + 2) as f32);

        backend.barrier(&group).unwrap();
    });
}

#[test]
fn test_all_to_all_and_reduce_scatter() {
    spawn_world(2, |backend| {
        let rank = backend.rank();
        let group = ProcessGroup::world(2);
        // piece j of rank r holds 10 * r + j
        let pieces = |r: usize| -> Vec<Tensor<f32, 1>> {
            (0..2)
                .map(|j| Tensor::new(vec![(10 * r + j) as f32], [1]).unwrap())
                .collect()
        };

        let received = backend.all_to_all(pieces(rank), &group).unwrap();
        let values: Vec<f32> = received.iter().map(|t| t.data()[0]).collect();
        assert_eq!(values, vec![rank as f32, (10 + rank) as f32]);

        let reduced = backend.reduce_scatter(pieces(rank), &group).unwrap();
        assert_eq!(reduced.data(), &[(10 + 2 * rank) as f32]);
    });
}
