use shard_rs::distributed::{CollectiveBackend, CpuBackend, ProcessGroup};
use shard_rs::optim::Sgd;
use shard_rs::tensor::{DType, Tensor};
use shard_rs::zero::{ReduceScatterBucketer, ShardedParam, TrainingState, ZeroConfig, ZeroModel};
use std::sync::Arc;
use std::thread;

/// Runs `f(rank, backend)` on `world_size` threads and returns the results in rank order.
fn run_world<R, F>(world_size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(usize, CpuBackend) -> R + Send + Clone + 'static,
{
    let handles: Vec<_> = CpuBackend::world(world_size)
        .into_iter()
        .enumerate()
        .map(|(rank, backend)| {
            let f = f.clone();
            thread::spawn(move || f(rank, backend))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn model(
    backend: CpuBackend,
    world_size: usize,
    params: Vec<ShardedParam<f32>>,
    config: ZeroConfig,
) -> ZeroModel<CpuBackend> {
    ZeroModel::new(
        vec![("root".to_string(), params)],
        Arc::new(backend),
        ProcessGroup::world(world_size),
        config,
    )
    .unwrap()
}

fn grad(values: &[f32]) -> Tensor<f32, 1> {
    Tensor::new(values.to_vec(), [values.len()]).unwrap()
}

#[test]
fn test_bucketer_sums_shards_across_ranks() {
    let shards = run_world(2, |rank, backend| {
        let group = ProcessGroup::world(2);
        let full = if rank == 0 {
            grad(&[1.0, 2.0, 3.0, 4.0])
        } else {
            grad(&[5.0, 6.0, 7.0, 8.0])
        };
        let mut bucketer = ReduceScatterBucketer::<&str, f32>::new(1024);
        let inputs = full.chunk(2, 0).unwrap();
        assert!(bucketer.reduce_scatter("w", inputs, &group, &backend).unwrap().is_empty());
        let done = bucketer.flush(&backend).unwrap();
        done[0].shard.data().to_vec()
    });
    assert_eq!(shards[0], vec![6.0, 8.0]);
    assert_eq!(shards[1], vec![10.0, 12.0]);
}

#[test]
fn test_model_averages_gradients_over_ranks() {
    let results = run_world(2, |rank, backend| {
        let w = ShardedParam::<f32>::new("w", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut model = model(backend, 2, vec![w], ZeroConfig::default());
        assert_eq!(model.gradient_divide_factors(), (2.0, 1.0));
        assert_eq!(model.local_param("w").unwrap().size(), 2);

        // every rank sees the full parameter during forward
        let full = model.forward(|p| Ok(p.tensor::<2>("w")?)).unwrap();
        assert_eq!(full.data(), &[1.0, 2.0, 3.0, 4.0]);

        let g = if rank == 0 {
            grad(&[1.0, 2.0, 3.0, 4.0])
        } else {
            grad(&[5.0, 6.0, 7.0, 8.0])
        };
        model.backward(|_| Ok(vec![("w".to_string(), g)])).unwrap();
        let reduced = model.local_grad("w").unwrap().data().to_vec();

        model.step(&Sgd::new(1.0)).unwrap();
        let state = model.full_state_dict().unwrap();
        (reduced, state["w"].data.data().to_vec())
    });

    // (sum over ranks) / world_size
    assert_eq!(results[0].0, vec![3.0, 4.0]);
    assert_eq!(results[1].0, vec![5.0, 6.0]);
    for (_, updated) in &results {
        assert_eq!(updated, &vec![-2.0, -2.0, -2.0, -2.0]);
    }
}

#[test]
fn test_padding_round_trip_over_four_ranks() {
    let original: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let expected = original.clone();
    let results = run_world(4, move |_, backend| {
        let w = ShardedParam::<f32>::new("w", vec![2, 5], original.clone()).unwrap();
        assert_eq!(w.num_padded(), 0);
        let mut model = model(backend, 4, vec![w], ZeroConfig::default());
        let local = model.local_param("w").unwrap().data().to_vec();
        assert_eq!(local.len(), 3);
        assert_eq!(model.param("w").unwrap().num_padded(), 2);

        let gathered = model.forward(|p| Ok(p.get("w")?.to_vec())).unwrap();
        model
            .backward(|_| Ok(vec![("w".to_string(), Tensor::ones([10]))]))
            .unwrap();
        let grad = model.local_grad("w").unwrap().data().to_vec();
        let state = model.full_state_dict().unwrap();
        (local, gathered, grad, state["w"].clone())
    });

    assert_eq!(results[0].0, vec![0.0, 1.0, 2.0]);
    assert_eq!(results[3].0, vec![9.0, 0.0, 0.0]);
    for (rank, (_, gathered, grad, state)) in results.iter().enumerate() {
        assert_eq!(gathered, &expected, "rank {rank}");
        assert_eq!(state.shape, vec![2, 5]);
        assert_eq!(state.data.data(), expected.as_slice());
        // padding slots receive no gradient
        let want = if rank == 3 { vec![1.0, 0.0, 0.0] } else { vec![1.0; 3] };
        assert_eq!(grad, &want, "rank {rank}");
    }
}

#[test]
fn test_no_sync_accumulation_matches_synced_passes() {
    let results = run_world(2, |rank, backend| {
        let scale = rank as f32 + 1.0;
        let init = vec![0.0; 4];
        let config = ZeroConfig {
            reduce_scatter_bucket_size_mb: 1,
            ..ZeroConfig::default()
        };
        let backend = Arc::new(backend);

        // two local passes without reduction, then one synced pass
        let mut deferred = ZeroModel::new(
            vec![(
                "root".to_string(),
                vec![ShardedParam::<f32>::new("w", vec![4], init.clone()).unwrap()],
            )],
            backend.clone(),
            ProcessGroup::world(2),
            config.clone(),
        )
        .unwrap();
        {
            let mut guard = deferred.no_sync();
            for _ in 0..2 {
                guard.forward(|_| Ok(())).unwrap();
                guard
                    .backward(|_| Ok(vec![("w".to_string(), grad(&[scale; 4]))]))
                    .unwrap();
            }
        }
        deferred.forward(|_| Ok(())).unwrap();
        deferred
            .backward(|_| Ok(vec![("w".to_string(), grad(&[scale; 4]))]))
            .unwrap();

        // three synced passes
        let mut eager = ZeroModel::new(
            vec![(
                "root".to_string(),
                vec![ShardedParam::<f32>::new("w", vec![4], init).unwrap()],
            )],
            backend,
            ProcessGroup::world(2),
            config,
        )
        .unwrap();
        for _ in 0..3 {
            eager.forward(|_| Ok(())).unwrap();
            eager
                .backward(|_| Ok(vec![("w".to_string(), grad(&[scale; 4]))]))
                .unwrap();
        }

        (
            deferred.local_grad("w").unwrap().data().to_vec(),
            eager.local_grad("w").unwrap().data().to_vec(),
        )
    });

    for (deferred, eager) in results {
        // 3 passes of (1 + 2) / 2
        assert_eq!(deferred, vec![4.5, 4.5]);
        assert_eq!(deferred, eager);
    }
}

#[test]
fn test_nested_units_share_one_backward() {
    let results = run_world(2, |_, backend| {
        let units = vec![
            (
                "root".to_string(),
                vec![ShardedParam::<f32>::new("head", vec![2], vec![1.0, 1.0]).unwrap()],
            ),
            (
                "layer0".to_string(),
                vec![ShardedParam::<f32>::new("layer0.w", vec![4], vec![2.0; 4]).unwrap()],
            ),
            (
                "layer1".to_string(),
                vec![ShardedParam::<f32>::new("layer1.w", vec![3], vec![3.0; 3]).unwrap()],
            ),
        ];
        let mut model =
            ZeroModel::new(units, Arc::new(backend), ProcessGroup::world(2), ZeroConfig::default())
                .unwrap();
        assert!(model.root().is_root());
        assert!(!model.units()[1].is_root());

        let total = model
            .forward(|p| {
                Ok(["head", "layer0.w", "layer1.w"]
                    .iter()
                    .map(|n| p.get(n).map(|v| v.iter().sum::<f32>()))
                    .sum::<shard_rs::zero::Result<f32>>()?)
            })
            .unwrap();
        assert_eq!(total, 2.0 + 8.0 + 9.0);
        // inner units dropped their full parameters after forward
        assert!(model.param("layer0.w").unwrap().full().is_null());

        model.pre_backward_hook().unwrap();
        model.grad_ready("layer1.w", Tensor::<f32, 1>::ones([3])).unwrap();
        model.grad_ready("layer0.w", Tensor::<f32, 1>::ones([4])).unwrap();
        assert_eq!(model.units()[2].training_state(), TrainingState::PostBackward);
        model.grad_ready("head", Tensor::<f32, 1>::ones([2])).unwrap();
        model.final_backward_hook().unwrap();
        assert!(model.units().iter().all(|u| u.training_state() == TrainingState::Idle));

        (
            model.local_grad("layer1.w").unwrap().data().to_vec(),
            model.backend().rank(),
        )
    });
    // 3 elements over 2 ranks: the second shard ends with one padding slot
    assert_eq!(results[0].0, vec![1.0, 1.0]);
    assert_eq!(results[1].0, vec![1.0, 0.0]);
}

#[test]
fn test_mixed_precision_across_ranks() {
    use half::f16;

    let results = run_world(2, |_, backend| {
        let w = ShardedParam::<f16>::new("w", vec![4], vec![0.5, 1.0, 1.5, 2.0]).unwrap();
        let mut model = ZeroModel::new(
            vec![("root".to_string(), vec![w])],
            Arc::new(backend),
            ProcessGroup::world(2),
            ZeroConfig::mixed(DType::F16),
        )
        .unwrap();
        let full: Vec<f32> = model
            .forward(|p| Ok(p.get("w")?.iter().map(|v| v.to_f32()).collect()))
            .unwrap();
        model
            .backward(|_| Ok(vec![("w".to_string(), Tensor::from_fn([4], |_| f16::from_f32(2.0)))]))
            .unwrap();
        // master shards stay fp32
        let grad = model.local_grad("w").unwrap().data().to_vec();
        (full, grad)
    });
    for (full, grad) in results {
        assert_eq!(full, vec![0.5, 1.0, 1.5, 2.0]);
        assert_eq!(grad, vec![2.0, 2.0]);
    }
}

#[test]
fn test_gradient_reduction_overlaps_backward() {
    // one shard of `big` overflows a 1 MiB bucket over 2 ranks, so it is reduced on its own
    const BIG: usize = 2 * (1024 * 1024 / 4 / 2) + 2;
    let barrier = Arc::new(std::sync::Barrier::new(2));

    let results = run_world(2, move |rank, backend| {
        let config = ZeroConfig {
            reduce_scatter_bucket_size_mb: 1,
            ..ZeroConfig::default()
        };
        let params = vec![
            ShardedParam::<f32>::new("big", vec![BIG], vec![0.0; BIG]).unwrap(),
            ShardedParam::<f32>::new("small", vec![4], vec![0.0; 4]).unwrap(),
        ];
        let mut model = model(backend, 2, params, config);
        model.forward(|_| Ok(())).unwrap();
        model.pre_backward_hook().unwrap();

        let scale = if rank == 0 { 1.0 } else { 3.0 };
        let deliver = |model: &mut ZeroModel<CpuBackend>| {
            model.grad_ready("big", Tensor::<f32, 1>::from_fn([BIG], |_| scale)).unwrap();
            model.grad_ready("small", grad(&[scale; 4])).unwrap();
        };
        if rank == 0 {
            // rank 1 has not sent anything yet, so neither reduction can have finished
            deliver(&mut model);
            assert_eq!(model.pending_reductions(), 2);
            assert!(model.local_grad("big").is_none());
            barrier.wait();
        } else {
            barrier.wait();
            deliver(&mut model);
        }
        model.final_backward_hook().unwrap();
        assert_eq!(model.pending_reductions(), 0);

        let big = model.local_grad("big").unwrap();
        assert_eq!(big.size(), BIG / 2);
        assert!(big.data().iter().all(|&v| v == 2.0));
        model.local_grad("small").unwrap().data().to_vec()
    });

    for small in results {
        assert_eq!(small, vec![2.0, 2.0]);
    }
}

#[test]
fn test_repeated_pre_backward_waits_for_reductions() {
    let results = run_world(2, |rank, backend| {
        let config = ZeroConfig {
            reshard_after_forward: true,
            disable_reshard_on_root: false,
            ..ZeroConfig::default()
        };
        let params = vec![
            ShardedParam::<f32>::new("a", vec![4], vec![1.0; 4]).unwrap(),
            ShardedParam::<f32>::new("b", vec![2], vec![1.0; 2]).unwrap(),
        ];
        let mut model = model(backend, 2, params, config);
        model.forward(|_| Ok(())).unwrap();
        model.pre_backward_hook().unwrap();
        model.grad_ready("a", grad(&[rank as f32; 4])).unwrap();
        // gathers `a` again; the pending reduction is drained first
        model.pre_backward_hook().unwrap();
        assert_eq!(model.pending_reductions(), 0);
        model.grad_ready("b", grad(&[2.0; 2])).unwrap();
        model.final_backward_hook().unwrap();
        (
            model.local_grad("a").unwrap().data().to_vec(),
            model.local_grad("b").unwrap().data().to_vec(),
        )
    });
    for (a, b) in results {
        assert_eq!(a, vec![0.5, 0.5]);
        assert_eq!(b, vec![2.0]);
    }
}
