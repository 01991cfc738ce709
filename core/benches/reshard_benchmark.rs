use criterion::{Criterion, criterion_group, criterion_main};
use shard_rs::auto_parallel::{Graph, Node, NodeOp, OpKind, StrategiesConstructor, TensorMeta};
use shard_rs::device_mesh::DeviceMesh;
use shard_rs::sharding::{ShapeConsistencyManager, ShardingSpec};
use shard_rs::tensor::Tensor;
use shard_rs::zero::chunk_and_pad;
use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;

fn benchmark_shape_consistency(c: &mut Criterion) {
    let mut group = c.benchmark_group("shape_consistency");
    let mesh = Arc::new(DeviceMesh::logical(vec![2, 4]).unwrap());
    let shape = vec![1024, 1024];
    let source =
        ShardingSpec::new(mesh.clone(), shape.clone(), BTreeMap::from([(0, vec![0, 1])])).unwrap();
    let target =
        ShardingSpec::new(mesh, shape, BTreeMap::from([(0, vec![1]), (1, vec![0])])).unwrap();

    group.bench_function("S01R_to_S1S0_cold", |b| {
        b.iter(|| {
            let manager = ShapeConsistencyManager::new();
            black_box(manager.shape_consistency(&source, &target).unwrap())
        })
    });

    // repeated queries hit the plan cache
    let manager = ShapeConsistencyManager::new();
    group.bench_function("S01R_to_S1S0_cached", |b| {
        b.iter(|| black_box(manager.shape_consistency(&source, &target).unwrap()))
    });
    group.finish();
}

fn benchmark_chunk_and_pad(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_and_pad");
    for &numel in &[1 << 12, 1 << 16, (1 << 20) + 3] {
        let t = Tensor::<f32, 1>::ones([numel]);
        group.bench_function(format!("{numel}_over_8"), |b| {
            b.iter(|| chunk_and_pad(black_box(&t), 8).unwrap())
        });
    }
    group.finish();
}

fn mlp(layers: usize) -> Graph {
    let mut nodes = vec![Node::placeholder("x", TensorMeta::f32(vec![64, 256]))];
    let mut prev = "x".to_string();
    for i in 0..layers {
        let name = format!("fc{i}");
        nodes.push(
            Node::new(&name, NodeOp::CallModule, OpKind::Linear)
                .with_args(&[prev.as_str()])
                .with_param("weight", TensorMeta::f32(vec![256, 256]))
                .with_param("bias", TensorMeta::f32(vec![256]))
                .with_meta(TensorMeta::f32(vec![64, 256])),
        );
        prev = name;
    }
    nodes.push(Node::output(&[prev.as_str()]));
    Graph::new(nodes).unwrap()
}

fn benchmark_strategy_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_search");
    let graph = mlp(8);
    let mesh = Arc::new(DeviceMesh::logical(vec![2, 2]).unwrap());
    group.bench_function("mlp8_on_2x2", |b| {
        b.iter(|| {
            StrategiesConstructor::new(mesh.clone())
                .build_strategies_and_cost(black_box(&graph))
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_shape_consistency,
    benchmark_chunk_and_pad,
    benchmark_strategy_search
);
criterion_main!(benches);
