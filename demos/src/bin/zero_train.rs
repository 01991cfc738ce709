//! Fits a small linear regression with ZeRO-sharded parameters, one thread per rank.
//!
//! Every rank draws its own batch, gathers the full weights for forward and backward, and keeps
//! only its shard of the weights and of the averaged gradient.
//!
//! ```bash
//! cargo run -p shard-rs-demos --bin zero_train -- --world-size 4 --steps 50
//! cargo run -p shard-rs-demos --bin zero_train -- --config demos/configs/zero.toml --accumulate 2
//! ```

use anyhow::{Context, Result, anyhow, ensure};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shard_rs::checkpoint::{ParamGroup, save_sharded_checkpoint};
use shard_rs::distributed::{CollectiveBackend, CpuBackend, ProcessGroup};
use shard_rs::optim::Sgd;
use shard_rs::tensor::Tensor;
use shard_rs::zero::{FullParams, ShardedParam, ZeroConfig, ZeroModel};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

const FEATURES: usize = 6;
const BATCH: usize = 8;
const TRUE_WEIGHT: [f32; FEATURES] = [1.0, -2.0, 0.5, 3.0, 0.0, -1.5];
const TRUE_BIAS: f32 = 0.25;

#[derive(Parser, Debug, Clone)]
#[command(name = "zero_train")]
#[command(about = "Train a toy model with ZeRO parameter sharding on CPU threads")]
struct Args {
    /// Number of ranks
    #[arg(short, long, default_value_t = 2)]
    world_size: usize,

    /// Optimizer steps
    #[arg(short, long, default_value_t = 100)]
    steps: usize,

    #[arg(long, default_value_t = 0.05)]
    lr: f32,

    /// Micro-batches per step; all but the last run under no_sync
    #[arg(long, default_value_t = 1)]
    accumulate: usize,

    /// Seed for the per-rank data generators
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// ZeRO options in TOML
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a sharded checkpoint here after training
    #[arg(long)]
    save: Option<PathBuf>,
}

/// Noise-free samples of the target function, drawn from this rank's generator.
fn batch(rng: &mut StdRng) -> (Vec<[f32; FEATURES]>, Vec<f32>) {
    let xs: Vec<[f32; FEATURES]> = (0..BATCH)
        .map(|_| std::array::from_fn(|_| rng.random_range(-1.0..1.0)))
        .collect();
    let ys = xs.iter().map(|x| predict(&TRUE_WEIGHT, TRUE_BIAS, x)).collect();
    (xs, ys)
}

fn predict(w: &[f32], b: f32, x: &[f32; FEATURES]) -> f32 {
    w.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + b
}

fn mse(params: &FullParams<'_, f32>, xs: &[[f32; FEATURES]], ys: &[f32]) -> shard_rs::zero::Result<f32> {
    let (w, b) = (params.get("weight")?, params.get("bias")?[0]);
    let sum: f32 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (predict(w, b, x) - y).powi(2))
        .sum();
    Ok(sum / xs.len() as f32)
}

fn mse_grads(
    params: &FullParams<'_, f32>,
    xs: &[[f32; FEATURES]],
    ys: &[f32],
) -> shard_rs::zero::Result<Vec<(String, Tensor<f32, 1>)>> {
    let (w, b) = (params.get("weight")?, params.get("bias")?[0]);
    let scale = 2.0 / xs.len() as f32;
    let mut gw = [0.0f32; FEATURES];
    let mut gb = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let err = predict(w, b, x) - y;
        for (g, xi) in gw.iter_mut().zip(x) {
            *g += scale * err * xi;
        }
        gb += scale * err;
    }
    Ok(vec![
        ("weight".to_string(), Tensor::new(gw.to_vec(), [FEATURES])?),
        ("bias".to_string(), Tensor::new(vec![gb], [1])?),
    ])
}

fn train_rank(args: Args, config: ZeroConfig, backend: CpuBackend) -> Result<f32> {
    let rank = backend.rank();
    let params = vec![
        ShardedParam::<f32>::new("weight", vec![FEATURES], vec![0.0; FEATURES])?,
        ShardedParam::<f32>::new("bias", vec![1], vec![0.0])?,
    ];
    let mut model = ZeroModel::new(
        vec![("root".to_string(), params)],
        Arc::new(backend),
        ProcessGroup::world(args.world_size),
        config,
    )?;
    let optimizer = Sgd::new(args.lr);
    let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(rank as u64));

    let mut loss = f32::NAN;
    for step in 0..args.steps {
        {
            let mut guard = model.no_sync();
            for _ in 1..args.accumulate {
                let (xs, ys) = batch(&mut rng);
                guard.forward(|p| mse(p, &xs, &ys))?;
                guard.backward(|p| mse_grads(p, &xs, &ys))?;
            }
        }
        let (xs, ys) = batch(&mut rng);
        loss = model.forward(|p| mse(p, &xs, &ys))?;
        model.backward(|p| mse_grads(p, &xs, &ys))?;
        model.step(&optimizer)?;
        if rank == 0 && step % 10 == 0 {
            info!(step, loss, "train");
        }
        debug!(rank, step, loss, "local loss");
    }

    let state = model.full_state_dict()?;
    if let Some(dir) = &args.save {
        let groups = [ParamGroup {
            lr: args.lr,
            weight_decay: 0.0,
            params: state.keys().cloned().collect(),
        }];
        save_sharded_checkpoint(dir, &state, &groups, rank == 0)?;
    }
    if rank == 0 {
        info!(weight = ?state["weight"].data.data(), bias = ?state["bias"].data.data(), "learned");
    }
    Ok(loss)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    ensure!(args.world_size > 0, "--world-size must be positive");
    ensure!(args.accumulate > 0, "--accumulate must be positive");
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ZeroConfig::from_toml_str(&text)?
        }
        None => ZeroConfig::default(),
    };
    info!(world_size = args.world_size, ?config, "starting");

    let handles: Vec<_> = CpuBackend::world(args.world_size)
        .into_iter()
        .map(|backend| {
            let args = args.clone();
            let config = config.clone();
            thread::spawn(move || train_rank(args, config, backend))
        })
        .collect();

    let mut losses = Vec::with_capacity(handles.len());
    for (rank, handle) in handles.into_iter().enumerate() {
        let loss = handle
            .join()
            .map_err(|_| anyhow!("rank {rank} panicked"))??;
        losses.push(loss);
    }
    let mean = losses.iter().sum::<f32>() / losses.len() as f32;
    info!(final_loss = mean, "done");
    Ok(())
}
