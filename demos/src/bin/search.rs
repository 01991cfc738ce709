//! Enumerates sharding strategies for a graph described in TOML and prints the solver input.
//!
//! ```bash
//! cargo run -p shard-rs-demos --bin search -- --config demos/configs/mlp.toml
//! cargo run -p shard-rs-demos --bin search -- --config demos/configs/mlp.toml --shard-option full-shard
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use shard_rs::auto_parallel::ShardOption;
use shard_rs::config::AutoParallelConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShardOptionArg {
    Standard,
    Shard,
    FullShard,
    ShardLastAxis,
}

impl From<ShardOptionArg> for ShardOption {
    fn from(arg: ShardOptionArg) -> Self {
        match arg {
            ShardOptionArg::Standard => ShardOption::Standard,
            ShardOptionArg::Shard => ShardOption::Shard,
            ShardOptionArg::FullShard => ShardOption::FullShard,
            ShardOptionArg::ShardLastAxis => ShardOption::ShardLastAxis,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "search")]
#[command(about = "Enumerate and price sharding strategies for every node of a graph")]
struct Args {
    /// Graph and mesh description
    #[arg(short, long)]
    config: PathBuf,

    /// Override the config's shard option
    #[arg(long, value_enum)]
    shard_option: Option<ShardOptionArg>,

    /// Write the solver input here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AutoParallelConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(option) = args.shard_option {
        config.shard_option = option.into();
        config.validate()?;
    }

    let graph = config.build_graph()?;
    let strategies = config.constructor()?.build_strategies_and_cost(&graph)?;
    for name in strategies.nodes() {
        let count = strategies.get(name).map_or(0, |s| s.len());
        info!(node = %name, strategies = count, "enumerated");
    }

    let json = strategies.to_solver_input()?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "wrote solver input");
        }
        None => println!("{json}"),
    }
    Ok(())
}
