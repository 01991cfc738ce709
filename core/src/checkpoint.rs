//! Sharded checkpoints in the `safetensors` format.
//!
//! A checkpoint directory holds:
//!
//! * `model.index.json`: maps every parameter name to the shard file that stores it,
//! * `param_groups.json`: the optimizer's parameter groups,
//! * one or more `model-XXXXX-of-YYYYY.safetensors` shard files.
//!
//! Tensors are stored unpadded with their original shape. Loading on a different world size
//! goes through [`redistribute`], which pads and splits a flattened tensor for the current
//! layout.

use crate::tensor::{Tensor, TensorError};
use crate::zero::chunk_and_pad;
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const INDEX_FILE: &str = "model.index.json";
pub const PARAM_GROUPS_FILE: &str = "param_groups.json";

/// Shards never grow past this many bytes unless a single tensor is larger.
pub const DEFAULT_MAX_SHARD_BYTES: usize = 1 << 30;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("tensor '{name}' listed in the index is missing from '{file}'")]
    MissingTensor { name: String, file: String },
    #[error("tensor '{name}' has dtype {dtype}, only f32 checkpoints are supported")]
    UnsupportedDtype { name: String, dtype: String },
    #[error("rank {rank} is out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
    #[error("max shard size must be positive")]
    InvalidShardSize,
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// One unpadded parameter: the original shape and its flattened values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Tensor<f32, 1>,
}

impl ParamTensor {
    pub fn numel(&self) -> usize {
        self.data.size()
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        self.data.data().iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

pub type StateDict = BTreeMap<String, ParamTensor>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub lr: f32,
    #[serde(default)]
    pub weight_decay: f32,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub total_size: usize,
}

/// Contents of `model.index.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

impl CheckpointIndex {
    pub fn shard_files(&self) -> BTreeSet<&str> {
        self.weight_map.values().map(String::as_str).collect()
    }
}

pub fn shard_file_name(index: usize, total: usize) -> String {
    format!("model-{:05}-of-{:05}.safetensors", index + 1, total)
}

/// Saves `state` with the default shard size. See [`save_sharded_checkpoint_with`].
pub fn save_sharded_checkpoint<P: AsRef<Path>>(
    dir: P,
    state: &StateDict,
    param_groups: &[ParamGroup],
    coordinator: bool,
) -> Result<Option<CheckpointIndex>> {
    save_sharded_checkpoint_with(dir, state, param_groups, coordinator, DEFAULT_MAX_SHARD_BYTES)
}

/// Writes a sharded checkpoint to `dir`.
///
/// Every rank may call this with the same gathered state dict; only the coordinator touches
/// the filesystem, the others return `Ok(None)`. Parameters are packed into shard files in name
/// order, starting a new file whenever the next tensor would push the current one past
/// `max_shard_bytes`.
pub fn save_sharded_checkpoint_with<P: AsRef<Path>>(
    dir: P,
    state: &StateDict,
    param_groups: &[ParamGroup],
    coordinator: bool,
    max_shard_bytes: usize,
) -> Result<Option<CheckpointIndex>> {
    if max_shard_bytes == 0 {
        return Err(CheckpointError::InvalidShardSize);
    }
    if !coordinator {
        debug!("not the coordinating rank, skipping checkpoint write");
        return Ok(None);
    }
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let mut shards: Vec<Vec<(&String, &ParamTensor)>> = Vec::new();
    let mut current_bytes = 0;
    for (name, param) in state {
        let bytes = param.numel() * std::mem::size_of::<f32>();
        match shards.last_mut() {
            Some(shard) if current_bytes + bytes <= max_shard_bytes => {
                shard.push((name, param));
                current_bytes += bytes;
            }
            _ => {
                shards.push(vec![(name, param)]);
                current_bytes = bytes;
            }
        }
    }

    let mut index = CheckpointIndex::default();
    let total = shards.len();
    for (i, shard) in shards.iter().enumerate() {
        let file = shard_file_name(i, total);
        let buffers: Vec<(&String, &ParamTensor, Vec<u8>)> = shard
            .iter()
            .map(|(name, param)| (*name, *param, param.to_le_bytes()))
            .collect();
        let mut views = BTreeMap::new();
        for (name, param, bytes) in &buffers {
            views.insert(
                name.as_str(),
                TensorView::new(Dtype::F32, param.shape.clone(), bytes)?,
            );
            index.weight_map.insert(name.to_string(), file.clone());
            index.metadata.total_size += bytes.len();
        }
        safetensors::serialize_to_file(views, &None, &dir.join(&file))?;
        debug!(file = %file, tensors = buffers.len(), "wrote checkpoint shard");
    }

    fs::write(dir.join(INDEX_FILE), serde_json::to_string_pretty(&index)?)?;
    fs::write(
        dir.join(PARAM_GROUPS_FILE),
        serde_json::to_string_pretty(param_groups)?,
    )?;
    info!(
        dir = %dir.display(),
        shards = total,
        params = state.len(),
        bytes = index.metadata.total_size,
        "saved sharded checkpoint"
    );
    Ok(Some(index))
}

/// Reads a checkpoint written by [`save_sharded_checkpoint`].
pub fn load_sharded_checkpoint<P: AsRef<Path>>(dir: P) -> Result<(StateDict, Vec<ParamGroup>)> {
    let dir = dir.as_ref();
    let index: CheckpointIndex = serde_json::from_slice(&fs::read(dir.join(INDEX_FILE))?)?;
    let param_groups: Vec<ParamGroup> =
        serde_json::from_slice(&fs::read(dir.join(PARAM_GROUPS_FILE))?)?;

    let mut state = StateDict::new();
    for file in index.shard_files() {
        let handle = File::open(dir.join(file))?;
        // SAFETY: shard files are written once by the coordinator and not modified while loading.
        let mmap = unsafe { Mmap::map(&handle)? };
        let tensors = SafeTensors::deserialize(&mmap)?;
        let wanted = index
            .weight_map
            .iter()
            .filter(|(_, f)| f.as_str() == file)
            .map(|(name, _)| name);
        for name in wanted {
            let view = tensors
                .tensor(name)
                .map_err(|_| CheckpointError::MissingTensor {
                    name: name.clone(),
                    file: file.to_string(),
                })?;
            if view.dtype() != Dtype::F32 {
                return Err(CheckpointError::UnsupportedDtype {
                    name: name.clone(),
                    dtype: format!("{:?}", view.dtype()),
                });
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let len = values.len();
            state.insert(
                name.clone(),
                ParamTensor {
                    shape: view.shape().to_vec(),
                    data: Tensor::new(values, [len])?,
                },
            );
        }
    }
    info!(dir = %dir.display(), params = state.len(), "loaded sharded checkpoint");
    Ok((state, param_groups))
}

/// Returns `rank`'s padded chunk of `flat` when split over `world_size` ranks.
pub fn redistribute(flat: &Tensor<f32, 1>, world_size: usize, rank: usize) -> Result<Tensor<f32, 1>> {
    if world_size == 0 || rank >= world_size {
        return Err(CheckpointError::InvalidRank { rank, world_size });
    }
    let mut chunks = chunk_and_pad(flat, world_size)?;
    Ok(chunks.swap_remove(rank))
}
