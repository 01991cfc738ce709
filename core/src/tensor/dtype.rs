//! Element types and precisions.
//!
//! Resharding costs are byte volumes, so every tensor operand carries a [`DType`] whose
//! element size converts element counts into bytes. ZeRO mixed precision keeps fp32 master
//! shards and computes in a lower precision described by [`ComputeElem`].

use crate::tensor::TensorElem;
use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar type of a tensor operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::Bool => 1,
        }
    }

    pub const fn is_floating_point(self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A floating-point precision that parameters can be computed in.
///
/// Conversions go through `f32`, which is the precision of the master shards.
pub trait ComputeElem: TensorElem + 'static {
    const DTYPE: DType;

    fn from_master(v: f32) -> Self;
    fn to_master(self) -> f32;
}

impl ComputeElem for f32 {
    const DTYPE: DType = DType::F32;

    fn from_master(v: f32) -> Self {
        v
    }
    fn to_master(self) -> f32 {
        self
    }
}

impl ComputeElem for f16 {
    const DTYPE: DType = DType::F16;

    fn from_master(v: f32) -> Self {
        f16::from_f32(v)
    }
    fn to_master(self) -> f32 {
        f16::to_f32(self)
    }
}

impl ComputeElem for bf16 {
    const DTYPE: DType = DType::BF16;

    fn from_master(v: f32) -> Self {
        bf16::from_f32(v)
    }
    fn to_master(self) -> f32 {
        bf16::to_f32(self)
    }
}
