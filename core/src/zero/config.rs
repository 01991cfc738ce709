use super::{Result, ZeroError};
use crate::tensor::DType;
use serde::{Deserialize, Serialize};

/// Runtime options of a [`ZeroModel`](super::ZeroModel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZeroConfig {
    /// Free full parameters after forward and gather them again for backward.
    #[serde(default = "default_true")]
    pub reshard_after_forward: bool,
    /// Keep the root unit's full parameters between forward and backward.
    #[serde(default = "default_true")]
    pub disable_reshard_on_root: bool,
    /// Compute in `compute_dtype` while keeping fp32 master shards.
    #[serde(default)]
    pub mixed_precision: bool,
    /// Cast gradients to fp32 before reducing them.
    #[serde(default)]
    pub fp32_reduce_scatter: bool,
    #[serde(default = "default_bucket_size_mb")]
    pub reduce_scatter_bucket_size_mb: usize,
    #[serde(default = "default_compute_dtype")]
    pub compute_dtype: DType,
}

fn default_true() -> bool {
    true
}

fn default_bucket_size_mb() -> usize {
    25
}

fn default_compute_dtype() -> DType {
    DType::F32
}

impl Default for ZeroConfig {
    fn default() -> Self {
        Self {
            reshard_after_forward: default_true(),
            disable_reshard_on_root: default_true(),
            mixed_precision: false,
            fp32_reduce_scatter: false,
            reduce_scatter_bucket_size_mb: default_bucket_size_mb(),
            compute_dtype: default_compute_dtype(),
        }
    }
}

impl ZeroConfig {
    /// Mixed precision in `dtype`.
    pub fn mixed(dtype: DType) -> Self {
        Self {
            mixed_precision: true,
            compute_dtype: dtype,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ZeroError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn bucket_bytes(&self) -> usize {
        self.reduce_scatter_bucket_size_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<()> {
        if self.fp32_reduce_scatter && !self.mixed_precision {
            return Err(ZeroError::InvalidConfig(
                "fp32_reduce_scatter requires mixed_precision".into(),
            ));
        }
        if self.reduce_scatter_bucket_size_mb == 0 {
            return Err(ZeroError::InvalidConfig(
                "reduce_scatter_bucket_size_mb must be positive".into(),
            ));
        }
        match (self.mixed_precision, self.compute_dtype) {
            (true, DType::F16 | DType::BF16) | (false, DType::F32) => Ok(()),
            (mixed, dtype) => Err(ZeroError::InvalidConfig(format!(
                "compute dtype {dtype} is not supported with mixed_precision = {mixed}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ZeroConfig::from_toml_str("").unwrap();
        assert_eq!(config, ZeroConfig::default());
        assert_eq!(config.bucket_bytes(), 25 * 1024 * 1024);
    }

    #[test]
    fn test_fp32_reduce_scatter_needs_mixed_precision() {
        let err = ZeroConfig::from_toml_str("fp32_reduce_scatter = true").unwrap_err();
        assert!(err.to_string().contains("mixed_precision"));
    }

    #[test]
    fn test_dtype_combinations() {
        assert!(ZeroConfig::mixed(DType::BF16).validate().is_ok());
        assert!(ZeroConfig::mixed(DType::F32).validate().is_err());
        let config = ZeroConfig {
            compute_dtype: DType::F16,
            ..ZeroConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_bucket_rejected() {
        let config = ZeroConfig {
            reduce_scatter_bucket_size_mb: 0,
            ..ZeroConfig::default()
        };
        assert!(matches!(config.validate(), Err(ZeroError::InvalidConfig(_))));
    }
}
