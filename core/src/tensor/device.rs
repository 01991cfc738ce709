//! Device abstraction for Tensor storage.
//!
//! A "Device" is where a rank's tensors live. In `shard-rs` every rank is simulated by one host
//! thread, so [`Cpu`] is the only device; the trait keeps the storage type pluggable so a
//! device-resident buffer could slot in without touching the sharding logic.

use crate::tensor::{Storage, TensorElem};
use std::fmt::Debug;

/// A trait representing the underlying storage device for a Tensor.
pub trait Device: Clone + Debug + PartialEq + Send + Sync {
    /// The type of storage used by this device.
    type Storage<T>: Storage<T>
    where
        T: TensorElem;

    /// Returns the name of the device.
    ///
    /// ```rust
    /// use shard_rs::tensor::{Cpu, Device};
    /// assert_eq!(Cpu.name(), "CPU");
    /// ```
    fn name(&self) -> &'static str;
}

/// A CPU Device.
///
/// Data is stored in system RAM using `Vec<T>`. Data-movement kernels run on `rayon`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cpu;

impl Device for Cpu {
    type Storage<T>
        = Vec<T>
    where
        T: TensorElem;

    fn name(&self) -> &'static str {
        "CPU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device_traits() {
        let device = Cpu;
        assert_eq!(device, device.clone());
        assert_eq!(format!("{:?}", device), "Cpu");
        assert_eq!(device.name(), "CPU");
    }
}
