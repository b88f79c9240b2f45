// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// `{CPU, GPU}`. Closed set: the scheduler has no notion of a third accelerator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DeviceType {
    #[strum(serialize = "CPU")]
    Cpu,
    #[strum(serialize = "GPU")]
    Gpu,
}

/// A physical accelerator identity, formatted as e.g. "GPU:0" or "CPU:0". Equality and ordering
/// are structural, which is what makes `DeviceSpec` usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    pub id: u16,
}

impl DeviceSpec {
    pub const fn new(device_type: DeviceType, id: u16) -> Self {
        Self { device_type, id }
    }

    pub const fn cpu(id: u16) -> Self {
        Self::new(DeviceType::Cpu, id)
    }

    pub const fn gpu(id: u16) -> Self {
        Self::new(DeviceType::Gpu, id)
    }

    pub fn is_gpu(&self) -> bool {
        self.device_type == DeviceType::Gpu
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device_type, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_like_cpu_or_gpu_colon_id() {
        assert_eq!(DeviceSpec::gpu(0).to_string(), "GPU:0");
        assert_eq!(DeviceSpec::cpu(1).to_string(), "CPU:1");
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(DeviceSpec::gpu(0), DeviceSpec::gpu(0));
        assert_ne!(DeviceSpec::gpu(0), DeviceSpec::gpu(1));
        assert_ne!(DeviceSpec::gpu(0), DeviceSpec::cpu(0));
    }
}