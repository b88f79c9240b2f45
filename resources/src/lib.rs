// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! The data model shared by every layer of the scheduler: device identity, resource kinds, and
//! the value types (`Resources`, `ResStats`) used to describe how much of each a task or
//! iteration needs.

mod device;
mod resource_map;
mod stats;
mod ticket;

pub use device::{DeviceSpec, DeviceType};
pub use resource_map::{Resources, ResourcesBuilder};
pub use stats::ResStats;
pub use ticket::Ticket;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The closed set of resource kinds the monitor accounts for. `EXCLUSIVE` models resources that
/// cannot be shared between tickets at all (e.g. a device reserved for one session only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum ResourceType {
    #[strum(serialize = "compute")]
    Compute,
    #[strum(serialize = "memory")]
    Memory,
    #[strum(serialize = "gpu_stream")]
    GpuStream,
    #[strum(serialize = "exclusive")]
    Exclusive,
}

/// A `(ResourceType, DeviceSpec)` pair identifying one pool in the monitor's capacity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTag {
    pub kind: ResourceType,
    pub device: DeviceSpec,
}

impl ResourceTag {
    pub fn new(kind: ResourceType, device: DeviceSpec) -> Self {
        Self { kind, device }
    }

    pub fn memory(device: DeviceSpec) -> Self {
        Self::new(ResourceType::Memory, device)
    }

    pub fn gpu_stream(device: DeviceSpec) -> Self {
        Self::new(ResourceType::GpuStream, device)
    }
}

impl std::fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device, self.kind)
    }
}
