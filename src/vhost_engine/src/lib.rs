// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Userspace vhost engine.
//!
//! Drives split virtqueues living in guest memory on behalf of a guest: a privileged host
//! process installs the guest memory layout and ring addresses, and a dedicated worker thread
//! per device pops descriptor chains, hands them to a backend and publishes completions back
//! to the guest, deciding when the guest actually needs to be interrupted.

#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![allow(clippy::blanket_clippy_restriction_lints)]

/// Engine configuration.
pub mod config;
/// Device lifecycle and control surface.
pub mod device;
/// Feature bits understood by the engine.
pub mod features;
/// Logging and metrics.
pub mod logger;
/// Guest memory region table.
pub mod memory;
/// Guest-physical to host-virtual translation.
pub mod translate;
/// Utilities shared by the engine modules.
pub mod utils;
/// Split virtqueue processing.
pub mod vring;
/// Worker thread and work items.
pub mod worker;
/// Zero-copy completion tracking.
pub mod zerocopy;

#[doc(hidden)]
pub mod test_utils;

pub use crate::config::DeviceConfig;
pub use crate::device::{Device, DeviceState, VhostError, VringAddr, VringHandler};
pub use crate::features::Features;
pub use crate::memory::{AddressSpace, AddressSpaceRef, MemoryRegion, MemoryTable};
pub use crate::vring::{DescChain, Virtqueue, VirtqueueState, VringError};
