// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest memory layout as seen by the engine.
//!
//! A [`MemoryTable`] maps guest-physical ranges onto host-virtual ranges of the owner's address
//! space. Tables are immutable: `SetMemTable` builds a new one and publishes it through a
//! [`MemoryTableCell`], which blocks the writer until every reader of the previous table has
//! dropped its reference. Teardown publishes an empty table without waiting.

use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use vm_memory::{Address, GuestMemory, GuestMemoryRegion, MemoryRegionAddress};

use crate::utils::{lock, wait};

/// Guest memory backed by anonymous or file mappings of the current process.
pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

/// Granularity of the dirty page log.
pub const VHOST_PAGE_SIZE: u64 = 0x1000;

/// Errors related to the memory table.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum MemoryError {
    /// Memory region at guest address {0:#x} wraps around the address space
    RegionOverflow(u64),
    /// Memory region at guest address {0:#x} is not accessible by the owner
    RegionAccess(u64),
    /// Failed to get the host address of the guest region at {0:#x}
    HostAddress(u64),
}

/// Address space of the process owning a device.
///
/// # Safety
///
/// Implementors must only report ranges as accessible if they stay mapped readable and
/// writable for as long as the implementor is alive.
pub unsafe trait AddressSpace: Debug + Send + Sync {
    /// Returns whether `[addr, addr + len)` is readable and writable.
    fn access_ok(&self, addr: u64, len: u64) -> bool;
}

/// Shared handle to an address space. Owner identity is handle identity.
pub type AddressSpaceRef = Arc<dyn AddressSpace>;

/// Returns whether `a` and `b` refer to the same address space.
pub fn same_address_space(a: &AddressSpaceRef, b: &AddressSpaceRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

// SAFETY: every region of a `GuestMemoryMmap` is a mapping owned by the collection, and it is
// only unmapped when the collection is dropped.
unsafe impl AddressSpace for GuestMemoryMmap {
    fn access_ok(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        self.iter().any(|region| {
            region
                .get_host_address(MemoryRegionAddress(0))
                .is_ok_and(|host| {
                    let start = host as u64;
                    start <= addr && end <= start + region.len()
                })
        })
    }
}

/// One guest-physical to host-virtual mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryRegion {
    /// First guest-physical address of the region.
    pub guest_phys_addr: u64,
    /// Size of the region in bytes.
    pub memory_size: u64,
    /// Host-virtual address `guest_phys_addr` maps to.
    pub userspace_addr: u64,
}

impl MemoryRegion {
    /// Returns whether `gpa` falls inside the region.
    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.guest_phys_addr && gpa - self.guest_phys_addr < self.memory_size
    }
}

/// Describes every region of `mem` the way a frontend reports its memory to `SetMemTable`.
pub fn regions_from_guest_memory(mem: &GuestMemoryMmap) -> Result<Vec<MemoryRegion>, MemoryError> {
    mem.iter()
        .map(|region| {
            let guest_phys_addr = region.start_addr().raw_value();
            let host = region
                .get_host_address(MemoryRegionAddress(0))
                .map_err(|_| MemoryError::HostAddress(guest_phys_addr))?;
            Ok(MemoryRegion {
                guest_phys_addr,
                memory_size: region.len(),
                userspace_addr: host as u64,
            })
        })
        .collect()
}

/// Returns whether the dirty bitmap at `log_base` is writable for every page of
/// `[gpa, gpa + size)`.
pub fn log_access_ok(mm: &dyn AddressSpace, log_base: u64, gpa: u64, size: u64) -> bool {
    if size == 0 {
        return true;
    }
    let Some(last) = gpa.checked_add(size - 1) else {
        return false;
    };
    let first_byte = gpa / VHOST_PAGE_SIZE / 8;
    let last_byte = last / VHOST_PAGE_SIZE / 8;
    log_base
        .checked_add(first_byte)
        .is_some_and(|addr| mm.access_ok(addr, last_byte - first_byte + 1))
}

#[derive(Debug, Default)]
struct GracePeriod {
    reclaimed: Mutex<bool>,
    cond: Condvar,
}

impl GracePeriod {
    fn complete(&self) {
        *lock(&self.reclaimed) = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut reclaimed = lock(&self.reclaimed);
        while !*reclaimed {
            reclaimed = wait(&self.cond, reclaimed);
        }
    }
}

/// Immutable snapshot of the guest memory layout.
///
/// Holding a table keeps the owner's address space, and so every host span translated through
/// the table, alive.
#[derive(Debug)]
pub struct MemoryTable {
    // Sorted by guest_phys_addr.
    regions: Vec<MemoryRegion>,
    mm: Option<AddressSpaceRef>,
    grace: Arc<GracePeriod>,
}

impl MemoryTable {
    /// Creates a table with no regions. Every translation through it faults.
    pub fn empty() -> Self {
        MemoryTable {
            regions: Vec::new(),
            mm: None,
            grace: Arc::default(),
        }
    }

    /// Creates a table from `regions`, checking that each of them is accessible in `mm`.
    ///
    /// Regions are expected not to overlap in guest-physical space.
    pub fn new(mut regions: Vec<MemoryRegion>, mm: AddressSpaceRef) -> Result<Self, MemoryError> {
        for region in &regions {
            if region
                .guest_phys_addr
                .checked_add(region.memory_size)
                .is_none()
                || region.userspace_addr.checked_add(region.memory_size).is_none()
            {
                return Err(MemoryError::RegionOverflow(region.guest_phys_addr));
            }
            if !mm.access_ok(region.userspace_addr, region.memory_size) {
                return Err(MemoryError::RegionAccess(region.guest_phys_addr));
            }
        }
        regions.sort_unstable_by_key(|region| region.guest_phys_addr);
        Ok(MemoryTable {
            regions,
            mm: Some(mm),
            grace: Arc::default(),
        })
    }

    /// Regions of the table, sorted by guest-physical address.
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Address space the table was validated against.
    pub fn address_space(&self) -> Option<&AddressSpaceRef> {
        self.mm.as_ref()
    }

    /// Finds the region containing `gpa`.
    pub fn find_region(&self, gpa: u64) -> Option<&MemoryRegion> {
        let idx = self
            .regions
            .partition_point(|region| region.guest_phys_addr <= gpa);
        idx.checked_sub(1)
            .and_then(|i| self.regions.get(i))
            .filter(|region| region.contains(gpa))
    }

    /// Returns whether the dirty bitmap at `log_base` covers every region of the table.
    pub fn log_access_ok(&self, mm: &dyn AddressSpace, log_base: u64) -> bool {
        self.regions.iter().all(|region| {
            log_access_ok(mm, log_base, region.guest_phys_addr, region.memory_size)
        })
    }
}

impl Drop for MemoryTable {
    fn drop(&mut self) {
        self.grace.complete();
    }
}

/// Publication point of the current memory table.
///
/// Readers take a reference with [`MemoryTableCell::load`] and never block on writers beyond
/// the pointer copy.
#[derive(Debug)]
pub struct MemoryTableCell {
    current: RwLock<Arc<MemoryTable>>,
}

impl MemoryTableCell {
    /// Creates a cell publishing `table`.
    pub fn new(table: MemoryTable) -> Self {
        MemoryTableCell {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Returns the current table.
    pub fn load(&self) -> Arc<MemoryTable> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Publishes `table`, then blocks until the previous table has been reclaimed.
    ///
    /// Must not be called by a thread that holds a reference to the current table.
    pub fn replace(&self, table: MemoryTable) {
        let grace = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let old = std::mem::replace(&mut *current, Arc::new(table));
            Arc::clone(&old.grace)
        };
        grace.wait();
    }

    /// Publishes `table` without waiting. Readers of the previous table keep it, and the
    /// address space it holds, alive until they drop it.
    pub fn store(&self, table: MemoryTable) {
        let old = std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(table),
        );
        drop(old);
    }
}
