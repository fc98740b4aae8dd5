// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dirty page logging.
//!
//! The log is a bitmap in the owner's address space with one bit per guest page. Bits are set
//! atomically, and the log eventfd is signalled whenever a batch of writes dirtied a page that
//! was clean.

use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;
use vm_memory::{VolatileMemory, VolatileSlice};

use super::{VirtqueueState, VringError};
use crate::logger::IncMetric;
use crate::memory::{AddressSpace, VHOST_PAGE_SIZE};

/// A guest-physical range written by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Guest-physical start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

// Sets one bit of the log. Returns whether it was clear.
fn set_bit(mm: &dyn AddressSpace, addr: u64, bit: u64) -> Result<bool, VringError> {
    if !mm.access_ok(addr, 1) {
        return Err(VringError::LogWrite(addr));
    }
    // SAFETY: `addr` was just checked against the owner's address space, which outlives this
    // call.
    let slice = unsafe { VolatileSlice::new(addr as *mut u8, 1) };
    let byte = slice.get_atomic_ref::<AtomicU8>(0)?;
    let mask = 1u8 << bit;
    Ok(byte.fetch_or(mask, Ordering::SeqCst) & mask == 0)
}

/// Marks every page of `[gpa, gpa + len)` dirty in the log at `log_base`. Returns whether any
/// page was newly dirtied.
pub(crate) fn log_range(
    mm: &dyn AddressSpace,
    log_base: u64,
    gpa: u64,
    len: u64,
) -> Result<bool, VringError> {
    if len == 0 {
        return Ok(false);
    }
    let first = gpa / VHOST_PAGE_SIZE;
    let last = gpa.saturating_add(len - 1) / VHOST_PAGE_SIZE;
    let mut dirtied = false;
    for page in first..=last {
        let addr = log_base
            .checked_add(page / 8)
            .ok_or(VringError::LogWrite(log_base))?;
        dirtied |= set_bit(mm, addr, page % 8)?;
    }
    Ok(dirtied)
}

impl VirtqueueState {
    /// Logs the first `len` bytes written to the buffers described by `log`, as recorded in
    /// [`DescChain::log`](super::DescChain::log).
    pub fn log_write(&mut self, log: &[LogEntry], len: u64) -> Result<(), VringError> {
        let result = self.try_log_write(log, len);
        if let Err(err) = &result {
            self.shared.metrics.log_fails.inc();
            self.vq_err(err);
        }
        result
    }

    fn try_log_write(&self, log: &[LogEntry], len: u64) -> Result<(), VringError> {
        let mm = self.address_space()?;
        let mut remaining = len;
        let mut dirtied = false;
        for entry in log {
            if remaining == 0 {
                break;
            }
            let chunk = entry.len.min(remaining);
            dirtied |= log_range(&*mm, self.log_base, entry.addr, chunk)?;
            remaining -= chunk;
        }
        self.log_done(dirtied);
        Ok(())
    }

    /// Logs a write of `len` bytes at `offset` of the used ring. Returns whether a page was
    /// newly dirtied.
    pub(super) fn log_used_ring(
        &self,
        mm: &dyn AddressSpace,
        offset: u64,
        len: u64,
    ) -> Result<bool, VringError> {
        let gpa = self
            .log_addr
            .checked_add(offset)
            .ok_or(VringError::LogWrite(self.log_addr))?;
        log_range(mm, self.log_base, gpa, len)
    }

    /// Finishes a batch of log writes.
    pub(super) fn log_done(&self, dirtied: bool) {
        self.shared.metrics.log_writes.inc();
        if !dirtied {
            return;
        }
        if let Some(log_ctx) = &self.log_ctx {
            if let Err(err) = log_ctx.write(1) {
                debug!(
                    "vhost {}: vq {}: failed to signal log eventfd: {err}",
                    self.shared.id, self.index
                );
            }
        }
    }
}
