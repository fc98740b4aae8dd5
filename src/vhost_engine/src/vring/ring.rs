// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Split virtqueue wire layout.

use std::num::Wrapping;
use std::sync::atomic::Ordering;

use vm_memory::{ByteValued, Bytes, VolatileSlice};

use super::VringError;
use crate::memory::AddressSpace;
use crate::utils::u64_to_usize;

/// This marks a buffer as continuing via the next field.
pub const VRING_DESC_F_NEXT: u16 = 0x1;
/// This marks a buffer as device write-only (otherwise device read-only).
pub const VRING_DESC_F_WRITE: u16 = 0x2;
/// This means the buffer contains a list of buffer descriptors.
pub const VRING_DESC_F_INDIRECT: u16 = 0x4;
/// Set by the device in the used ring flags: don't kick me.
pub const VRING_USED_F_NO_NOTIFY: u16 = 0x1;
/// Set by the driver in the avail ring flags: don't interrupt me.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 0x1;
/// `SetAddr` flag bit requesting used ring writes to be logged.
pub const VHOST_VRING_F_LOG: u32 = 0x1;

/// Size of a descriptor table entry.
pub const DESC_SIZE: u64 = 16;
/// Size of a used ring element.
pub const USED_ELEM_SIZE: u64 = 8;

/// Required alignment of the descriptor table.
pub const DESC_ALIGN: u64 = 16;
/// Required alignment of the avail ring.
pub const AVAIL_ALIGN: u64 = 2;
/// Required alignment of the used ring.
pub const USED_ALIGN: u64 = 4;

/// A virtio descriptor table entry.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest-physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// `VRING_DESC_F_*` flags.
    pub flags: u16,
    /// Index of the next descriptor when `VRING_DESC_F_NEXT` is set.
    pub next: u16,
}

// SAFETY: `Descriptor` is a POD and contains no padding.
unsafe impl ByteValued for Descriptor {}

impl Descriptor {
    /// Whether the chain continues through `next`.
    pub fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }

    /// Whether the device writes to this buffer.
    pub fn is_write_only(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }

    /// Whether the buffer is an indirect descriptor table.
    pub fn is_indirect(&self) -> bool {
        self.flags & VRING_DESC_F_INDIRECT != 0
    }
}

/// A virtio used ring element.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsedElement {
    /// Head index of the completed chain.
    pub id: u32,
    /// Number of bytes written into the chain's buffers.
    pub len: u32,
}

// SAFETY: `UsedElement` is a POD and contains no padding.
unsafe impl ByteValued for UsedElement {}

/// Ring addresses as passed to `SetAddr`.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VringAddr {
    /// `VHOST_VRING_F_*` flags.
    pub flags: u32,
    /// Host-virtual address of the descriptor table.
    pub desc_user_addr: u64,
    /// Host-virtual address of the used ring.
    pub used_user_addr: u64,
    /// Host-virtual address of the avail ring.
    pub avail_user_addr: u64,
    /// Guest-physical address of the used ring, for dirty logging.
    pub log_guest_addr: u64,
}

/// Byte sizes of the descriptor table, avail ring and used ring for a ring of `num` entries,
/// including the event index fields.
pub fn ring_sizes(num: u16) -> (u64, u64, u64) {
    let num = u64::from(num);
    (DESC_SIZE * num, 6 + 2 * num, 6 + USED_ELEM_SIZE * num)
}

/// Bounds-checked view of the three rings of a virtqueue.
#[derive(Debug)]
pub(crate) struct RingView<'a> {
    desc: VolatileSlice<'a>,
    avail: VolatileSlice<'a>,
    used: VolatileSlice<'a>,
    num: u16,
}

impl<'a> RingView<'a> {
    /// Checks the rings described by `addr` against `mm` and builds views over them.
    pub(crate) fn new(
        mm: &'a dyn AddressSpace,
        addr: &VringAddr,
        num: u16,
    ) -> Result<Self, VringError> {
        let (desc_size, avail_size, used_size) = ring_sizes(num);
        for (start, len) in [
            (addr.desc_user_addr, desc_size),
            (addr.avail_user_addr, avail_size),
            (addr.used_user_addr, used_size),
        ] {
            if !mm.access_ok(start, len) {
                return Err(VringError::RingAccess { addr: start, len });
            }
        }
        // SAFETY: the ranges were just checked against `mm`, which stays mapped for the
        // lifetime `'a` of the borrow.
        let view = unsafe {
            RingView {
                desc: VolatileSlice::new(addr.desc_user_addr as *mut u8, u64_to_usize(desc_size)),
                avail: VolatileSlice::new(
                    addr.avail_user_addr as *mut u8,
                    u64_to_usize(avail_size),
                ),
                used: VolatileSlice::new(addr.used_user_addr as *mut u8, u64_to_usize(used_size)),
                num,
            }
        };
        Ok(view)
    }

    pub(crate) fn avail_flags(&self) -> Result<u16, VringError> {
        Ok(self.avail.load(0, Ordering::Relaxed)?)
    }

    /// Reads the avail index. Ring contents read afterwards are at least as new as the index.
    pub(crate) fn avail_idx(&self) -> Result<Wrapping<u16>, VringError> {
        Ok(Wrapping(self.avail.load(2, Ordering::Acquire)?))
    }

    /// Reads the avail ring entry for the free-running index `idx`.
    pub(crate) fn avail_ring(&self, idx: Wrapping<u16>) -> Result<u16, VringError> {
        let slot = usize::from(idx.0 % self.num);
        Ok(self.avail.read_obj(4 + 2 * slot)?)
    }

    pub(crate) fn used_event(&self) -> Result<u16, VringError> {
        Ok(self.avail.load(4 + 2 * usize::from(self.num), Ordering::Relaxed)?)
    }

    pub(crate) fn descriptor(&self, index: u16) -> Result<Descriptor, VringError> {
        Ok(self.desc.read_obj(u64_to_usize(DESC_SIZE) * usize::from(index))?)
    }

    pub(crate) fn set_used_flags(&self, flags: u16) -> Result<(), VringError> {
        Ok(self.used.store(flags, 0, Ordering::Relaxed)?)
    }

    pub(crate) fn used_idx(&self) -> Result<Wrapping<u16>, VringError> {
        Ok(Wrapping(self.used.load(2, Ordering::Acquire)?))
    }

    /// Publishes the used index. Element writes issued before are visible first.
    pub(crate) fn set_used_idx(&self, idx: Wrapping<u16>) -> Result<(), VringError> {
        Ok(self.used.store(idx.0, 2, Ordering::Release)?)
    }

    /// Writes a used element for the free-running index `idx`.
    pub(crate) fn set_used_elem(
        &self,
        idx: Wrapping<u16>,
        elem: UsedElement,
    ) -> Result<(), VringError> {
        Ok(self.used.write_obj(elem, used_elem_offset(idx, self.num))?)
    }

    pub(crate) fn set_avail_event(&self, idx: Wrapping<u16>) -> Result<(), VringError> {
        Ok(self.used.store(idx.0, avail_event_offset(self.num), Ordering::Relaxed)?)
    }
}

/// Offset in the used ring of the element for the free-running index `idx`.
pub(crate) fn used_elem_offset(idx: Wrapping<u16>, num: u16) -> usize {
    4 + u64_to_usize(USED_ELEM_SIZE) * usize::from(idx.0 % num)
}

/// Offset in the used ring of the avail event field.
pub(crate) fn avail_event_offset(num: u16) -> usize {
    4 + u64_to_usize(USED_ELEM_SIZE) * usize::from(num)
}
