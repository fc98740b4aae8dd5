// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::min;

use vm_memory::VolatileSlice;

use crate::memory::MemoryTable;
use crate::utils::u64_to_usize;

/// Errors produced while translating a guest buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum TranslateError {
    /// Guest address {0:#x} is not covered by any memory region
    AddressFault(u64),
    /// Translation needs more than {0} host spans
    TooManySpans(usize),
}

/// A contiguous host-virtual range backing part of a guest buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSpan {
    /// Host-virtual start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
}

impl HostSpan {
    /// Returns a bounds-checked view of the span.
    ///
    /// # Safety
    ///
    /// The span must have been produced by [`translate`] through a table that is still alive.
    pub(crate) unsafe fn as_volatile_slice<'a>(&self) -> VolatileSlice<'a> {
        // SAFETY: the table validated the range against the owner's address space and keeps
        // that address space alive. The caller guarantees the table outlives the view.
        unsafe { VolatileSlice::new(self.addr as *mut u8, u64_to_usize(self.len)) }
    }
}

/// Translates the guest buffer `[addr, addr + len)` into host spans appended to `spans`.
///
/// A buffer straddling several regions yields one span per region. Returns the number of spans
/// appended. On error nothing is appended, and `spans` never grows beyond `capacity` entries.
pub fn translate(
    table: &MemoryTable,
    addr: u64,
    len: u32,
    spans: &mut Vec<HostSpan>,
    capacity: usize,
) -> Result<usize, TranslateError> {
    let start = spans.len();
    let mut addr = addr;
    let mut remaining = u64::from(len);

    while remaining > 0 {
        if spans.len() >= capacity {
            spans.truncate(start);
            return Err(TranslateError::TooManySpans(capacity));
        }
        let Some(region) = table.find_region(addr) else {
            spans.truncate(start);
            return Err(TranslateError::AddressFault(addr));
        };
        let offset = addr - region.guest_phys_addr;
        let chunk = min(remaining, region.memory_size - offset);
        spans.push(HostSpan {
            addr: region.userspace_addr + offset,
            len: chunk,
        });
        remaining -= chunk;
        // The region ends at or before u64::MAX, so this only wraps once nothing is left.
        addr = addr.wrapping_add(chunk);
    }

    Ok(spans.len() - start)
}

/// Copies bytes at `offset` of the concatenated `spans` into `buf`. Returns the number of
/// bytes copied, which is short if the spans end first.
///
/// # Safety
///
/// Same contract as [`HostSpan::as_volatile_slice`] for every span.
pub(crate) unsafe fn copy_from_spans(spans: &[HostSpan], offset: usize, buf: &mut [u8]) -> usize {
    let mut skip = offset;
    let mut copied = 0;
    for span in spans {
        if copied == buf.len() {
            break;
        }
        let span_len = u64_to_usize(span.len);
        if skip >= span_len {
            skip -= span_len;
            continue;
        }
        let count = min(span_len - skip, buf.len() - copied);
        // SAFETY: upheld by the caller.
        let slice = unsafe { span.as_volatile_slice() };
        match slice.subslice(skip, count) {
            Ok(sub) => copied += sub.copy_to(&mut buf[copied..copied + count]),
            Err(_) => break,
        }
        skip = 0;
    }
    copied
}

/// Copies `data` to `offset` of the concatenated `spans`. Returns the number of bytes copied.
///
/// # Safety
///
/// Same contract as [`HostSpan::as_volatile_slice`] for every span.
pub(crate) unsafe fn copy_to_spans(spans: &[HostSpan], offset: usize, data: &[u8]) -> usize {
    let mut skip = offset;
    let mut copied = 0;
    for span in spans {
        if copied == data.len() {
            break;
        }
        let span_len = u64_to_usize(span.len);
        if skip >= span_len {
            skip -= span_len;
            continue;
        }
        let count = min(span_len - skip, data.len() - copied);
        // SAFETY: upheld by the caller.
        let slice = unsafe { span.as_volatile_slice() };
        match slice.subslice(skip, count) {
            Ok(sub) => {
                sub.copy_from(&data[copied..copied + count]);
                copied += count;
            }
            Err(_) => break,
        }
        skip = 0;
    }
    copied
}
