// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::TryReserveError;
use std::num::Wrapping;
use std::sync::Arc;

use vm_memory::ByteValued;

use super::dirty_log::LogEntry;
use super::ring::{DESC_SIZE, Descriptor, RingView};
use super::{VirtqueueState, VringError};
use crate::features::Features;
use crate::logger::IncMetric;
use crate::memory::MemoryTable;
use crate::translate::{HostSpan, copy_from_spans, copy_to_spans, translate};
use crate::utils::{u64_to_usize, usize_to_u64};

/// Upper bound on the entries of one indirect table.
const MAX_INDIRECT_ENTRIES: u32 = 65536;

/// Reusable buffers for chain walks, allocated when the device gets an owner.
#[derive(Debug, Default)]
pub(crate) struct ChainScratch {
    spans: Vec<HostSpan>,
    indirect: Vec<HostSpan>,
    log: Vec<LogEntry>,
    capacity: usize,
}

impl ChainScratch {
    pub(crate) fn try_new(capacity: usize) -> Result<Self, TryReserveError> {
        let mut scratch = ChainScratch {
            capacity,
            ..Default::default()
        };
        scratch.spans.try_reserve_exact(capacity)?;
        scratch.indirect.try_reserve_exact(capacity)?;
        scratch.log.try_reserve_exact(capacity)?;
        Ok(scratch)
    }

    // Takes back the buffers a walk handed to a chain, if ours fell below capacity.
    fn restore(&mut self, mut spans: Vec<HostSpan>, mut log: Vec<LogEntry>) {
        if self.spans.capacity() < self.capacity && spans.capacity() >= self.capacity {
            spans.clear();
            self.spans = spans;
        }
        if self.log.capacity() < self.capacity && log.capacity() >= self.capacity {
            log.clear();
            self.log = log;
        }
    }
}

/// A descriptor chain popped from the avail ring, translated to host spans.
///
/// Readable spans come first, followed by writable spans. The chain keeps the memory table it
/// was translated through alive, so its spans stay valid for as long as it exists.
#[derive(Debug)]
pub struct DescChain {
    head: u16,
    spans: Vec<HostSpan>,
    out_num: usize,
    log: Vec<LogEntry>,
    table: Arc<MemoryTable>,
}

impl DescChain {
    /// Head index, to be published in the used ring.
    pub fn head(&self) -> u16 {
        self.head
    }

    /// Spans the device reads from.
    pub fn readable(&self) -> &[HostSpan] {
        &self.spans[..self.out_num]
    }

    /// Spans the device writes to.
    pub fn writable(&self) -> &[HostSpan] {
        &self.spans[self.out_num..]
    }

    /// Total length of the readable spans.
    pub fn readable_len(&self) -> u64 {
        self.readable().iter().map(|span| span.len).sum()
    }

    /// Total length of the writable spans.
    pub fn writable_len(&self) -> u64 {
        self.writable().iter().map(|span| span.len).sum()
    }

    /// Guest ranges of the writable descriptors, recorded when dirty logging is acked.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Memory table the chain was translated through.
    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }

    /// Reads from offset `offset` of the readable buffers into `buf`. Returns the number of
    /// bytes read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        // SAFETY: the spans were translated through `self.table`, which is alive.
        unsafe { copy_from_spans(self.readable(), offset, buf) }
    }

    /// Writes `data` at offset `offset` of the writable buffers. Returns the number of bytes
    /// written.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> usize {
        // SAFETY: the spans were translated through `self.table`, which is alive.
        unsafe { copy_to_spans(self.writable(), offset, data) }
    }

    /// Every span as iovecs, readable ones first.
    ///
    /// The iovecs are only valid while `self` is alive.
    pub fn iovecs(&self) -> Vec<libc::iovec> {
        to_iovecs(&self.spans)
    }

    /// Readable spans as iovecs for vectored I/O.
    ///
    /// The iovecs are only valid while `self` is alive.
    pub fn readable_iovecs(&self) -> Vec<libc::iovec> {
        to_iovecs(self.readable())
    }

    /// Writable spans as iovecs for vectored I/O.
    ///
    /// The iovecs are only valid while `self` is alive.
    pub fn writable_iovecs(&self) -> Vec<libc::iovec> {
        to_iovecs(self.writable())
    }
}

fn to_iovecs(spans: &[HostSpan]) -> Vec<libc::iovec> {
    spans
        .iter()
        .map(|span| libc::iovec {
            iov_base: span.addr as *mut libc::c_void,
            iov_len: u64_to_usize(span.len),
        })
        .collect()
}

impl VirtqueueState {
    /// Pops the next available descriptor chain.
    ///
    /// Returns `Ok(None)` if the guest made nothing new available. On error the avail index
    /// is not consumed, the error is reported through [`VirtqueueState::vq_err`], and the
    /// next call retries the same chain.
    pub fn get_available_chain(&mut self) -> Result<Option<DescChain>, VringError> {
        let result = self.pop_chain();
        if let Err(err) = &result {
            self.vq_err(err);
        }
        result
    }

    /// Returns the last `n` popped chains to the avail ring, to be popped again.
    pub fn discard_chains(&mut self, n: u16) {
        self.last_avail_idx -= Wrapping(n);
    }

    /// Gives the buffers of a processed chain back for the next walk.
    pub fn recycle(&mut self, chain: DescChain) {
        let DescChain { spans, log, .. } = chain;
        self.scratch.restore(spans, log);
    }

    fn pop_chain(&mut self) -> Result<Option<DescChain>, VringError> {
        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;

        let avail_idx = ring.avail_idx()?;
        self.avail_idx = avail_idx;
        let pending = (avail_idx - self.last_avail_idx).0;
        if pending > self.num {
            return Err(VringError::AvailIndex {
                last: self.last_avail_idx.0,
                avail: avail_idx.0,
            });
        }
        if pending == 0 {
            return Ok(None);
        }

        let head = ring.avail_ring(self.last_avail_idx)?;
        if head >= self.num {
            return Err(VringError::InvalidHead {
                head,
                num: self.num,
            });
        }

        let table = self.shared.memory.load();
        let mut spans = std::mem::take(&mut self.scratch.spans);
        let mut log = std::mem::take(&mut self.scratch.log);
        spans.clear();
        log.clear();

        let mut walk = ChainWalk {
            head,
            table: &table,
            capacity: self.shared.max_chain_len,
            log_all: self.acked(Features::LOG_ALL),
            indirect_ok: self.acked(Features::INDIRECT_DESC),
            spans: &mut spans,
            indirect: &mut self.scratch.indirect,
            log: &mut log,
            out_num: 0,
        };
        match walk.walk(&ring, self.num) {
            Ok(()) => {
                let out_num = walk.out_num;
                self.last_avail_idx += Wrapping(1);
                self.shared.metrics.chain_count.inc();
                Ok(Some(DescChain {
                    head,
                    spans,
                    out_num,
                    log,
                    table,
                }))
            }
            Err(err) => {
                self.scratch.spans = spans;
                self.scratch.log = log;
                Err(err)
            }
        }
    }
}

// One chain walk. Readable spans are pushed before writable ones, `out_num` counts them.
struct ChainWalk<'a> {
    head: u16,
    table: &'a MemoryTable,
    capacity: usize,
    log_all: bool,
    indirect_ok: bool,
    spans: &'a mut Vec<HostSpan>,
    indirect: &'a mut Vec<HostSpan>,
    log: &'a mut Vec<LogEntry>,
    out_num: usize,
}

impl ChainWalk<'_> {
    fn walk(&mut self, ring: &RingView<'_>, num: u16) -> Result<(), VringError> {
        let mut index = self.head;
        let mut found: u32 = 0;
        loop {
            if index >= num {
                return Err(VringError::DescriptorIndex { index, num });
            }
            found += 1;
            if found > u32::from(num) {
                return Err(VringError::LoopDetected(self.head));
            }

            let desc = ring.descriptor(index)?;
            if desc.is_indirect() {
                self.walk_indirect(&desc)?;
            } else {
                self.push(&desc)?;
            }

            if !desc.has_next() {
                return Ok(());
            }
            index = desc.next;
        }
    }

    fn walk_indirect(&mut self, indirect: &Descriptor) -> Result<(), VringError> {
        let head = self.head;
        if !self.indirect_ok {
            return Err(VringError::IndirectNotNegotiated(head));
        }
        let len = indirect.len;
        if len == 0 || u64::from(len) % DESC_SIZE != 0 {
            return Err(VringError::IndirectLength { head, len });
        }
        let count = len / 16;
        if count > MAX_INDIRECT_ENTRIES {
            return Err(VringError::ChainTooLong { head, count });
        }

        self.indirect.clear();
        translate(self.table, indirect.addr, len, self.indirect, self.capacity)?;

        let mut index: u16 = 0;
        let mut found: u32 = 0;
        loop {
            found += 1;
            if found > count {
                return Err(VringError::ChainTooLong { head, count });
            }

            let mut desc = Descriptor::default();
            let offset = u64_to_usize(DESC_SIZE) * usize::from(index);
            // SAFETY: `self.indirect` was translated through `self.table`, which is alive.
            let read = unsafe { copy_from_spans(self.indirect, offset, desc.as_mut_slice()) };
            if usize_to_u64(read) != DESC_SIZE {
                return Err(VringError::IndirectLength { head, len });
            }
            if desc.is_indirect() {
                return Err(VringError::NestedIndirect(head));
            }
            self.push(&desc)?;

            if !desc.has_next() {
                return Ok(());
            }
            if u32::from(desc.next) >= count {
                return Err(VringError::IndirectIndex {
                    head,
                    index: desc.next,
                    count,
                });
            }
            index = desc.next;
        }
    }

    fn push(&mut self, desc: &Descriptor) -> Result<(), VringError> {
        let in_num = self.spans.len() - self.out_num;
        if !desc.is_write_only() && in_num > 0 {
            return Err(VringError::ReadAfterWrite(self.head));
        }
        let added = translate(self.table, desc.addr, desc.len, self.spans, self.capacity)?;
        if desc.is_write_only() {
            if self.log_all {
                self.log.push(LogEntry {
                    addr: desc.addr,
                    len: u64::from(desc.len),
                });
            }
        } else {
            self.out_num += added;
        }
        Ok(())
    }
}
