// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Split virtqueue processing.
//!
//! A [`Virtqueue`] couples the per-queue state, guarded by its own mutex, with the poll that
//! schedules the backend's kick handler on the device worker. Backends lock the queue and use
//! [`VirtqueueState`] to pop descriptor chains, publish completions and signal the guest.

mod chain;
mod dirty_log;
mod notify;
pub mod ring;
mod used;

use std::any::Any;
use std::collections::TryReserveError;
use std::fmt::{self, Debug};
use std::num::Wrapping;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use vm_memory::VolatileMemoryError;
use vmm_sys_util::eventfd::EventFd;

pub use self::chain::DescChain;
pub(crate) use self::chain::ChainScratch;
pub use self::dirty_log::LogEntry;
pub use self::notify::need_event;
pub use self::ring::{Descriptor, UsedElement, VringAddr};
use self::ring::{RingView, VHOST_VRING_F_LOG, ring_sizes};
use crate::device::DeviceShared;
use crate::features::Features;
use crate::logger::IncMetric;
use crate::memory::{AddressSpaceRef, MemoryTable, log_access_ok};
use crate::translate::TranslateError;
use crate::utils::lock;
use crate::worker::VhostPoll;
use crate::zerocopy::{UbufRef, ZerocopyCompletion, ZerocopyRing};

/// Errors raised while processing a virtqueue.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VringError {
    /// Virtqueue is not owned by any address space
    NoOwner,
    /// Guest moved avail index from {last} to {avail}
    AvailIndex {
        /// Last index consumed by the engine.
        last: u16,
        /// Index published by the guest.
        avail: u16,
    },
    /// Guest says index {head} is available, ring size is {num}
    InvalidHead {
        /// Head read from the avail ring.
        head: u16,
        /// Ring size.
        num: u16,
    },
    /// Descriptor index {index} out of range for ring size {num}
    DescriptorIndex {
        /// Offending index.
        index: u16,
        /// Ring size.
        num: u16,
    },
    /// Loop detected in descriptor chain {0}
    LoopDetected(u16),
    /// Indirect descriptor in chain {0} without negotiated indirect descriptors
    IndirectNotNegotiated(u16),
    /// Nested indirect descriptor table in chain {0}
    NestedIndirect(u16),
    /// Indirect table of chain {head} has invalid length {len}
    IndirectLength {
        /// Chain head.
        head: u16,
        /// Table length in bytes.
        len: u32,
    },
    /// Indirect table of chain {head} has {count} entries, which is too many
    ChainTooLong {
        /// Chain head.
        head: u16,
        /// Number of table entries.
        count: u32,
    },
    /// Indirect descriptor index {index} out of range for table of {count} in chain {head}
    IndirectIndex {
        /// Chain head.
        head: u16,
        /// Offending index.
        index: u16,
        /// Number of table entries.
        count: u32,
    },
    /// Readable descriptor after a writable one in chain {0}
    ReadAfterWrite(u16),
    /// Failed to translate descriptor buffer: {0}
    Translate(#[from] TranslateError),
    /// Ring memory at {addr:#x} (length {len}) is not accessible
    RingAccess {
        /// Host-virtual address of the ring.
        addr: u64,
        /// Ring size in bytes.
        len: u64,
    },
    /// Failed to access ring memory: {0}
    Memory(#[from] VolatileMemoryError),
    /// Used element id {id} out of range for ring size {num}
    UsedId {
        /// Offending id.
        id: u32,
        /// Ring size.
        num: u16,
    },
    /// Batch of {0} used elements does not fit the ring
    UsedBatch(usize),
    /// Failed to write dirty log byte at {0:#x}
    LogWrite(u64),
    /// Zero-copy is not enabled on this queue
    ZerocopyDisabled,
    /// Zero-copy completion ring is full
    ZerocopyRingFull,
}

/// Broad class of a [`VringError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VringErrorKind {
    /// Guest corrupted the ring state.
    ProtocolViolation,
    /// A guest or ring address is not mapped as required.
    AddressFault,
    /// A bounded resource ran out.
    ResourceExhaustion,
    /// The queue is not owned.
    Ownership,
}

impl VringError {
    /// Classifies the error.
    pub fn kind(&self) -> VringErrorKind {
        match self {
            VringError::NoOwner => VringErrorKind::Ownership,
            VringError::Translate(TranslateError::AddressFault(_))
            | VringError::RingAccess { .. }
            | VringError::Memory(_)
            | VringError::LogWrite(_) => VringErrorKind::AddressFault,
            VringError::Translate(TranslateError::TooManySpans(_))
            | VringError::UsedBatch(_)
            | VringError::ZerocopyDisabled
            | VringError::ZerocopyRingFull => VringErrorKind::ResourceExhaustion,
            VringError::AvailIndex { .. }
            | VringError::InvalidHead { .. }
            | VringError::DescriptorIndex { .. }
            | VringError::LoopDetected(_)
            | VringError::IndirectNotNegotiated(_)
            | VringError::NestedIndirect(_)
            | VringError::IndirectLength { .. }
            | VringError::ChainTooLong { .. }
            | VringError::IndirectIndex { .. }
            | VringError::ReadAfterWrite(_)
            | VringError::UsedId { .. } => VringErrorKind::ProtocolViolation,
        }
    }
}

/// State of one virtqueue. Obtained through [`Virtqueue::lock`].
pub struct VirtqueueState {
    index: usize,
    shared: Arc<DeviceShared>,
    mm: Option<AddressSpaceRef>,

    num: u16,
    addr: VringAddr,
    last_avail_idx: Wrapping<u16>,
    // Avail index as last read from the guest.
    avail_idx: Wrapping<u16>,
    last_used_idx: Wrapping<u16>,
    used_flags: u16,
    // Used index the guest was last signalled at, valid only with `signalled_used_valid`.
    signalled_used: Wrapping<u16>,
    signalled_used_valid: bool,

    log_used: bool,
    log_addr: u64,
    log_base: u64,
    log_ctx: Option<Arc<EventFd>>,

    kick: Option<EventFd>,
    call: Option<EventFd>,
    err: Option<EventFd>,

    private_data: Option<Arc<dyn Any + Send + Sync>>,
    zerocopy: Option<ZerocopyRing>,
    scratch: ChainScratch,
}

impl Debug for VirtqueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtqueueState")
            .field("index", &self.index)
            .field("num", &self.num)
            .field("addr", &self.addr)
            .field("last_avail_idx", &self.last_avail_idx)
            .field("avail_idx", &self.avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .field("used_flags", &self.used_flags)
            .field("signalled_used", &self.signalled_used)
            .field("signalled_used_valid", &self.signalled_used_valid)
            .field("log_used", &self.log_used)
            .field("has_backend", &self.private_data.is_some())
            .finish_non_exhaustive()
    }
}

impl VirtqueueState {
    fn new(index: usize, shared: Arc<DeviceShared>) -> Self {
        VirtqueueState {
            index,
            shared,
            mm: None,
            num: 1,
            addr: VringAddr::default(),
            last_avail_idx: Wrapping(0),
            avail_idx: Wrapping(0),
            last_used_idx: Wrapping(0),
            used_flags: 0,
            signalled_used: Wrapping(0),
            signalled_used_valid: false,
            log_used: false,
            log_addr: 0,
            log_base: 0,
            log_ctx: None,
            kick: None,
            call: None,
            err: None,
            private_data: None,
            zerocopy: None,
            scratch: ChainScratch::default(),
        }
    }

    /// Index of the queue within its device.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Ring size.
    pub fn num(&self) -> u16 {
        self.num
    }

    /// Ring addresses.
    pub fn addr(&self) -> VringAddr {
        self.addr
    }

    /// Next avail ring index the engine will consume.
    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx.0
    }

    /// Next used ring index the engine will produce.
    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx.0
    }

    /// Features acked on the device.
    pub fn acked_features(&self) -> Features {
        self.shared.acked_features()
    }

    /// Whether a backend is attached.
    pub fn has_backend(&self) -> bool {
        self.private_data.is_some()
    }

    /// Returns the attached backend data if it is a `T`.
    pub fn private_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.private_data.clone()?.downcast::<T>().ok()
    }

    /// Reports a queue-level error: logs it, counts it and signals the error eventfd.
    ///
    /// The queue itself stays usable.
    pub fn vq_err(&self, err: &VringError) {
        // Guest triggerable, keep it out of the default log level.
        debug!("vhost {}: vq {}: {err}", self.shared.id, self.index);
        let metrics = &self.shared.metrics;
        match err.kind() {
            VringErrorKind::ProtocolViolation => metrics.protocol_fails.inc(),
            VringErrorKind::AddressFault => metrics.address_fails.inc(),
            VringErrorKind::ResourceExhaustion | VringErrorKind::Ownership => {
                metrics.cfg_fails.inc()
            }
        }
        if let Some(evt) = &self.err {
            if let Err(write_err) = evt.write(1) {
                debug!(
                    "vhost {}: vq {}: failed to signal error eventfd: {write_err}",
                    self.shared.id, self.index
                );
            }
        }
    }

    /// Starts a zero-copy send of chain `head`. The chain is published once the returned
    /// completion is dropped and [`VirtqueueState::zerocopy_signal_used`] runs.
    pub fn zerocopy_start(&mut self, head: u16) -> Result<ZerocopyCompletion, VringError> {
        let completion = self
            .zerocopy
            .as_mut()
            .ok_or(VringError::ZerocopyDisabled)?
            .start(head)?;
        self.shared.metrics.zerocopy_started.inc();
        Ok(completion)
    }

    /// Whether the zero-copy ring has no room for another send.
    pub fn zerocopy_ring_full(&self) -> bool {
        self.zerocopy.as_ref().is_some_and(ZerocopyRing::is_full)
    }

    /// Publishes every zero-copy send completed in order, stopping at the first one still in
    /// flight. Returns the number of chains published.
    pub fn zerocopy_signal_used(&mut self) -> Result<usize, VringError> {
        let mut done = Vec::new();
        if let Some(zerocopy) = self.zerocopy.as_mut() {
            zerocopy.collect_done(&mut done);
        }
        if done.is_empty() {
            return Ok(0);
        }
        self.add_used_and_signal_n(&done)?;
        Ok(done.len())
    }

    fn address_space(&self) -> Result<AddressSpaceRef, VringError> {
        self.mm.clone().ok_or(VringError::NoOwner)
    }

    fn acked(&self, feature: Features) -> bool {
        self.shared.acked_features().contains(feature)
    }

    // Control plane, driven by `Device` with the queue locked.

    pub(crate) fn set_address_space(&mut self, mm: Option<AddressSpaceRef>) {
        self.mm = mm;
    }

    pub(crate) fn alloc_scratch(&mut self, capacity: usize) -> Result<(), TryReserveError> {
        self.scratch = ChainScratch::try_new(capacity)?;
        self.zerocopy = Some(ZerocopyRing::try_new(capacity)?);
        Ok(())
    }

    pub(crate) fn set_num(&mut self, num: u16) {
        self.num = num;
    }

    pub(crate) fn set_addr(&mut self, addr: VringAddr) {
        self.log_used = addr.flags & VHOST_VRING_F_LOG != 0;
        self.log_addr = addr.log_guest_addr;
        self.addr = addr;
    }

    pub(crate) fn set_base(&mut self, base: u16) {
        self.last_avail_idx = Wrapping(base);
        self.avail_idx = Wrapping(base);
    }

    pub(crate) fn set_log_base(&mut self, log_base: u64) {
        self.log_base = log_base;
    }

    pub(crate) fn set_log_ctx(&mut self, log_ctx: Option<Arc<EventFd>>) {
        self.log_ctx = log_ctx;
    }

    pub(crate) fn kick(&self) -> Option<&EventFd> {
        self.kick.as_ref()
    }

    pub(crate) fn replace_kick(&mut self, evt: Option<EventFd>) -> Option<EventFd> {
        std::mem::replace(&mut self.kick, evt)
    }

    pub(crate) fn replace_call(&mut self, evt: Option<EventFd>) -> Option<EventFd> {
        std::mem::replace(&mut self.call, evt)
    }

    pub(crate) fn replace_err(&mut self, evt: Option<EventFd>) -> Option<EventFd> {
        std::mem::replace(&mut self.err, evt)
    }

    pub(crate) fn replace_private_data(
        &mut self,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        std::mem::replace(&mut self.private_data, data)
    }

    /// Arms zero-copy for a new backend. Returns the reference of the previous backend.
    pub(crate) fn enable_zerocopy(
        &mut self,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> Option<UbufRef> {
        self.zerocopy.as_mut().and_then(|zc| zc.enable(notify))
    }

    pub(crate) fn disable_zerocopy(&mut self) -> Option<UbufRef> {
        self.zerocopy.as_mut().and_then(ZerocopyRing::disable)
    }

    /// Whether the rings are mapped in the owner's address space for the current size.
    pub(crate) fn ring_access_ok(&self) -> bool {
        self.mm
            .as_deref()
            .is_some_and(|mm| RingView::new(mm, &self.addr, self.num).is_ok())
    }

    /// Whether the dirty bitmap at `log_base` covers what this queue may log: every region of
    /// `table` when `log_all`, and the used ring when used logging was requested.
    pub(crate) fn log_access_ok(&self, table: &MemoryTable, log_base: u64, log_all: bool) -> bool {
        let Some(mm) = self.mm.as_deref() else {
            return false;
        };
        if log_all && !table.log_access_ok(mm, log_base) {
            return false;
        }
        let (_, _, used_size) = ring_sizes(self.num);
        !self.log_used || log_access_ok(mm, log_base, self.log_addr, used_size)
    }

    /// Restores the state of a freshly created queue, dropping every handle it holds.
    pub(crate) fn reset(&mut self) {
        *self = VirtqueueState::new(self.index, Arc::clone(&self.shared));
    }
}

/// A virtqueue of a vhost device.
pub struct Virtqueue {
    index: usize,
    state: Mutex<VirtqueueState>,
    poll: VhostPoll,
    shared: Arc<DeviceShared>,
}

impl Debug for Virtqueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Virtqueue")
            .field("index", &self.index)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl Virtqueue {
    pub(crate) fn new(index: usize, shared: Arc<DeviceShared>, poll: VhostPoll) -> Self {
        Virtqueue {
            index,
            state: Mutex::new(VirtqueueState::new(index, Arc::clone(&shared))),
            poll,
            shared,
        }
    }

    /// Index of the queue within its device.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Locks the queue state.
    pub fn lock(&self) -> MutexGuard<'_, VirtqueueState> {
        lock(&self.state)
    }

    /// Schedules the queue's kick handler on the device worker, as if the guest had kicked.
    pub fn poll_queue(&self) {
        if let Some(worker) = self.shared.worker() {
            self.poll.queue(&worker);
        }
    }

    /// Blocks until every kick handler run requested so far has completed.
    pub fn flush(&self) {
        self.poll.flush();
        self.shared.metrics.flush_count.inc();
    }

    pub(crate) fn poll(&self) -> &VhostPoll {
        &self.poll
    }
}
