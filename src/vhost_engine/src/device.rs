// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Device lifecycle and control surface.
//!
//! A [`Device`] owns its virtqueues, memory table, acked features and worker thread. Every
//! control operation except [`Device::set_owner`] and [`Device::get_features`] first checks
//! that the caller's address space is the owner's. Virtqueue geometry can only change while no
//! backend is attached to the queue; eventfds may be swapped at any time.

use std::any::Any;
use std::collections::TryReserveError;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::config::DeviceConfig;
use crate::features::{Features, VHOST_FEATURES};
use crate::logger::{IncMetric, StoreMetric, VhostDeviceMetrics, VhostMetricsPerDevice};
use crate::memory::{
    AddressSpaceRef, MemoryError, MemoryRegion, MemoryTable, MemoryTableCell,
    same_address_space,
};
use crate::utils::{lock, usize_to_u64};
pub use crate::vring::VringAddr;
use crate::vring::ring::{AVAIL_ALIGN, DESC_ALIGN, USED_ALIGN, VHOST_VRING_F_LOG};
use crate::vring::{Virtqueue, VirtqueueState, VringError};
use crate::worker::{VhostPoll, VhostWork, Worker, WorkerError, WorkerHandle};
use crate::zerocopy::UbufRef;

/// Largest ring size accepted by `SetVringNum`.
pub const MAX_RING_SIZE: u32 = 32768;

/// Errors returned by the control surface.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VhostError {
    /// Device already has an owner
    AlreadyOwned,
    /// Caller does not own the device
    NotOwner,
    /// Virtqueue {0} does not exist
    InvalidQueue(usize),
    /// Virtqueue {0} has a backend attached
    Busy(usize),
    /// Invalid ring size {0}
    InvalidRingSize(u32),
    /// Invalid ring base {0}
    InvalidBase(u32),
    /// Ring address {0:#x} is misaligned
    RingAlignment(u64),
    /// Unsupported ring address flags {0:#x}
    RingFlags(u32),
    /// Rings of virtqueue {0} are not accessible
    RingAccess(usize),
    /// Too many memory regions: {0}
    TooManyRegions(usize),
    /// Invalid memory table: {0}
    Memory(#[from] MemoryError),
    /// Dirty log does not cover the memory written by virtqueue {0}
    LogAccess(usize),
    /// Unsupported feature bits {0:#x}
    UnsupportedFeatures(u64),
    /// Invalid device configuration: {0}
    Config(&'static str),
    /// Failed to allocate virtqueue buffers: {0}
    Alloc(#[from] TryReserveError),
    /// Worker error: {0}
    Worker(#[from] WorkerError),
    /// Failed to initialize virtqueue: {0}
    Vring(#[from] VringError),
}

impl VhostError {
    /// Negative errno for ioctl-style callers.
    pub fn errno(&self) -> i32 {
        let errno = match self {
            VhostError::AlreadyOwned | VhostError::Busy(_) => libc::EBUSY,
            VhostError::NotOwner => libc::EPERM,
            VhostError::InvalidQueue(_) => libc::ENOBUFS,
            VhostError::InvalidRingSize(_)
            | VhostError::InvalidBase(_)
            | VhostError::RingAlignment(_)
            | VhostError::Config(_) => libc::EINVAL,
            VhostError::RingFlags(_) | VhostError::UnsupportedFeatures(_) => libc::EOPNOTSUPP,
            VhostError::RingAccess(_)
            | VhostError::Memory(_)
            | VhostError::LogAccess(_)
            | VhostError::Vring(_) => libc::EFAULT,
            VhostError::TooManyRegions(_) => libc::E2BIG,
            VhostError::Alloc(_) | VhostError::Worker(_) => libc::ENOMEM,
        };
        -errno
    }
}

/// Lifecycle state of a device, derived from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No owner.
    Unowned,
    /// Owned, worker running, no memory table.
    Owned,
    /// Memory table installed.
    MemoryConfigured,
    /// At least one virtqueue has ring addresses.
    VqsConfigured,
    /// At least one backend attached.
    Active,
    /// Backends attached while every guest write is being logged.
    Suspended,
}

/// Processes kicks of one virtqueue. Runs on the device worker thread.
pub trait VringHandler: Send + Sync {
    /// Called when the guest kicked `vq`, or when work was queued for it. Only called while a
    /// backend is attached.
    fn handle_kick(&self, vq: &Virtqueue);
}

impl<F> VringHandler for F
where
    F: Fn(&Virtqueue) + Send + Sync,
{
    fn handle_kick(&self, vq: &Virtqueue) {
        self(vq)
    }
}

/// State shared between a device and its virtqueues.
pub(crate) struct DeviceShared {
    pub(crate) id: String,
    pub(crate) memory: MemoryTableCell,
    pub(crate) metrics: Arc<VhostDeviceMetrics>,
    pub(crate) max_chain_len: usize,
    acked_features: AtomicU64,
    worker: Mutex<Option<WorkerHandle>>,
}

impl DeviceShared {
    pub(crate) fn acked_features(&self) -> Features {
        Features::from_bits_retain(self.acked_features.load(Ordering::Acquire))
    }

    pub(crate) fn worker(&self) -> Option<WorkerHandle> {
        lock(&self.worker).clone()
    }
}

struct Owner {
    mm: AddressSpaceRef,
    worker: Worker,
}

struct DeviceInner {
    owner: Option<Owner>,
    log_base: u64,
    log_ctx: Option<Arc<EventFd>>,
}

/// A vhost device.
pub struct Device {
    config: DeviceConfig,
    // Lock order: `inner`, then a virtqueue's state.
    inner: Mutex<DeviceInner>,
    shared: Arc<DeviceShared>,
    vqs: Vec<Arc<Virtqueue>>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("vqs", &self.vqs)
            .finish()
    }
}

impl Device {
    /// Creates an unowned device with one virtqueue per handler.
    pub fn new(
        config: DeviceConfig,
        handlers: Vec<Arc<dyn VringHandler>>,
    ) -> Result<Self, VhostError> {
        if config.max_chain_len == 0 {
            return Err(VhostError::Config("max_chain_len must be positive"));
        }
        if config.max_mem_regions == 0 {
            return Err(VhostError::Config("max_mem_regions must be positive"));
        }

        let shared = Arc::new(DeviceShared {
            id: config.id.clone(),
            memory: MemoryTableCell::new(MemoryTable::empty()),
            metrics: VhostMetricsPerDevice::alloc(config.id.clone()),
            max_chain_len: config.max_chain_len,
            acked_features: AtomicU64::new(0),
            worker: Mutex::new(None),
        });
        let vqs = handlers
            .into_iter()
            .enumerate()
            .map(|(index, handler)| {
                Arc::new_cyclic(|weak: &Weak<Virtqueue>| {
                    let weak = weak.clone();
                    let work = VhostWork::new(move || {
                        let Some(vq) = weak.upgrade() else {
                            return;
                        };
                        if vq.lock().has_backend() {
                            handler.handle_kick(&vq);
                        }
                    });
                    Virtqueue::new(index, Arc::clone(&shared), VhostPoll::new(work))
                })
            })
            .collect();

        Ok(Device {
            config,
            inner: Mutex::new(DeviceInner {
                owner: None,
                log_base: 0,
                log_ctx: None,
            }),
            shared,
            vqs,
        })
    }

    /// Device configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Device statistics.
    pub fn metrics(&self) -> &Arc<VhostDeviceMetrics> {
        &self.shared.metrics
    }

    /// Number of virtqueues.
    pub fn num_queues(&self) -> usize {
        self.vqs.len()
    }

    /// Virtqueue `idx`.
    pub fn vq(&self, idx: usize) -> Option<&Arc<Virtqueue>> {
        self.vqs.get(idx)
    }

    /// Currently installed memory table.
    pub fn memory_table(&self) -> Arc<MemoryTable> {
        self.shared.memory.load()
    }

    /// Features acked by `set_features`.
    pub fn acked_features(&self) -> Features {
        self.shared.acked_features()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        let inner = lock(&self.inner);
        if inner.owner.is_none() {
            return DeviceState::Unowned;
        }
        if self.shared.memory.load().regions().is_empty() {
            return DeviceState::Owned;
        }
        let mut configured = false;
        let mut active = false;
        for vq in &self.vqs {
            let state = vq.lock();
            configured |= state.addr() != VringAddr::default();
            active |= state.has_backend();
        }
        match (active, configured) {
            (true, _) if self.acked_features().contains(Features::LOG_ALL) => {
                DeviceState::Suspended
            }
            (true, _) => DeviceState::Active,
            (false, true) => DeviceState::VqsConfigured,
            (false, false) => DeviceState::MemoryConfigured,
        }
    }

    fn fail<T>(&self, err: VhostError) -> Result<T, VhostError> {
        warn!("vhost {}: {err}", self.config.id);
        self.shared.metrics.cfg_fails.inc();
        Err(err)
    }

    // Returns the owner's address space if `caller` is the owner.
    fn owner_mm(
        &self,
        inner: &DeviceInner,
        caller: &AddressSpaceRef,
    ) -> Result<AddressSpaceRef, VhostError> {
        match &inner.owner {
            Some(owner) if same_address_space(&owner.mm, caller) => Ok(Arc::clone(&owner.mm)),
            _ => self.fail(VhostError::NotOwner),
        }
    }

    fn checked_vq(&self, idx: usize) -> Result<&Arc<Virtqueue>, VhostError> {
        match self.vqs.get(idx) {
            Some(vq) => Ok(vq),
            None => self.fail(VhostError::InvalidQueue(idx)),
        }
    }

    /// Checks that `caller` owns the device.
    pub fn check_owner(&self, caller: &AddressSpaceRef) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller).map(drop)
    }

    /// Binds the device to `mm`, spawns its worker and allocates the per-queue buffers.
    ///
    /// Nothing is changed on failure.
    pub fn set_owner(&self, mm: AddressSpaceRef) -> Result<(), VhostError> {
        let mut inner = lock(&self.inner);
        if inner.owner.is_some() {
            return self.fail(VhostError::AlreadyOwned);
        }

        let worker = match Worker::spawn(
            format!("vhost-{}", self.config.id),
            Arc::clone(&self.shared.metrics),
        ) {
            Ok(worker) => worker,
            Err(err) => return self.fail(err.into()),
        };
        for (i, vq) in self.vqs.iter().enumerate() {
            let mut state = vq.lock();
            if let Err(err) = state.alloc_scratch(self.config.max_chain_len) {
                state.reset();
                drop(state);
                for vq in &self.vqs[..i] {
                    vq.lock().reset();
                }
                // Dropping the worker joins it.
                return self.fail(err.into());
            }
            state.set_address_space(Some(Arc::clone(&mm)));
        }

        *lock(&self.shared.worker) = Some(worker.handle().clone());
        inner.owner = Some(Owner { mm, worker });
        info!("vhost {}: owned", self.config.id);
        Ok(())
    }

    /// Tears the device down and returns it to the unowned state with an empty memory table.
    ///
    /// Waits for running kick handlers and for zero-copy sends in flight, but not for chains
    /// or memory tables still held elsewhere.
    pub fn reset_owner(&self, caller: &AddressSpaceRef) -> Result<(), VhostError> {
        let mut inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        self.cleanup(&mut inner);
        info!("vhost {}: owner reset", self.config.id);
        Ok(())
    }

    /// Features the device offers: the engine's own plus the backend's.
    pub fn get_features(&self) -> u64 {
        VHOST_FEATURES.bits() | self.config.backend_features
    }

    /// Acks `features`. Turning on `LOG_ALL` requires the dirty log to cover every region and
    /// every active ring.
    pub fn set_features(&self, caller: &AddressSpaceRef, features: u64) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        let mm = self.owner_mm(&inner, caller)?;
        let unsupported = features & !self.get_features();
        if unsupported != 0 {
            return self.fail(VhostError::UnsupportedFeatures(unsupported));
        }

        let requested = Features::from_bits_retain(features);
        if requested.contains(Features::LOG_ALL) {
            let table = self.shared.memory.load();
            if !table.log_access_ok(&*mm, inner.log_base) {
                return self.fail(VhostError::LogAccess(0));
            }
            for vq in &self.vqs {
                let state = vq.lock();
                if state.has_backend() && !state.log_access_ok(&table, inner.log_base, true) {
                    return self.fail(VhostError::LogAccess(vq.index()));
                }
            }
        }

        self.shared.acked_features.store(features, Ordering::Release);
        drop(inner);
        // Kick handlers in flight may still use the previous set.
        self.flush();
        Ok(())
    }

    /// Installs a new memory table.
    ///
    /// Every region must be accessible in the owner's address space and, while backends that
    /// log are attached, covered by the dirty log. Blocks until no descriptor chain translated
    /// through the previous table is alive, so it must not be called while holding one.
    pub fn set_mem_table(
        &self,
        caller: &AddressSpaceRef,
        regions: Vec<MemoryRegion>,
    ) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        let mm = self.owner_mm(&inner, caller)?;
        if regions.len() > self.config.max_mem_regions {
            return self.fail(VhostError::TooManyRegions(regions.len()));
        }
        let table = match MemoryTable::new(regions, mm) {
            Ok(table) => table,
            Err(err) => return self.fail(err.into()),
        };

        let log_all = self.acked_features().contains(Features::LOG_ALL);
        for vq in &self.vqs {
            let state = vq.lock();
            if state.has_backend() && !state.log_access_ok(&table, inner.log_base, log_all) {
                return self.fail(VhostError::LogAccess(vq.index()));
            }
        }

        let count = table.regions().len();
        self.shared.memory.replace(table);
        info!("vhost {}: memory table with {count} regions", self.config.id);
        Ok(())
    }

    /// Sets the host-virtual address of the dirty log bitmap.
    pub fn set_log_base(&self, caller: &AddressSpaceRef, log_base: u64) -> Result<(), VhostError> {
        let mut inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let table = self.shared.memory.load();
        let mut states: Vec<_> = self.vqs.iter().map(|vq| vq.lock()).collect();
        for state in &states {
            if state.has_backend() && !state.log_access_ok(&table, log_base, true) {
                let idx = state.index();
                drop(states);
                return self.fail(VhostError::LogAccess(idx));
            }
        }
        for state in &mut states {
            state.set_log_base(log_base);
        }
        inner.log_base = log_base;
        Ok(())
    }

    /// Sets the eventfd signalled when pages get dirtied. `None` disables the signal.
    pub fn set_log_fd(
        &self,
        caller: &AddressSpaceRef,
        evt: Option<EventFd>,
    ) -> Result<(), VhostError> {
        let mut inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let log_ctx = evt.map(Arc::new);
        for vq in &self.vqs {
            vq.lock().set_log_ctx(log_ctx.clone());
        }
        inner.log_ctx = log_ctx;
        Ok(())
    }

    // Locks a queue for a geometry change: owner checked, queue exists, no backend.
    fn with_idle_vq<T>(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        f: impl FnOnce(&mut VirtqueueState) -> Result<T, VhostError>,
    ) -> Result<T, VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let vq = self.checked_vq(idx)?;
        let mut state = vq.lock();
        if state.has_backend() {
            drop(state);
            return self.fail(VhostError::Busy(idx));
        }
        match f(&mut state) {
            Ok(val) => Ok(val),
            Err(err) => {
                drop(state);
                self.fail(err)
            }
        }
    }

    /// Sets the size of ring `idx`. Must be a power of two.
    pub fn set_vring_num(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        num: u32,
    ) -> Result<(), VhostError> {
        self.with_idle_vq(caller, idx, |state| {
            if num == 0 || num > MAX_RING_SIZE || !num.is_power_of_two() {
                return Err(VhostError::InvalidRingSize(num));
            }
            state.set_num(u16::try_from(num).map_err(|_| VhostError::InvalidRingSize(num))?);
            Ok(())
        })
    }

    /// Sets the ring addresses of queue `idx`.
    pub fn set_vring_addr(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        addr: VringAddr,
    ) -> Result<(), VhostError> {
        self.with_idle_vq(caller, idx, |state| {
            if addr.flags & !VHOST_VRING_F_LOG != 0 {
                return Err(VhostError::RingFlags(addr.flags));
            }
            for (start, align) in [
                (addr.desc_user_addr, DESC_ALIGN),
                (addr.avail_user_addr, AVAIL_ALIGN),
                (addr.used_user_addr, USED_ALIGN),
            ] {
                if start % align != 0 {
                    return Err(VhostError::RingAlignment(start));
                }
            }
            let previous = state.addr();
            state.set_addr(addr);
            if !state.ring_access_ok() {
                state.set_addr(previous);
                return Err(VhostError::RingAccess(idx));
            }
            Ok(())
        })
    }

    /// Sets the next avail index queue `idx` consumes.
    pub fn set_vring_base(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        base: u32,
    ) -> Result<(), VhostError> {
        self.with_idle_vq(caller, idx, |state| {
            let base = u16::try_from(base).map_err(|_| VhostError::InvalidBase(base))?;
            state.set_base(base);
            Ok(())
        })
    }

    /// Returns the next avail index queue `idx` consumes.
    pub fn get_vring_base(&self, caller: &AddressSpaceRef, idx: usize) -> Result<u16, VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let vq = self.checked_vq(idx)?;
        Ok(vq.lock().last_avail_idx())
    }

    /// Sets the eventfd the guest kicks queue `idx` through. `None` stops polling.
    ///
    /// The previous eventfd stops being polled, and a handler run it triggered completes,
    /// before the new one is polled.
    pub fn set_vring_kick(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        evt: Option<EventFd>,
    ) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let vq = self.checked_vq(idx)?;

        vq.poll().stop();
        vq.poll().flush();
        let mut state = vq.lock();
        drop(state.replace_kick(evt));
        let Some(kick) = state.kick() else {
            return Ok(());
        };
        let Some(worker) = self.shared.worker() else {
            return Ok(());
        };
        if let Err(err) = vq.poll().start(&worker, kick) {
            drop(state.replace_kick(None));
            drop(state);
            return self.fail(err.into());
        }
        Ok(())
    }

    /// Sets the eventfd used to signal the guest for queue `idx`.
    pub fn set_vring_call(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        evt: Option<EventFd>,
    ) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        drop(self.checked_vq(idx)?.lock().replace_call(evt));
        Ok(())
    }

    /// Sets the eventfd signalled on errors of queue `idx`.
    pub fn set_vring_err(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        evt: Option<EventFd>,
    ) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        drop(self.checked_vq(idx)?.lock().replace_err(evt));
        Ok(())
    }

    /// Attaches backend `data` to queue `idx`, or detaches the current backend with `None`.
    ///
    /// Attaching validates the rings and the dirty log and resynchronizes with the guest's
    /// used index. With `zerocopy`, the queue accepts zero-copy sends until the next attach or
    /// detach. Replacing or detaching a backend waits for its kick handler runs and its
    /// zero-copy sends, then publishes those sends.
    pub fn set_vring_backend(
        &self,
        caller: &AddressSpaceRef,
        idx: usize,
        data: Option<Arc<dyn Any + Send + Sync>>,
        zerocopy: bool,
    ) -> Result<(), VhostError> {
        let inner = lock(&self.inner);
        self.owner_mm(&inner, caller)?;
        let vq = self.checked_vq(idx)?;
        let mut state = vq.lock();

        let attach = data.is_some();
        if attach {
            if !state.ring_access_ok() {
                drop(state);
                return self.fail(VhostError::RingAccess(idx));
            }
            let table = self.shared.memory.load();
            let log_all = self.acked_features().contains(Features::LOG_ALL);
            if !state.log_access_ok(&table, inner.log_base, log_all) {
                drop(state);
                return self.fail(VhostError::LogAccess(idx));
            }
        }

        let old_data = state.replace_private_data(data);
        if attach {
            if let Err(err) = state.init_used() {
                state.replace_private_data(old_data);
                drop(state);
                return self.fail(err.into());
            }
        }
        let old_ubuf = if attach && zerocopy {
            state.enable_zerocopy(self.zerocopy_notify(vq))
        } else {
            state.disable_zerocopy()
        };
        drop(state);

        let active = self.vqs.iter().filter(|vq| vq.lock().has_backend()).count();
        self.shared.metrics.active_queues.store(usize_to_u64(active));
        if attach {
            info!("vhost {}: vq {idx}: backend attached", self.config.id);
        } else if old_data.is_some() {
            info!("vhost {}: vq {idx}: backend detached", self.config.id);
        }

        if old_data.is_some() {
            vq.flush();
        }
        self.retire_zerocopy(vq, old_ubuf);
        Ok(())
    }

    fn zerocopy_notify(&self, vq: &Arc<Virtqueue>) -> impl Fn() + Send + Sync + 'static {
        let weak = Arc::downgrade(vq);
        let metrics = Arc::clone(&self.shared.metrics);
        move || {
            metrics.zerocopy_completed.inc();
            if let Some(vq) = weak.upgrade() {
                vq.poll_queue();
            }
        }
    }

    // Waits for the sends of a detached attachment and publishes them.
    fn retire_zerocopy(&self, vq: &Virtqueue, ubuf: Option<UbufRef>) {
        let Some(ubuf) = ubuf else {
            return;
        };
        ubuf.put_and_wait();
        let mut state = vq.lock();
        if let Err(err) = state.zerocopy_signal_used() {
            error!(
                "vhost {}: vq {}: failed to publish zero-copy sends: {err}",
                self.config.id,
                vq.index()
            );
        }
    }

    /// Waits until every kick handler run requested so far has completed.
    pub fn flush(&self) {
        for vq in &self.vqs {
            vq.flush();
        }
    }

    // Stops polling, drains work and zero-copy sends, releases every handle, joins the worker
    // and installs an empty memory table.
    fn cleanup(&self, inner: &mut DeviceInner) {
        for vq in &self.vqs {
            vq.poll().stop();
        }
        self.flush();

        for vq in &self.vqs {
            let ubuf = {
                let mut state = vq.lock();
                state.replace_private_data(None);
                state.disable_zerocopy()
            };
            self.retire_zerocopy(vq, ubuf);
            vq.lock().reset();
        }

        *lock(&self.shared.worker) = None;
        if let Some(owner) = inner.owner.take() {
            owner.worker.stop();
        }
        // Outstanding chains and table clones keep the old table alive on their own.
        self.shared.memory.store(MemoryTable::empty());
        self.shared.acked_features.store(0, Ordering::Release);
        self.shared.metrics.active_queues.store(0);
        inner.log_base = 0;
        inner.log_ctx = None;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.owner.is_some() {
            self.cleanup(&mut inner);
        }
    }
}
