// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deferred completion of zero-copy sends.
//!
//! A backend that hands guest buffers to an asynchronous consumer cannot return the chain to
//! the guest when the ring walk ends, only when the consumer is done with the memory. Each
//! such send takes a slot in the queue's [`ZerocopyRing`] and gets a [`ZerocopyCompletion`];
//! dropping the completion marks the slot done and schedules the queue's handler, which then
//! publishes finished slots in submission order.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::utils::{lock, wait};
use crate::vring::{UsedElement, VringError};

const SLOT_CLEAR: u8 = 0;
const SLOT_IN_PROGRESS: u8 = 1;
const SLOT_DONE: u8 = 2;

#[derive(Debug, Default)]
struct DmaSlot {
    head: AtomicU16,
    state: AtomicU8,
}

struct Ubuf {
    refcount: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
    notify: Box<dyn Fn() + Send + Sync>,
}

/// Counted reference on the zero-copy state of one backend attachment.
///
/// The attachment holds the first reference and every in-flight send holds one more. Detaching
/// drops the first one with [`UbufRef::put_and_wait`], which returns once every send retired.
pub struct UbufRef {
    inner: Arc<Ubuf>,
}

impl Debug for UbufRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UbufRef")
            .field("refcount", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl UbufRef {
    /// Creates the initial reference. `notify` runs on every completion.
    pub(crate) fn new(notify: impl Fn() + Send + Sync + 'static) -> Self {
        UbufRef {
            inner: Arc::new(Ubuf {
                refcount: AtomicUsize::new(1),
                drain_lock: Mutex::new(()),
                drained: Condvar::new(),
                notify: Box::new(notify),
            }),
        }
    }

    fn get(&self) -> UbufRef {
        self.inner.refcount.fetch_add(1, Ordering::Relaxed);
        UbufRef {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live references.
    pub fn outstanding(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// Drops this reference and blocks until every other one is dropped too.
    pub fn put_and_wait(self) {
        let inner = Arc::clone(&self.inner);
        drop(self);
        let mut guard = lock(&inner.drain_lock);
        while inner.refcount.load(Ordering::Acquire) != 0 {
            guard = wait(&inner.drained, guard);
        }
    }
}

impl Drop for UbufRef {
    fn drop(&mut self) {
        if self.inner.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the lock orders the wakeup after a waiter's check.
            let _guard = lock(&self.inner.drain_lock);
            self.inner.drained.notify_all();
        }
    }
}

/// Completion handle of one zero-copy send. Dropping it completes the send.
///
/// The handle may be moved to and dropped on any thread.
#[derive(Debug)]
pub struct ZerocopyCompletion {
    slots: Arc<[DmaSlot]>,
    slot: usize,
    head: u16,
    ubuf: UbufRef,
}

impl ZerocopyCompletion {
    /// Head of the chain being sent.
    pub fn head(&self) -> u16 {
        self.head
    }
}

impl Drop for ZerocopyCompletion {
    fn drop(&mut self) {
        self.slots[self.slot]
            .state
            .store(SLOT_DONE, Ordering::Release);
        (self.ubuf.inner.notify)();
        // `self.ubuf` is released after this, possibly waking a detaching thread.
    }
}

/// Ring of in-flight zero-copy sends of one virtqueue.
///
/// Slots are taken at `upend_idx` and retired from `done_idx`, so chains are published in the
/// order their sends started no matter the order they complete in.
#[derive(Debug)]
pub struct ZerocopyRing {
    slots: Arc<[DmaSlot]>,
    upend_idx: usize,
    done_idx: usize,
    ubuf: Option<UbufRef>,
}

impl ZerocopyRing {
    /// Allocates a ring holding up to `capacity` in-flight sends.
    pub(crate) fn try_new(capacity: usize) -> Result<Self, std::collections::TryReserveError> {
        // One slot stays free to tell a full ring from an empty one.
        let len = capacity.saturating_add(1);
        let mut slots = Vec::new();
        slots.try_reserve_exact(len)?;
        slots.resize_with(len, DmaSlot::default);
        Ok(ZerocopyRing {
            slots: slots.into(),
            upend_idx: 0,
            done_idx: 0,
            ubuf: None,
        })
    }

    /// Arms the ring for a new attachment. Returns the reference of the previous one.
    pub(crate) fn enable(&mut self, notify: impl Fn() + Send + Sync + 'static) -> Option<UbufRef> {
        self.ubuf.replace(UbufRef::new(notify))
    }

    /// Disarms the ring. Returns the attachment's reference, to be drained by the caller.
    pub(crate) fn disable(&mut self) -> Option<UbufRef> {
        self.ubuf.take()
    }

    /// Whether no slot is free.
    pub fn is_full(&self) -> bool {
        (self.upend_idx + 1) % self.slots.len() == self.done_idx
    }

    /// Number of sends started but not yet published.
    pub fn pending(&self) -> usize {
        (self.upend_idx + self.slots.len() - self.done_idx) % self.slots.len()
    }

    /// Takes a slot for a send of chain `head`.
    pub(crate) fn start(&mut self, head: u16) -> Result<ZerocopyCompletion, VringError> {
        let ubuf = self.ubuf.as_ref().ok_or(VringError::ZerocopyDisabled)?;
        if self.is_full() {
            return Err(VringError::ZerocopyRingFull);
        }
        let slot = self.upend_idx;
        self.slots[slot].head.store(head, Ordering::Relaxed);
        self.slots[slot]
            .state
            .store(SLOT_IN_PROGRESS, Ordering::Relaxed);
        self.upend_idx = (slot + 1) % self.slots.len();
        Ok(ZerocopyCompletion {
            slots: Arc::clone(&self.slots),
            slot,
            head,
            ubuf: ubuf.get(),
        })
    }

    /// Retires the completed sends at the front of the ring into `done`, stopping at the first
    /// one still in flight.
    pub(crate) fn collect_done(&mut self, done: &mut Vec<UsedElement>) {
        let mut idx = self.done_idx;
        while idx != self.upend_idx {
            let slot = &self.slots[idx];
            if slot.state.load(Ordering::Acquire) != SLOT_DONE {
                break;
            }
            done.push(UsedElement {
                id: u32::from(slot.head.load(Ordering::Relaxed)),
                len: 0,
            });
            slot.state.store(SLOT_CLEAR, Ordering::Relaxed);
            idx = (idx + 1) % self.slots.len();
        }
        self.done_idx = idx;
    }
}
