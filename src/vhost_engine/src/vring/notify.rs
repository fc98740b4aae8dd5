// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest notification suppression.

use std::num::Wrapping;
use std::sync::atomic::{Ordering, fence};

use log::debug;

use super::ring::{RingView, VRING_AVAIL_F_NO_INTERRUPT, VRING_USED_F_NO_NOTIFY, avail_event_offset};
use super::{VirtqueueState, VringError};
use crate::features::Features;
use crate::logger::IncMetric;
use crate::utils::usize_to_u64;

/// Returns whether moving an index from `old` to `new` crosses the event index `event`.
///
/// All arithmetic wraps, so the comparison holds across the 16 bit boundary.
pub fn need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

impl VirtqueueState {
    /// Signals the guest through the call eventfd, unless it suppressed notifications.
    pub fn signal(&mut self) {
        if !self.should_signal() {
            self.shared.metrics.signal_suppressed_count.inc();
            return;
        }
        if let Some(call) = &self.call {
            if let Err(err) = call.write(1) {
                debug!(
                    "vhost {}: vq {}: failed to signal call eventfd: {err}",
                    self.shared.id, self.index
                );
                self.shared.metrics.worker_fails.inc();
                return;
            }
            self.shared.metrics.signal_count.inc();
        }
    }

    fn should_signal(&mut self) -> bool {
        match self.try_should_signal() {
            Ok(signal) => signal,
            Err(err) => {
                // Can't tell whether the guest wants it, err on the side of waking it.
                self.vq_err(&err);
                true
            }
        }
    }

    fn try_should_signal(&mut self) -> Result<bool, VringError> {
        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;

        // Used ring writes must be visible before the guest's flags or event are read.
        fence(Ordering::SeqCst);

        // Empty as of the last walk, not the guest's current index.
        if self.acked(Features::NOTIFY_ON_EMPTY) && self.avail_idx == self.last_avail_idx {
            return Ok(true);
        }

        if !self.acked(Features::EVENT_IDX) {
            return Ok(ring.avail_flags()? & VRING_AVAIL_F_NO_INTERRUPT == 0);
        }

        let old = self.signalled_used;
        let was_valid = self.signalled_used_valid;
        let new = self.last_used_idx;
        self.signalled_used = new;
        self.signalled_used_valid = true;
        if !was_valid {
            return Ok(true);
        }

        let event = ring.used_event()?;
        Ok(need_event(event, new.0, old.0))
    }

    /// Asks the guest to kick again for new buffers.
    ///
    /// Returns `true` if buffers were made available in the meantime, in which case the caller
    /// should process them instead of waiting for a kick.
    pub fn enable_notify(&mut self) -> bool {
        if self.used_flags & VRING_USED_F_NO_NOTIFY == 0 {
            return false;
        }
        self.used_flags &= !VRING_USED_F_NO_NOTIFY;
        match self.try_enable_notify() {
            Ok(pending) => pending,
            Err(err) => {
                self.vq_err(&err);
                false
            }
        }
    }

    fn try_enable_notify(&mut self) -> Result<bool, VringError> {
        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;

        let (offset, len) = if self.acked(Features::EVENT_IDX) {
            ring.set_avail_event(self.avail_idx)?;
            (usize_to_u64(avail_event_offset(self.num)), 2)
        } else {
            ring.set_used_flags(self.used_flags)?;
            (0, 2)
        };
        if self.log_used {
            let dirtied = self.log_used_ring(&*mm, offset, len)?;
            self.log_done(dirtied);
        }

        // The flags or event write must be visible before the avail index is checked again.
        fence(Ordering::SeqCst);

        let avail_idx: Wrapping<u16> = ring.avail_idx()?;
        Ok(avail_idx != self.avail_idx)
    }

    /// Tells the guest not to kick. Best effort: the guest may still kick afterwards.
    pub fn disable_notify(&mut self) {
        if self.used_flags & VRING_USED_F_NO_NOTIFY != 0 {
            return;
        }
        self.used_flags |= VRING_USED_F_NO_NOTIFY;
        if self.acked(Features::EVENT_IDX) {
            return;
        }
        if let Err(err) = self.try_disable_notify() {
            self.vq_err(&err);
        }
    }

    fn try_disable_notify(&self) -> Result<(), VringError> {
        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;
        ring.set_used_flags(self.used_flags)?;
        if self.log_used {
            let dirtied = self.log_used_ring(&*mm, 0, 2)?;
            self.log_done(dirtied);
        }
        Ok(())
    }
}
