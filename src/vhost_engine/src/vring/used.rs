// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::num::Wrapping;
use std::sync::atomic::{Ordering, fence};

use super::ring::{RingView, USED_ELEM_SIZE, UsedElement, used_elem_offset};
use super::{VirtqueueState, VringError};
use crate::logger::IncMetric;
use crate::utils::usize_to_u64;

impl VirtqueueState {
    /// Publishes chain `head` as used with `len` bytes written, without signalling the guest.
    pub fn publish_used(&mut self, head: u16, len: u32) -> Result<(), VringError> {
        self.publish_used_many(&[UsedElement {
            id: u32::from(head),
            len,
        }])
    }

    /// Publishes a batch of used elements with a single used index update, without signalling
    /// the guest.
    pub fn publish_used_many(&mut self, elems: &[UsedElement]) -> Result<(), VringError> {
        let result = self.add_used_n(elems);
        if let Err(err) = &result {
            self.vq_err(err);
        }
        result
    }

    /// Publishes chain `head` as used and signals the guest if it asked for it.
    pub fn add_used_and_signal(&mut self, head: u16, len: u32) -> Result<(), VringError> {
        self.publish_used(head, len)?;
        self.signal();
        Ok(())
    }

    /// Publishes a batch of used elements and signals the guest if it asked for it.
    pub fn add_used_and_signal_n(&mut self, elems: &[UsedElement]) -> Result<(), VringError> {
        self.publish_used_many(elems)?;
        self.signal();
        Ok(())
    }

    fn add_used_n(&mut self, elems: &[UsedElement]) -> Result<(), VringError> {
        if elems.is_empty() {
            return Ok(());
        }
        if elems.len() > usize::from(self.num) {
            return Err(VringError::UsedBatch(elems.len()));
        }
        if let Some(elem) = elems.iter().find(|elem| elem.id >= u32::from(self.num)) {
            return Err(VringError::UsedId {
                id: elem.id,
                num: self.num,
            });
        }

        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;

        let old = self.last_used_idx;
        let mut idx = old;
        for elem in elems {
            ring.set_used_elem(idx, *elem)?;
            idx += Wrapping(1);
        }
        // Elements must be visible before the index that publishes them.
        fence(Ordering::Release);
        ring.set_used_idx(idx)?;

        if self.log_used {
            let mut dirtied = false;
            // The batch may wrap around the end of the ring.
            let mut pos = old;
            while pos != idx {
                let slot = usize::from(pos.0 % self.num);
                let run = (usize::from(self.num) - slot).min(usize::from((idx - pos).0));
                dirtied |= self.log_used_ring(
                    &*mm,
                    usize_to_u64(used_elem_offset(pos, self.num)),
                    usize_to_u64(run) * USED_ELEM_SIZE,
                )?;
                pos += Wrapping(u16::try_from(run).unwrap_or(u16::MAX));
            }
            dirtied |= self.log_used_ring(&*mm, 2, 2)?;
            self.log_done(dirtied);
        }

        self.last_used_idx = idx;
        // The guest must be signalled if the used index passed the signalled one.
        if (idx - self.signalled_used) < (idx - old) {
            self.signalled_used_valid = false;
        }
        self.shared
            .metrics
            .used_count
            .add(usize_to_u64(elems.len()));
        Ok(())
    }

    /// Writes the used flags and resynchronizes with the used index in guest memory.
    pub(crate) fn init_used(&mut self) -> Result<(), VringError> {
        let mm = self.address_space()?;
        let ring = RingView::new(&*mm, &self.addr, self.num)?;
        ring.set_used_flags(self.used_flags)?;
        if self.log_used {
            let dirtied = self.log_used_ring(&*mm, 0, 2)?;
            self.log_done(dirtied);
        }
        self.signalled_used_valid = false;
        self.last_used_idx = ring.used_idx()?;
        Ok(())
    }
}
