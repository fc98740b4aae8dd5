// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use vhost_engine::config::DeviceConfig;
use vhost_engine::features::Features;
use vhost_engine::logger::IncMetric;
use vhost_engine::memory::regions_from_guest_memory;
use vhost_engine::test_utils::{TestQueue, default_mem, unique_config};
use vhost_engine::translate::TranslateError;
use vhost_engine::vring::ring::{VHOST_VRING_F_LOG, VRING_DESC_F_NEXT, VRING_DESC_F_WRITE};
use vhost_engine::vring::UsedElement;
use vhost_engine::{DeviceState, Virtqueue, VringAddr, VringError, VringHandler};
use vm_memory::{Bytes, GuestAddress};
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

fn wait_for(evt: &EventFd) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(count) = evt.read() {
            return count;
        }
        assert!(Instant::now() < deadline, "eventfd was never signalled");
        thread::sleep(Duration::from_millis(1));
    }
}

// Copies each chain's readable bytes into its writable buffers and completes it.
#[derive(Debug, Default)]
struct Loopback {
    heads: Mutex<Vec<u16>>,
}

impl VringHandler for Loopback {
    fn handle_kick(&self, vq: &Virtqueue) {
        let mut state = vq.lock();
        state.disable_notify();
        loop {
            let chain = match state.get_available_chain() {
                Ok(Some(chain)) => chain,
                Ok(None) => {
                    if state.enable_notify() {
                        state.disable_notify();
                        continue;
                    }
                    break;
                }
                Err(_) => break,
            };
            let mut buf = vec![0u8; usize::try_from(chain.readable_len()).unwrap()];
            let read = chain.read_at(0, &mut buf);
            let written = chain.write_at(0, &buf[..read]);
            self.heads.lock().unwrap().push(chain.head());
            let head = chain.head();
            state.recycle(chain);
            state
                .add_used_and_signal(head, u32::try_from(written).unwrap())
                .unwrap();
        }
    }
}

#[test]
fn test_ring_of_four_two_kicks() {
    let mem = default_mem();
    let handler = Arc::new(Loopback::default());
    let tq = TestQueue::with_handler(&mem, 4, Features::empty(), handler.clone());
    let vq = tq.activate();
    let used_before = vq.lock().last_used_idx();

    mem.write_slice(b"first", GuestAddress(0x2000)).unwrap();
    mem.write_slice(b"second", GuestAddress(0x2100)).unwrap();
    tq.guest.dtable[2].set(0x2000, 5, VRING_DESC_F_NEXT, 3);
    tq.guest.dtable[3].set(0x3000, 16, VRING_DESC_F_WRITE, 0);
    tq.guest.dtable[0].set(0x2100, 6, VRING_DESC_F_NEXT, 1);
    tq.guest.dtable[1].set(0x3100, 16, VRING_DESC_F_WRITE, 0);

    tq.guest.publish_avail(2);
    tq.kick.write(1).unwrap();
    wait_for(&tq.call);
    assert_eq!(tq.guest.used.idx.get(), used_before.wrapping_add(1));

    tq.guest.publish_avail(0);
    tq.kick.write(1).unwrap();
    wait_for(&tq.call);

    assert_eq!(*handler.heads.lock().unwrap(), vec![2, 0]);
    assert_eq!(tq.guest.used.idx.get(), used_before.wrapping_add(2));
    assert_eq!(tq.guest.used_elem(0), UsedElement { id: 2, len: 5 });
    assert_eq!(tq.guest.used_elem(1), UsedElement { id: 0, len: 6 });
    tq.guest.dtable[3].check_data(b"first");
    tq.guest.dtable[1].check_data(b"second");
    assert_eq!(vq.lock().last_used_idx(), used_before.wrapping_add(2));
    assert!(tq.device.metrics().kick_count.count() >= 2);
}

#[test]
fn test_zerocopy_completes_in_order() {
    let mem = default_mem();
    let tq = TestQueue::new(&mem, 4);
    let vq = tq.activate_zerocopy();
    let first = tq.guest.add_chain(&[(0x2000, 16, 0)]);
    let second = tq.guest.add_chain(&[(0x2100, 16, 0)]);

    let mut state = vq.lock();
    let chain = state.get_available_chain().unwrap().unwrap();
    let first_done = state.zerocopy_start(chain.head()).unwrap();
    state.recycle(chain);
    let chain = state.get_available_chain().unwrap().unwrap();
    let second_done = state.zerocopy_start(chain.head()).unwrap();
    state.recycle(chain);

    // The later send finishes first: nothing is published.
    drop(second_done);
    assert_eq!(state.zerocopy_signal_used().unwrap(), 0);
    assert_eq!(tq.guest.used.idx.get(), 0);

    drop(first_done);
    assert_eq!(state.zerocopy_signal_used().unwrap(), 2);
    assert_eq!(tq.guest.used.idx.get(), 2);
    assert_eq!(tq.guest.used_elem(0).id, u32::from(first));
    assert_eq!(tq.guest.used_elem(1).id, u32::from(second));
    drop(state);

    let metrics = tq.device.metrics();
    assert_eq!(metrics.zerocopy_started.count(), 2);
    assert_eq!(metrics.zerocopy_completed.count(), 2);
}

#[test]
fn test_detach_waits_for_zerocopy() {
    let mem = default_mem();
    let tq = TestQueue::new(&mem, 4);
    let vq = tq.activate_zerocopy();
    tq.guest.add_chain(&[(0x2000, 16, 0)]);

    let completion = {
        let mut state = vq.lock();
        let chain = state.get_available_chain().unwrap().unwrap();
        state.zerocopy_start(chain.head()).unwrap()
    };
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let completer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
        drop(completion);
    });

    tq.device.set_vring_backend(&tq.mm, 0, None, false).unwrap();
    assert!(released.load(Ordering::SeqCst));
    completer.join().unwrap();
    // Published on the way out.
    assert_eq!(tq.guest.used.idx.get(), 1);
    assert!(matches!(
        vq.lock().zerocopy_start(0),
        Err(VringError::ZerocopyDisabled)
    ));
}

#[test]
fn test_memory_table_replace_waits_for_chains() {
    let mem = default_mem();
    let tq = TestQueue::new(&mem, 4);
    let vq = tq.activate();
    mem.write_slice(b"stable", GuestAddress(0x2000)).unwrap();
    tq.guest.add_chain(&[(0x2000, 6, 0)]);

    let chain = vq.lock().get_available_chain().unwrap().unwrap();
    let replaced = AtomicBool::new(false);
    let regions = regions_from_guest_memory(&mem).unwrap();

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            tq.device.set_mem_table(&tq.mm, regions).unwrap();
            replaced.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        // The chain still holds the previous table.
        assert!(!replaced.load(Ordering::SeqCst));
        let mut buf = [0u8; 6];
        assert_eq!(chain.read_at(0, &mut buf), 6);
        assert_eq!(&buf, b"stable");
        drop(chain);
        writer.join().unwrap();
    });
    assert!(replaced.load(Ordering::SeqCst));
}

#[test]
fn test_too_many_spans() {
    let mem = default_mem();
    let config = DeviceConfig {
        max_chain_len: 2,
        ..unique_config()
    };
    let tq = TestQueue::with_config(
        &mem,
        4,
        Features::empty(),
        config,
        Arc::new(|_: &Virtqueue| {}),
    );
    let vq = tq.activate();
    tq.guest
        .add_chain(&[(0x2000, 4, 0), (0x2100, 4, 0), (0x2200, 4, 0)]);

    let mut state = vq.lock();
    assert!(matches!(
        state.get_available_chain(),
        Err(VringError::Translate(TranslateError::TooManySpans(2)))
    ));
    assert_eq!(state.last_avail_idx(), 0);
    assert_eq!(tq.err.read().unwrap(), 1);
}

#[test]
fn test_used_ring_logging() {
    let mem = default_mem();
    let tq = TestQueue::new(&mem, 4);
    let log_evt = EventFd::new(EFD_NONBLOCK).unwrap();
    let addr = VringAddr {
        flags: VHOST_VRING_F_LOG,
        ..tq.guest.vring_addr()
    };
    tq.device.set_vring_addr(&tq.mm, 0, addr).unwrap();
    tq.device.set_log_base(&tq.mm, tq.log_base()).unwrap();
    tq.device
        .set_log_fd(&tq.mm, Some(log_evt.try_clone().unwrap()))
        .unwrap();

    let vq = tq.activate();
    // The used flags write at attach dirtied the ring's page.
    assert_eq!(tq.log_byte(0), 1);
    assert_eq!(wait_for(&log_evt), 1);

    vq.lock().publish_used(0, 0).unwrap();
    // Same page: nothing new to signal.
    assert!(log_evt.read().is_err());
    assert_eq!(tq.log_byte(0), 1);
}

#[test]
fn test_reset_owner() {
    let mem = default_mem();
    let tq = TestQueue::new(&mem, 4);
    let vq = tq.activate();
    tq.guest.add_chain(&[(0x2000, 4, 0)]);
    assert_eq!(tq.device.state(), DeviceState::Active);

    tq.device.reset_owner(&tq.mm).unwrap();
    assert_eq!(tq.device.state(), DeviceState::Unowned);
    assert!(tq.device.memory_table().regions().is_empty());
    assert_eq!(tq.device.acked_features(), Features::empty());
    {
        let mut state = vq.lock();
        assert!(!state.has_backend());
        assert_eq!(state.num(), 1);
        assert!(matches!(
            state.get_available_chain(),
            Err(VringError::NoOwner)
        ));
    }

    // Kicks are no longer polled.
    let before = tq.device.metrics().kick_count.count();
    tq.kick.write(1).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(tq.device.metrics().kick_count.count(), before);

    // The device can be owned again from scratch.
    tq.device.set_owner(tq.mm.clone()).unwrap();
    assert_eq!(tq.device.state(), DeviceState::Owned);
}

#[test]
fn test_kick_swap_is_live() {
    let mem = default_mem();
    let handler = Arc::new(Loopback::default());
    let tq = TestQueue::with_handler(&mem, 4, Features::empty(), handler.clone());
    tq.activate();

    let new_kick = EventFd::new(EFD_NONBLOCK).unwrap();
    tq.device
        .set_vring_kick(&tq.mm, 0, Some(new_kick.try_clone().unwrap()))
        .unwrap();
    tq.guest.add_chain(&[(0x2000, 4, 0)]);
    new_kick.write(1).unwrap();
    wait_for(&tq.call);
    assert_eq!(handler.heads.lock().unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_publish_used_many(
        batch in prop::collection::vec((0u32..8, any::<u32>()), 1..=8),
        start in any::<u16>(),
    ) {
        let mem = default_mem();
        let tq = TestQueue::new(&mem, 8);
        // The engine picks up whatever used index the guest left.
        tq.guest.used.idx.set(start);
        let vq = tq.activate();

        let elems: Vec<_> = batch
            .iter()
            .map(|&(id, len)| UsedElement { id, len })
            .collect();
        vq.lock().publish_used_many(&elems).unwrap();

        let count = u16::try_from(elems.len()).unwrap();
        prop_assert_eq!(tq.guest.used.idx.get(), start.wrapping_add(count));
        for (i, elem) in elems.iter().enumerate() {
            let idx = start.wrapping_add(u16::try_from(i).unwrap());
            prop_assert_eq!(tq.guest.used_elem(idx), *elem);
        }
    }
}
