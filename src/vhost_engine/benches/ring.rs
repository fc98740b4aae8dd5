// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Benchmarking cases:
//   * `VirtqueueState.get_available_chain`
//   * `VirtqueueState.publish_used_many`
//   * `VirtqueueState.add_used_and_signal`

use criterion::{Criterion, criterion_group, criterion_main};
use vhost_engine::Features;
use vhost_engine::test_utils::{TestQueue, default_mem};
use vhost_engine::vring::UsedElement;
use vhost_engine::vring::ring::VRING_DESC_F_WRITE;

pub fn ring_benchmark(c: &mut Criterion) {
    let mem = default_mem();

    let tq = TestQueue::new(&mem, 256);
    let vq = tq.activate();
    let descs: Vec<_> = (0..16_u64)
        .map(|i| (0x2000 + i * 0x100, 0x100, VRING_DESC_F_WRITE))
        .collect();
    tq.guest.add_chain(&descs);
    let mut state = vq.lock();
    c.bench_function("pop_chain_16_descs", |b| {
        b.iter(|| {
            let chain = state.get_available_chain().unwrap().unwrap();
            std::hint::black_box(chain.writable_len());
            state.recycle(chain);
            state.discard_chains(1);
        })
    });
    drop(state);

    let tq = TestQueue::new(&mem, 256);
    let vq = tq.activate();
    for i in 0..16_u64 {
        tq.guest.add_chain(&[(0x2000 + i * 0x100, 0x100, 0)]);
    }
    let mut state = vq.lock();
    c.bench_function("pop_16_chains", |b| {
        b.iter(|| {
            while let Some(chain) = state.get_available_chain().unwrap() {
                std::hint::black_box(chain.head());
                state.recycle(chain);
            }
            state.discard_chains(16);
        })
    });
    drop(state);

    let tq = TestQueue::new(&mem, 256);
    let vq = tq.activate();
    let mut state = vq.lock();
    let batch: Vec<_> = (0_u32..16)
        .map(|i| UsedElement { id: i, len: i + 1 })
        .collect();
    c.bench_function("publish_used_16", |b| {
        b.iter(|| {
            for elem in &batch {
                _ = state.publish_used(std::hint::black_box(elem.id as u16), elem.len);
            }
        })
    });

    c.bench_function("publish_used_many_16", |b| {
        b.iter(|| {
            _ = state.publish_used_many(std::hint::black_box(&batch));
        })
    });
    drop(state);

    let tq = TestQueue::with_features(&mem, 256, Features::EVENT_IDX);
    let vq = tq.activate();
    let mut state = vq.lock();
    c.bench_function("add_used_and_signal_event_idx", |b| {
        b.iter(|| {
            _ = state.add_used_and_signal(std::hint::black_box(0), 0);
        })
    });
}

criterion_group! {
    name = ring_benches;
    config = Criterion::default().sample_size(200).noise_threshold(0.15);
    targets = ring_benchmark
}

criterion_main! {
    ring_benches
}
