// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc(hidden)]

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use vm_memory::{ByteValued, Bytes, GuestAddress, GuestMemory};
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

use crate::config::DeviceConfig;
use crate::device::{Device, VringHandler};
use crate::features::Features;
use crate::memory::{AddressSpaceRef, GuestMemoryMmap, regions_from_guest_memory};
use crate::vring::ring::{
    AVAIL_ALIGN, DESC_ALIGN, USED_ALIGN, VRING_DESC_F_INDIRECT, VRING_DESC_F_NEXT,
};
use crate::vring::{Descriptor, UsedElement, Virtqueue, VringAddr};

/// Guest address of the dirty log bitmap laid out by [`TestQueue`].
pub const LOG_GPA: u64 = 0xf000;

#[macro_export]
macro_rules! check_metric_after_block {
    ($metric:expr, $delta:expr, $block:expr) => {{
        let before = $metric.count();
        let _ = $block;
        assert_eq!($metric.count(), before + $delta, "unexpected metric value");
    }};
}

/// Creates a [`GuestMemoryMmap`] with a single region of the given size starting at guest
/// physical address 0.
pub fn single_region_mem(region_size: usize) -> Arc<GuestMemoryMmap> {
    Arc::new(GuestMemoryMmap::from_ranges(&[(GuestAddress(0), region_size)]).unwrap())
}

/// Creates a [`GuestMemoryMmap`] with a single region of size 65536 (= 0x10000 hex) starting
/// at guest physical address 0.
pub fn default_mem() -> Arc<GuestMemoryMmap> {
    single_region_mem(0x10000)
}

/// Device config with an id no other test uses, so metrics don't mix.
pub fn unique_config() -> DeviceConfig {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
    DeviceConfig {
        id: format!("test{}", NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        ..Default::default()
    }
}

/// Host address of guest address `addr`.
pub fn host_addr(mem: &GuestMemoryMmap, addr: u64) -> u64 {
    mem.get_host_address(GuestAddress(addr)).unwrap() as u64
}

/// A `T` at a fixed guest address.
#[derive(Debug)]
pub struct GuestField<'a, T> {
    pub gpa: GuestAddress,
    mem: &'a GuestMemoryMmap,
    ty: PhantomData<T>,
}

impl<'a, T: ByteValued> GuestField<'a, T> {
    fn at(mem: &'a GuestMemoryMmap, addr: u64) -> Self {
        GuestField {
            gpa: GuestAddress(addr),
            mem,
            ty: PhantomData,
        }
    }

    pub fn get(&self) -> T {
        self.mem.read_obj(self.gpa).unwrap()
    }

    pub fn set(&self, val: T) {
        self.mem.write_obj(val, self.gpa).unwrap()
    }
}

/// Descriptor table entry as the driver sees it.
#[derive(Debug)]
pub struct GuestDesc<'a> {
    pub addr: GuestField<'a, u64>,
    pub len: GuestField<'a, u32>,
    pub flags: GuestField<'a, u16>,
    pub next: GuestField<'a, u16>,
}

impl<'a> GuestDesc<'a> {
    fn at(mem: &'a GuestMemoryMmap, base: u64) -> Self {
        assert_eq!(base % DESC_ALIGN, 0);
        GuestDesc {
            addr: GuestField::at(mem, base),
            len: GuestField::at(mem, base + 8),
            flags: GuestField::at(mem, base + 12),
            next: GuestField::at(mem, base + 14),
        }
    }

    pub fn set(&self, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = Descriptor {
            addr,
            len,
            flags,
            next,
        };
        self.mem().write_obj(desc, self.addr.gpa).unwrap();
    }

    /// Asserts the buffer starts with `expected`.
    pub fn check_data(&self, expected: &[u8]) {
        assert!(self.len.get() as usize >= expected.len());
        let mut buf = vec![0u8; expected.len()];
        self.mem()
            .read_slice(&mut buf, GuestAddress(self.addr.get()))
            .unwrap();
        assert_eq!(buf, expected);
    }

    fn mem(&self) -> &'a GuestMemoryMmap {
        self.addr.mem
    }
}

/// Avail or used ring: `flags`, `idx`, `num` entries and the trailing event field.
#[derive(Debug)]
pub struct GuestRing<'a, T> {
    pub flags: GuestField<'a, u16>,
    pub idx: GuestField<'a, u16>,
    pub ring: Vec<GuestField<'a, T>>,
    pub event: GuestField<'a, u16>,
}

impl<'a, T: ByteValued> GuestRing<'a, T> {
    fn at(mem: &'a GuestMemoryMmap, base: u64, num: u16, align: u64) -> Self {
        assert_eq!(base % align, 0);
        let entry = std::mem::size_of::<T>() as u64;
        let ring = (0..u64::from(num))
            .map(|i| GuestField::at(mem, base + 4 + i * entry))
            .collect();
        let this = GuestRing {
            flags: GuestField::at(mem, base),
            idx: GuestField::at(mem, base + 2),
            ring,
            event: GuestField::at(mem, base + 4 + u64::from(num) * entry),
        };
        this.flags.set(0);
        this.idx.set(0);
        this.event.set(0);
        this
    }

    fn start(&self) -> u64 {
        self.flags.gpa.0
    }

    fn end(&self) -> u64 {
        self.event.gpa.0 + 2
    }
}

/// Driver side of a split virtqueue laid out in guest memory.
#[derive(Debug)]
pub struct GuestQueue<'a> {
    pub dtable: Vec<GuestDesc<'a>>,
    pub avail: GuestRing<'a, u16>,
    pub used: GuestRing<'a, UsedElement>,
    mem: &'a GuestMemoryMmap,
    next_desc: Cell<u16>,
}

impl<'a> GuestQueue<'a> {
    /// Lays out a queue of `num` entries at `base`, used ring aligned after the avail ring.
    pub fn new(mem: &'a GuestMemoryMmap, base: u64, num: u16) -> Self {
        assert!(num.is_power_of_two());
        let dtable = (0..u64::from(num))
            .map(|i| GuestDesc::at(mem, base + 16 * i))
            .collect();
        let avail = GuestRing::at(mem, base + 16 * u64::from(num), num, AVAIL_ALIGN);
        let used_base = avail.end().next_multiple_of(USED_ALIGN);
        let used = GuestRing::at(mem, used_base, num, USED_ALIGN);
        GuestQueue {
            dtable,
            avail,
            used,
            mem,
            next_desc: Cell::new(0),
        }
    }

    pub fn size(&self) -> u16 {
        u16::try_from(self.dtable.len()).unwrap()
    }

    /// First guest address past the used ring.
    pub fn end(&self) -> u64 {
        self.used.end()
    }

    /// Ring addresses as the owner passes them to `SetVringAddr`.
    pub fn vring_addr(&self) -> VringAddr {
        VringAddr {
            flags: 0,
            desc_user_addr: host_addr(self.mem, self.dtable[0].addr.gpa.0),
            avail_user_addr: host_addr(self.mem, self.avail.start()),
            used_user_addr: host_addr(self.mem, self.used.start()),
            log_guest_addr: self.used.start(),
        }
    }

    /// Makes `head` available.
    pub fn publish_avail(&self, head: u16) {
        let idx = self.avail.idx.get();
        self.avail.ring[usize::from(idx % self.size())].set(head);
        self.avail.idx.set(idx.wrapping_add(1));
    }

    /// Links `(addr, len, flags)` descriptors into a chain using the next free table entries,
    /// makes it available and returns its head.
    pub fn add_chain(&self, descs: &[(u64, u32, u16)]) -> u16 {
        let size = self.size();
        let head = self.next_desc.get();
        for (i, &(addr, len, flags)) in descs.iter().enumerate() {
            let index = (head + u16::try_from(i).unwrap()) % size;
            let next = (index + 1) % size;
            let flags = if i + 1 < descs.len() {
                flags | VRING_DESC_F_NEXT
            } else {
                flags
            };
            self.dtable[usize::from(index)].set(addr, len, flags, next);
        }
        self.next_desc
            .set((head + u16::try_from(descs.len()).unwrap()) % size);
        self.publish_avail(head);
        head
    }

    /// Writes `descs` as an indirect table at `table` and makes a chain made of one indirect
    /// descriptor pointing at it available.
    pub fn add_indirect_chain(&self, table: u64, descs: &[(u64, u32, u16)]) -> u16 {
        for (i, &(addr, len, flags)) in descs.iter().enumerate() {
            let next = u16::try_from(i + 1).unwrap();
            let flags = if i + 1 < descs.len() {
                flags | VRING_DESC_F_NEXT
            } else {
                flags
            };
            let desc = Descriptor {
                addr,
                len,
                flags,
                next,
            };
            self.mem
                .write_obj(desc, GuestAddress(table + 16 * i as u64))
                .unwrap();
        }
        let len = u32::try_from(16 * descs.len()).unwrap();
        self.add_chain(&[(table, len, VRING_DESC_F_INDIRECT)])
    }

    /// Used element `i` of the used ring.
    pub fn used_elem(&self, i: u16) -> UsedElement {
        self.used.ring[usize::from(i % self.size())].get()
    }
}

/// A device with a single virtqueue wired to a [`GuestQueue`] in `mem`.
///
/// The rings live at guest address 0, the dirty log at [`LOG_GPA`]; buffers are expected
/// between 0x2000 and the log.
#[derive(Debug)]
pub struct TestQueue<'a> {
    pub device: Device,
    pub mm: AddressSpaceRef,
    pub guest: GuestQueue<'a>,
    pub kick: EventFd,
    pub call: EventFd,
    pub err: EventFd,
    mem: &'a GuestMemoryMmap,
}

impl<'a> TestQueue<'a> {
    pub fn new(mem: &'a Arc<GuestMemoryMmap>, num: u16) -> Self {
        Self::with_features(mem, num, Features::empty())
    }

    pub fn with_features(mem: &'a Arc<GuestMemoryMmap>, num: u16, features: Features) -> Self {
        Self::with_handler(mem, num, features, Arc::new(|_: &Virtqueue| {}))
    }

    pub fn with_handler(
        mem: &'a Arc<GuestMemoryMmap>,
        num: u16,
        features: Features,
        handler: Arc<dyn VringHandler>,
    ) -> Self {
        Self::with_config(mem, num, features, unique_config(), handler)
    }

    pub fn with_config(
        mem: &'a Arc<GuestMemoryMmap>,
        num: u16,
        features: Features,
        config: DeviceConfig,
        handler: Arc<dyn VringHandler>,
    ) -> Self {
        let device = Device::new(config, vec![handler]).unwrap();
        let mm: AddressSpaceRef = Arc::clone(mem) as AddressSpaceRef;
        let guest = GuestQueue::new(mem, 0, num);
        assert!(guest.end() <= 0x2000);

        device.set_owner(Arc::clone(&mm)).unwrap();
        device
            .set_mem_table(&mm, regions_from_guest_memory(mem).unwrap())
            .unwrap();
        device.set_features(&mm, features.bits()).unwrap();
        device.set_vring_num(&mm, 0, u32::from(num)).unwrap();
        device.set_vring_addr(&mm, 0, guest.vring_addr()).unwrap();
        device.set_vring_base(&mm, 0, 0).unwrap();

        let kick = EventFd::new(EFD_NONBLOCK).unwrap();
        let call = EventFd::new(EFD_NONBLOCK).unwrap();
        let err = EventFd::new(EFD_NONBLOCK).unwrap();
        device
            .set_vring_kick(&mm, 0, Some(kick.try_clone().unwrap()))
            .unwrap();
        device
            .set_vring_call(&mm, 0, Some(call.try_clone().unwrap()))
            .unwrap();
        device
            .set_vring_err(&mm, 0, Some(err.try_clone().unwrap()))
            .unwrap();

        TestQueue {
            device,
            mm,
            guest,
            kick,
            call,
            err,
            mem,
        }
    }

    /// Attaches a backend to the queue and returns it.
    pub fn activate(&self) -> &Arc<Virtqueue> {
        self.attach(false)
    }

    /// Attaches a zero-copy backend to the queue and returns it.
    pub fn activate_zerocopy(&self) -> &Arc<Virtqueue> {
        self.attach(true)
    }

    fn attach(&self, zerocopy: bool) -> &Arc<Virtqueue> {
        self.device
            .set_vring_backend(&self.mm, 0, Some(Arc::new(())), zerocopy)
            .unwrap();
        self.device.vq(0).unwrap()
    }

    /// Host address of the dirty log bitmap.
    pub fn log_base(&self) -> u64 {
        host_addr(self.mem, LOG_GPA)
    }

    /// Reads the dirty log byte covering pages `8 * byte .. 8 * byte + 8`.
    pub fn log_byte(&self, byte: u64) -> u8 {
        self.mem.read_obj(GuestAddress(LOG_GPA + byte)).unwrap()
    }
}
