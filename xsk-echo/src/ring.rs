//! # Kernel-shared ring queues
//!
//! The four AF_XDP rings (RX, TX, Fill, Completion) are single-producer,
//! single-consumer circular buffers mapped into both the kernel and this
//! process. Each side writes exactly one index: the producer index is stored
//! with Release ordering after the descriptor payload, and the other side
//! loads it with Acquire, so a consumer never observes an advanced index
//! before the corresponding descriptor write.
//!
//! `Ring<T>` is the raw mapping. `ProducerRing` and `ConsumerRing` layer the
//! cached-index protocol on top: each keeps a process-local copy of the
//! remote side's index and refreshes it from the live shared index only when
//! local capacity appears exhausted, avoiding a cross-core load per element.
//!
//! Fill and Completion rings carry bare `u64` frame addresses; RX and TX
//! rings carry `XdpDesc` entries.

use crate::mmap::OwnedMmap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::{io, ptr};

/// The mapped memory of one ring: producer/consumer indices, flags word and
/// the descriptor array, all at kernel-defined offsets inside one mmap.
pub struct RingMmap<T> {
    pub mmap: OwnedMmap,
    pub producer: *mut AtomicU32,
    pub consumer: *mut AtomicU32,
    pub desc: *mut T,
    pub flags: *mut AtomicU32,
}

/// One RX/TX descriptor: a frame address, the packet length and option bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

impl XdpDesc {
    pub fn new(addr: u64, len: u32) -> Self {
        XdpDesc {
            addr,
            len,
            options: 0,
        }
    }
}

/// A raw mapped ring of `len` descriptors. `len` must be a power of two;
/// indices are free-running `u32` values masked into the descriptor array.
pub struct Ring<T> {
    pub mmap: RingMmap<T>,
    pub len: usize,
    pub mask: u32,
}

impl<T> Ring<T>
where
    T: Copy,
{
    pub fn mmap(
        fd: i32,
        len: usize,
        ring_type: u64,
        offsets: &libc::xdp_ring_offset,
    ) -> Result<Self, io::Error> {
        debug_assert!(len.is_power_of_two());
        Ok(Ring {
            mmap: mmap_ring(fd, len * size_of::<T>(), offsets, ring_type)?,
            len,
            mask: len as u32 - 1,
        })
    }

    pub fn consumer(&self) -> u32 {
        unsafe { (*self.mmap.consumer).load(Ordering::Acquire) }
    }

    pub fn producer(&self) -> u32 {
        unsafe { (*self.mmap.producer).load(Ordering::Acquire) }
    }

    /// Publishes the producer index. The Release store is the barrier that
    /// makes preceding descriptor writes visible before the index advance.
    pub fn update_producer(&mut self, value: u32) {
        unsafe {
            (*self.mmap.producer).store(value, Ordering::Release);
        }
    }

    pub fn update_consumer(&mut self, value: u32) {
        unsafe {
            (*self.mmap.consumer).store(value, Ordering::Release);
        }
    }

    pub fn flags(&self) -> u32 {
        unsafe { (*self.mmap.flags).load(Ordering::Relaxed) }
    }

    pub fn mut_desc_at(&mut self, index: u32) -> &mut T {
        let slot = index & self.mask;
        unsafe { &mut *self.mmap.desc.add(slot as usize) }
    }

    pub fn desc_at(&self, index: u32) -> T {
        let slot = index & self.mask;
        unsafe { *self.mmap.desc.add(slot as usize) }
    }
}

pub fn mmap_ring<T>(
    fd: i32,
    size: usize,
    offsets: &libc::xdp_ring_offset,
    ring_type: u64,
) -> Result<RingMmap<T>, io::Error> {
    let map_size = (offsets.desc as usize).saturating_add(size);
    let map_addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            ring_type as i64,
        )
    };
    if map_addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let producer = unsafe { map_addr.add(offsets.producer as usize) as *mut AtomicU32 };
    let consumer = unsafe { map_addr.add(offsets.consumer as usize) as *mut AtomicU32 };
    let desc = unsafe { map_addr.add(offsets.desc as usize) as *mut T };
    let flags = unsafe { map_addr.add(offsets.flags as usize) as *mut AtomicU32 };
    Ok(RingMmap {
        mmap: OwnedMmap(map_addr, map_size),
        producer,
        consumer,
        desc,
        flags,
    })
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RingType {
    Tx,
    Rx,
    Fill,
    Completion,
}

impl RingType {
    fn as_index(&self) -> libc::c_int {
        match self {
            RingType::Tx => libc::XDP_TX_RING,
            RingType::Rx => libc::XDP_RX_RING,
            RingType::Fill => libc::XDP_UMEM_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_COMPLETION_RING,
        }
    }

    fn as_offset(&self) -> u64 {
        match self {
            RingType::Tx => libc::XDP_PGOFF_TX_RING as u64,
            RingType::Rx => libc::XDP_PGOFF_RX_RING as u64,
            RingType::Fill => libc::XDP_UMEM_PGOFF_FILL_RING,
            RingType::Completion => libc::XDP_UMEM_PGOFF_COMPLETION_RING,
        }
    }

    pub fn set_size(self, raw_fd: libc::c_int, ring_size: usize) -> io::Result<()> {
        unsafe {
            if libc::setsockopt(
                raw_fd,
                libc::SOL_XDP,
                self.as_index(),
                &ring_size as *const _ as *const libc::c_void,
                size_of::<u32>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn mmap<T: Copy>(
        self,
        raw_fd: libc::c_int,
        offsets: &libc::xdp_mmap_offsets,
        ring_size: usize,
    ) -> io::Result<Ring<T>> {
        let ring_offs = match self {
            RingType::Tx => &offsets.tx,
            RingType::Rx => &offsets.rx,
            RingType::Fill => &offsets.fr,
            RingType::Completion => &offsets.cr,
        };
        Ring::<T>::mmap(raw_fd, ring_size, self.as_offset(), ring_offs)
    }
}

/// The user-side producer half of a ring (Fill, TX).
///
/// `cached_cons` holds the kernel's consumer index plus the ring length, so
/// `cached_cons - cached_prod` is the local view of free capacity. It is a
/// lower bound only and is refreshed from the live index when it looks
/// exhausted.
pub struct ProducerRing<T> {
    pub(crate) ring: Ring<T>,
    cached_prod: u32,
    cached_cons: u32,
    published: u32,
}

impl<T: Copy> ProducerRing<T> {
    pub fn new(ring: Ring<T>) -> Self {
        let cached_prod = ring.producer();
        let cached_cons = ring.consumer().wrapping_add(ring.len as u32);
        ProducerRing {
            published: cached_prod,
            ring,
            cached_prod,
            cached_cons,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len
    }

    /// Free slots as currently known, refreshing the cached consumer index
    /// from the shared one only when fewer than `wanted` appear free.
    pub fn free_slots(&mut self, wanted: usize) -> usize {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if (free as usize) >= wanted {
            return free as usize;
        }
        self.cached_cons = self.ring.consumer().wrapping_add(self.ring.len as u32);
        self.cached_cons.wrapping_sub(self.cached_prod) as usize
    }

    /// Claims up to `n` contiguous slots. Returns the granted count (possibly
    /// zero, never more than `n` or the free capacity) and the first slot
    /// index. Granted slots must be written and then submitted before the
    /// next reservation.
    pub fn reserve(&mut self, n: usize) -> (usize, u32) {
        let granted = self.free_slots(n).min(n);
        let start = self.cached_prod;
        self.cached_prod = self.cached_prod.wrapping_add(granted as u32);
        (granted, start)
    }

    /// Writes one previously reserved, not yet submitted slot.
    pub fn write_slot(&mut self, index: u32, value: T) {
        *self.ring.mut_desc_at(index) = value;
    }

    /// Publishes `n` written slots to the kernel.
    pub fn submit(&mut self, n: usize) {
        debug_assert!(
            n as u32 <= self.cached_prod.wrapping_sub(self.published),
            "submitting more slots than reserved"
        );
        self.published = self.published.wrapping_add(n as u32);
        self.ring.update_producer(self.published);
    }
}

/// The user-side consumer half of a ring (RX, Completion).
pub struct ConsumerRing<T> {
    pub(crate) ring: Ring<T>,
    cached_prod: u32,
    cached_cons: u32,
    released: u32,
}

impl<T: Copy> ConsumerRing<T> {
    pub fn new(ring: Ring<T>) -> Self {
        let cached_cons = ring.consumer();
        let cached_prod = ring.producer();
        ConsumerRing {
            released: cached_cons,
            ring,
            cached_prod,
            cached_cons,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len
    }

    /// Reports up to `max` available entries without returning them to the
    /// kernel. Yields the count (possibly zero) and the first entry index;
    /// each peeked batch must be matched by a `release` of the same count.
    pub fn peek(&mut self, max: usize) -> (usize, u32) {
        let mut avail = self.cached_prod.wrapping_sub(self.cached_cons);
        if (avail as usize) < max {
            self.cached_prod = self.ring.producer();
            avail = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        let count = (avail as usize).min(max);
        let start = self.cached_cons;
        self.cached_cons = self.cached_cons.wrapping_add(count as u32);
        (count, start)
    }

    pub fn read_slot(&self, index: u32) -> T {
        self.ring.desc_at(index)
    }

    /// Returns `n` consumed entries to the kernel's producer capacity.
    pub fn release(&mut self, n: usize) {
        debug_assert!(
            n as u32 <= self.cached_cons.wrapping_sub(self.released),
            "releasing more slots than peeked"
        );
        self.released = self.released.wrapping_add(n as u32);
        self.ring.update_consumer(self.released);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::host_ring;
    use super::*;

    #[test]
    fn reserve_never_grants_more_than_free_capacity() {
        let mut fill = ProducerRing::new(host_ring::<u64>(8));
        let (granted, _) = fill.reserve(16);
        assert_eq!(granted, 8);
        fill.submit(8);
        let (granted, _) = fill.reserve(1);
        assert_eq!(granted, 0);
    }

    #[test]
    fn producer_capacity_recovers_after_kernel_consumes() {
        let mut fill = ProducerRing::new(host_ring::<u64>(8));
        let (granted, mut idx) = fill.reserve(8);
        assert_eq!(granted, 8);
        for i in 0..8u64 {
            fill.write_slot(idx, i * 0x1000);
            idx = idx.wrapping_add(1);
        }
        fill.submit(8);
        assert_eq!(fill.ring.producer(), 8);

        // Kernel consumes 3 entries.
        fill.ring.update_consumer(3);
        let (granted, _) = fill.reserve(8);
        assert_eq!(granted, 3);
    }

    #[test]
    fn peek_reports_at_most_requested_and_available() {
        let mut rx = ConsumerRing::new(host_ring::<XdpDesc>(8));
        let (count, _) = rx.peek(4);
        assert_eq!(count, 0);

        // Kernel produces 6 descriptors.
        for i in 0..6 {
            *rx.ring.mut_desc_at(i) = XdpDesc::new(i as u64 * 0x1000, 64);
        }
        rx.ring.update_producer(6);

        let (count, idx) = rx.peek(4);
        assert_eq!((count, idx), (4, 0));
        rx.release(4);
        let (count, idx) = rx.peek(4);
        assert_eq!((count, idx), (2, 4));
        rx.release(2);
        assert_eq!(rx.ring.consumer(), 6);
    }

    #[test]
    fn peeked_slots_read_back_what_the_kernel_wrote() {
        let mut cq = ConsumerRing::new(host_ring::<u64>(4));
        *cq.ring.mut_desc_at(0) = 0x4000;
        *cq.ring.mut_desc_at(1) = 0x2000;
        cq.ring.update_producer(2);

        let (count, idx) = cq.peek(4);
        assert_eq!(count, 2);
        assert_eq!(cq.read_slot(idx), 0x4000);
        assert_eq!(cq.read_slot(idx.wrapping_add(1)), 0x2000);
        cq.release(2);
    }

    #[test]
    fn indices_wrap_across_the_ring_boundary() {
        let mut tx = ProducerRing::new(host_ring::<XdpDesc>(4));
        for round in 0..10u64 {
            let (granted, idx) = tx.reserve(1);
            assert_eq!(granted, 1);
            tx.write_slot(idx, XdpDesc::new(round * 0x1000, 64));
            tx.submit(1);
            // Kernel keeps up.
            let consumed = tx.ring.producer();
            tx.ring.update_consumer(consumed);
            assert_eq!(tx.ring.producer(), (round + 1) as u32);
        }
        // Free-running index 9 lands in physical slot 1.
        assert_eq!(tx.ring.desc_at(9).addr, 9 * 0x1000);
    }

    #[test]
    fn producer_index_is_monotonic_and_consumer_never_passes_it() {
        let mut fill = ProducerRing::new(host_ring::<u64>(8));
        let mut last_prod = fill.ring.producer();
        for _ in 0..5 {
            let (granted, mut idx) = fill.reserve(2);
            for _ in 0..granted {
                fill.write_slot(idx, 0);
                idx = idx.wrapping_add(1);
            }
            fill.submit(granted);
            let prod = fill.ring.producer();
            assert!(prod >= last_prod);
            assert!(fill.ring.consumer() <= prod);
            last_prod = prod;
            fill.ring.update_consumer(prod);
        }
    }
}
