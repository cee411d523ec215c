//! Refcounted, zero-copy packet wrappers (spec.md §4.2, §9 "Refcounted
//! packet graph").
//!
//! A `Packet` is the crate's view of one vendor `recvfrom_zcopy` result:
//! a flat list of `(ptr, len)` buffer views borrowed from vendor-owned
//! memory, plus a refcount. The vendor packet stays alive (and its
//! memory valid) for as long as the refcount is nonzero; dropping it to
//! zero is what triggers `recvfrom_zcopy_free_packets`.

use std::os::raw::c_void;

use crate::pool::Pool;

/// Default packet pool capacity per socket (spec.md §6, `N_PACKETS`).
pub const DEFAULT_PACKET_POOL_SIZE: usize = 1024;

/// One borrowed view into vendor-owned receive memory.
#[derive(Debug, Clone, Copy)]
pub struct BufferView {
    pub ptr: *mut u8,
    pub len: usize,
}

impl BufferView {
    /// # Safety
    /// `ptr` must be valid for `len` bytes for as long as the owning
    /// packet's refcount stays above zero.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// A single vendor packet: its opaque id (needed to free it) and the
/// ordered list of buffer views that make it up.
pub struct Packet {
    /// `None` for a free (pooled, unused) slot.
    pub vendor_id: Option<*mut c_void>,
    pub views: Vec<BufferView>,
    refcount: u32,
}

impl Packet {
    fn empty() -> Packet {
        Packet {
            vendor_id: None,
            views: Vec::new(),
            refcount: 0,
        }
    }

    /// Total bytes across every view still in this packet.
    pub fn total_len(&self) -> usize {
        self.views.iter().map(|v| v.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    fn retain(&mut self) {
        self.refcount += 1;
    }

    /// Drop one reference. Returns `true` if this was the last one, in
    /// which case the caller must return `vendor_id` to the stack via
    /// `recvfrom_zcopy_free_packets`.
    fn release(&mut self) -> bool {
        debug_assert!(self.refcount > 0, "released a packet with no outstanding references");
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount == 0
    }
}

/// Owns the fixed-capacity slab of [`Packet`]s for one socket.
pub struct PacketPool {
    pool: Pool<Packet>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> PacketPool {
        PacketPool {
            pool: Pool::new(capacity, |_| Packet::empty()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Acquire a fresh slot and stamp it with one live vendor packet,
    /// starting at refcount 1 (the pending-receive queue's reference,
    /// spec.md §4.7 step 3).
    pub fn insert(&mut self, vendor_id: *mut c_void, views: Vec<BufferView>) -> Option<u32> {
        let idx = self.pool.acquire()?;
        self.pool.put(
            idx,
            Packet {
                vendor_id: Some(vendor_id),
                views,
                refcount: 1,
            },
        );
        Some(idx)
    }

    pub fn get(&self, idx: u32) -> &Packet {
        self.pool.get(idx)
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut Packet {
        self.pool.get_mut(idx)
    }

    pub fn retain(&mut self, idx: u32) {
        self.pool.get_mut(idx).retain();
    }

    /// Drop one reference to the packet at `idx`. If it was the last
    /// one, frees the slot back to the pool and returns the vendor id so
    /// the caller can release it to the stack.
    pub fn release(&mut self, idx: u32) -> Option<*mut c_void> {
        let packet = self.pool.get_mut(idx);
        let was_last = packet.release();
        if !was_last {
            return None;
        }
        let vendor_id = packet.vendor_id.take();
        self.pool.release_index(idx);
        vendor_id
    }
}

/// One pool slot backing a borrowed receive-buffer handle (spec.md §3
/// "Buffer view"): the view itself plus the packet it was carved from,
/// for `ReceiveCursor::free_bufs` to find the right packet to decrement.
pub struct BufferSlot {
    pub view: BufferView,
    pub packet_idx: u32,
}

impl BufferSlot {
    fn empty() -> BufferSlot {
        BufferSlot {
            view: BufferView { ptr: std::ptr::null_mut(), len: 0 },
            packet_idx: 0,
        }
    }
}

/// Owns the fixed-capacity slab of [`BufferSlot`]s for one socket
/// (spec.md §4.2, `N_BUFFERS`). One slot per outstanding zero-copy read
/// handle; `release` hands back the owning packet's index rather than
/// freeing the packet itself, since a packet may still be backing other
/// outstanding views.
pub struct BufferPool {
    pool: Pool<BufferSlot>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> BufferPool {
        BufferPool {
            pool: Pool::new(capacity, |_| BufferSlot::empty()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Acquire a slot and stamp it with `view`/`packet_idx`. `None` means
    /// the pool is exhausted (spec.md §4.2, "pool exhaustion is a hard
    /// failure of the caller").
    pub fn acquire(&mut self, view: BufferView, packet_idx: u32) -> Option<u32> {
        let idx = self.pool.acquire()?;
        self.pool.put(idx, BufferSlot { view, packet_idx });
        Some(idx)
    }

    /// Release a buffer-view slot back to the pool. Returns the owning
    /// packet's index so the caller can drop that packet's reference.
    pub fn release(&mut self, idx: u32) -> u32 {
        let packet_idx = self.pool.get(idx).packet_idx;
        self.pool.release_index(idx);
        packet_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn insert_starts_at_refcount_one_and_frees_on_last_release() {
        let mut pool = PacketPool::new(4);
        let idx = pool
            .insert(ptr::null_mut::<c_void>().wrapping_add(1), vec![])
            .unwrap();
        assert_eq!(pool.get(idx).refcount(), 1);
        assert_eq!(pool.in_use(), 1);

        pool.retain(idx);
        assert_eq!(pool.get(idx).refcount(), 2);

        assert!(pool.release(idx).is_none());
        assert_eq!(pool.in_use(), 1);

        let freed = pool.release(idx);
        assert!(freed.is_some());
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn total_len_sums_views() {
        let mut pool = PacketPool::new(1);
        let views = vec![
            BufferView { ptr: ptr::null_mut(), len: 10 },
            BufferView { ptr: ptr::null_mut(), len: 22 },
        ];
        let idx = pool.insert(ptr::null_mut(), views).unwrap();
        assert_eq!(pool.get(idx).total_len(), 32);
    }

    #[test]
    fn buffer_pool_conserves_capacity_and_tracks_owning_packet() {
        let mut bufs = BufferPool::new(2);
        let view = BufferView { ptr: ptr::null_mut(), len: 4 };

        let a = bufs.acquire(view, 7).unwrap();
        let b = bufs.acquire(view, 9).unwrap();
        assert_eq!(bufs.in_use(), 2);
        assert!(bufs.acquire(view, 1).is_none());

        assert_eq!(bufs.release(a), 7);
        assert_eq!(bufs.in_use(), 1);
        assert_eq!(bufs.release(b), 9);
        assert_eq!(bufs.in_use(), 0);
    }
}
