//! Receive-side iteration cursor (spec.md §4.3).
//!
//! Wraps freshly retrieved vendor packets into the [`PacketPool`],
//! exposes them as a FIFO of readable bytes through a `(packet, iov,
//! offset)` cursor, and offers both a copying `readv` and a genuinely
//! zero-copy `recv_zcopy` that hands out extra references into the same
//! packets instead.

use std::collections::VecDeque;
use std::os::raw::c_void;

use crate::packet::{BufferPool, BufferView, PacketPool};
use crate::stack::ZcopyPacket;

/// One handle returned by [`ReceiveCursor::recv_zcopy`]: a borrowed view
/// backed by a slot in the cursor's buffer pool, so
/// [`ReceiveCursor::free_bufs`] knows which slot (and, through it, which
/// packet reference) to release.
#[derive(Debug, Clone, Copy)]
pub struct RecvBuf {
    pub view: BufferView,
    buf_idx: u32,
}

impl RecvBuf {
    /// # Safety
    /// Valid until [`ReceiveCursor::free_bufs`] is called for this
    /// handle.
    pub unsafe fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }
}

/// Receive-side state for one socket: the packet pool plus the ordered
/// queue of packets with unread data and the cursor into the queue's
/// front.
pub struct ReceiveCursor {
    packets: PacketPool,
    bufs: BufferPool,
    received: VecDeque<u32>,
    cur_iov_idx: usize,
    cur_offset: usize,
}

impl ReceiveCursor {
    pub fn new(packet_pool_capacity: usize, buffer_pool_capacity: usize) -> ReceiveCursor {
        ReceiveCursor {
            packets: PacketPool::new(packet_pool_capacity),
            bufs: BufferPool::new(buffer_pool_capacity),
            received: VecDeque::new(),
            cur_iov_idx: 0,
            cur_offset: 0,
        }
    }

    pub fn has_pending_data(&self) -> bool {
        !self.received.is_empty()
    }

    /// Wrap freshly retrieved vendor packets, dropping any whose total
    /// length is zero by freeing them back to the stack immediately
    /// (spec.md §9, Open Question a: the drop is kept, matching the
    /// vendor behavior this was observed against).
    pub fn ingest(&mut self, packets: Vec<ZcopyPacket>, mut free_packet: impl FnMut(*mut c_void)) {
        for zp in packets {
            let views: Vec<BufferView> = zp
                .iovs
                .iter()
                .map(|iov| BufferView {
                    ptr: iov.iov_base as *mut u8,
                    len: iov.iov_len,
                })
                .collect();
            let total: usize = views.iter().map(|v| v.len).sum();
            if total == 0 {
                free_packet(zp.packet_id);
                continue;
            }
            match self.packets.insert(zp.packet_id, views) {
                Some(idx) => self.received.push_back(idx),
                // Pool exhaustion: nothing sensible to do but hand the
                // packet straight back rather than leak it.
                None => free_packet(zp.packet_id),
            }
        }
        self.cur_iov_idx = 0;
        self.cur_offset = 0;
    }

    /// The next contiguous readable chunk at the front of the queue, up
    /// to `max_len` bytes, skipping zero-length iovs and fully drained
    /// packets along the way. `None` once the queue is exhausted.
    fn next_chunk(&mut self, max_len: usize) -> Option<(BufferView, u32)> {
        loop {
            let idx = *self.received.front()?;
            let packet = self.packets.get(idx);
            let view = packet.views[self.cur_iov_idx];
            let avail = view.len - self.cur_offset;

            if avail == 0 {
                self.cur_offset = 0;
                self.cur_iov_idx += 1;
                if self.cur_iov_idx >= packet.views.len() {
                    self.cur_iov_idx = 0;
                    self.received.pop_front();
                }
                continue;
            }

            let len = avail.min(max_len);
            let chunk = BufferView {
                ptr: unsafe { view.ptr.add(self.cur_offset) },
                len,
            };
            return Some((chunk, idx));
        }
    }

    /// Consume `len` bytes from the front of the queue, releasing (and,
    /// via `free_packet`, freeing to the stack) any packet whose last
    /// iov is fully drained. `len` must not exceed the data actually
    /// available.
    fn advance(&mut self, mut len: usize, mut free_packet: impl FnMut(*mut c_void)) {
        while len > 0 {
            let idx = *self
                .received
                .front()
                .expect("advance() past the data actually queued");
            let packet = self.packets.get(idx);
            let view = packet.views[self.cur_iov_idx];
            let iov_len = view.len - self.cur_offset;

            if len < iov_len {
                self.cur_offset += len;
                len = 0;
            } else {
                len -= iov_len;
                self.cur_offset = 0;
                self.cur_iov_idx += 1;
                if self.cur_iov_idx >= packet.views.len() {
                    self.cur_iov_idx = 0;
                    self.received.pop_front();
                    if let Some(vendor_id) = self.packets.release(idx) {
                        free_packet(vendor_id);
                    }
                }
            }
        }
    }

    /// Copy up to `iovs`' total capacity out of the queue, advancing as
    /// we go. Returns bytes copied (`0` only means "no data queued
    /// at all"; a short, nonzero return is normal).
    pub fn readv(
        &mut self,
        iovs: &mut [libc::iovec],
        mut free_packet: impl FnMut(*mut c_void),
    ) -> usize {
        let mut total = 0usize;
        let mut i = 0usize;
        let mut offset = 0usize;
        while i < iovs.len() {
            let remaining = iovs[i].iov_len - offset;
            if remaining == 0 {
                i += 1;
                offset = 0;
                continue;
            }
            let Some((chunk, _idx)) = self.next_chunk(remaining) else {
                break;
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.ptr,
                    (iovs[i].iov_base as *mut u8).add(offset),
                    chunk.len,
                );
            }
            self.advance(chunk.len, &mut free_packet);
            total += chunk.len;
            offset += chunk.len;
            if offset == iovs[i].iov_len {
                offset = 0;
                i += 1;
            }
        }
        total
    }

    /// Genuinely zero-copy receive: hand back up to `len` bytes as
    /// [`RecvBuf`] handles acquired from the buffer pool instead of
    /// copying, bumping each source packet's refcount once per handle.
    /// Stops early (rather than copying instead) if the buffer pool is
    /// exhausted, leaving the unconsumed chunk queued for a later call.
    /// The caller must eventually pass every handle to
    /// [`ReceiveCursor::free_bufs`].
    pub fn recv_zcopy(&mut self, len: usize) -> Vec<RecvBuf> {
        let mut out = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let Some((chunk, idx)) = self.next_chunk(remaining) else {
                break;
            };
            let Some(buf_idx) = self.bufs.acquire(chunk, idx) else {
                break;
            };
            self.packets.retain(idx);
            // `advance` only ever sees the no-op free callback here: the
            // extra reference just taken guarantees this can never be
            // the packet's last release.
            self.advance(chunk.len, |_| {
                unreachable!("recv_zcopy handle was retained before advance()")
            });
            remaining -= chunk.len;
            out.push(RecvBuf {
                view: chunk,
                buf_idx,
            });
        }
        out
    }

    /// Release every handle in `bufs` back to the buffer pool, freeing
    /// any packet that drops to zero references back to the stack via
    /// `free_packet`.
    pub fn free_bufs(&mut self, bufs: Vec<RecvBuf>, mut free_packet: impl FnMut(*mut c_void)) {
        for buf in bufs {
            let packet_idx = self.bufs.release(buf.buf_idx);
            if let Some(vendor_id) = self.packets.release(packet_idx) {
                free_packet(vendor_id);
            }
        }
    }

    /// Drain and discard every packet still queued, as `close()` does
    /// (spec.md §4.6): decrements refcounts down to zero via
    /// `free_packet`, without copying any of the remaining data out.
    pub fn drain(&mut self, mut free_packet: impl FnMut(*mut c_void)) {
        while let Some(idx) = self.received.pop_front() {
            if let Some(vendor_id) = self.packets.release(idx) {
                free_packet(vendor_id);
            }
        }
        self.cur_iov_idx = 0;
        self.cur_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn iov(bytes: &mut [u8]) -> libc::iovec {
        libc::iovec {
            iov_base: bytes.as_mut_ptr() as *mut c_void,
            iov_len: bytes.len(),
        }
    }

    fn zcopy_packet(id: usize, data: &'static mut [u8]) -> ZcopyPacket {
        ZcopyPacket {
            packet_id: id as *mut c_void,
            iovs: vec![libc::iovec {
                iov_base: data.as_mut_ptr() as *mut c_void,
                iov_len: data.len(),
            }],
        }
    }

    #[test]
    fn readv_spans_multiple_packets() {
        let mut cursor = ReceiveCursor::new(8, 8);
        let freed = RefCell::new(Vec::new());

        let data_a: &'static mut [u8] = Box::leak(Box::new(*b"hello "));
        let data_b: &'static mut [u8] = Box::leak(Box::new(*b"world!"));
        cursor.ingest(
            vec![zcopy_packet(1, data_a), zcopy_packet(2, data_b)],
            |id| freed.borrow_mut().push(id),
        );

        let mut out = [0u8; 12];
        let mut iovs = [iov(&mut out)];
        let n = cursor.readv(&mut iovs, |id| freed.borrow_mut().push(id));

        assert_eq!(n, 12);
        assert_eq!(&out, b"hello world!");
        assert_eq!(freed.borrow().len(), 2);
        assert!(!cursor.has_pending_data());
    }

    #[test]
    fn zero_length_packet_is_dropped_immediately() {
        let mut cursor = ReceiveCursor::new(4, 4);
        let freed = RefCell::new(Vec::new());
        let empty_packet = ZcopyPacket {
            packet_id: 7usize as *mut c_void,
            iovs: vec![],
        };
        cursor.ingest(vec![empty_packet], |id| freed.borrow_mut().push(id));
        assert!(!cursor.has_pending_data());
        assert_eq!(freed.borrow().as_slice(), &[7usize as *mut c_void]);
    }

    #[test]
    fn recv_zcopy_holds_a_reference_until_free_bufs() {
        let mut cursor = ReceiveCursor::new(4, 4);
        let freed = RefCell::new(Vec::new());
        let data: &'static mut [u8] = Box::leak(Box::new(*b"abcdef"));
        cursor.ingest(vec![zcopy_packet(3, data)], |id| freed.borrow_mut().push(id));

        let bufs = cursor.recv_zcopy(6);
        assert_eq!(bufs.len(), 1);
        assert!(freed.borrow().is_empty());

        cursor.free_bufs(bufs, |id| freed.borrow_mut().push(id));
        assert_eq!(freed.borrow().as_slice(), &[3usize as *mut c_void]);
    }

    /// A buffer pool sized to 1 slot can only hand out one zero-copy
    /// view at a time; the second `recv_zcopy` call gets nothing until
    /// the first handle is freed, and the unconsumed bytes stay queued.
    #[test]
    fn recv_zcopy_stops_when_buffer_pool_is_exhausted() {
        let mut cursor = ReceiveCursor::new(4, 1);
        let freed = RefCell::new(Vec::new());
        let data: &'static mut [u8] = Box::leak(Box::new(*b"abcdef"));
        cursor.ingest(vec![zcopy_packet(3, data)], |id| freed.borrow_mut().push(id));

        let first = cursor.recv_zcopy(3);
        assert_eq!(first.len(), 1);
        assert_eq!(unsafe { first[0].as_slice() }, b"abc");

        // Pool has no free slots left; nothing more is handed out even
        // though 3 more bytes are queued.
        let second = cursor.recv_zcopy(3);
        assert!(second.is_empty());
        assert!(cursor.has_pending_data());

        cursor.free_bufs(first, |id| freed.borrow_mut().push(id));
        assert!(freed.borrow().is_empty(), "packet still has queued bytes, refcount not yet zero");

        let third = cursor.recv_zcopy(3);
        assert_eq!(third.len(), 1);
        assert_eq!(unsafe { third[0].as_slice() }, b"def");
    }
}
