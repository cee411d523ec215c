//! Raw wire shapes for the vendor stack's extended (zero-copy) API.
//!
//! These mirror the layout of `xlio_extra.h` just closely enough to decode
//! what `recvfrom_zcopy` hands back: an opaque `packet_id` the caller must
//! return later to free the packet, and an inline (flexible-array-member
//! style) list of `iovec`s. The vendor header itself is not vendored here
//! (non-goal: reproducing the vendor stack's full ABI) — only the subset
//! this core actually reads.

use std::os::raw::{c_int, c_void};

/// Fixed-size scratch buffer `recvfrom_zcopy` writes its packet headers
/// into. Contents are only valid until the next call on the same socket
/// (spec.md §4.3): everything worth keeping (packet id, iov pointers) is
/// copied out into a [`crate::packet::Packet`] before that next call can
/// happen.
pub const XLIO_PACKETS_BUF_SIZE: usize = 128;

/// Header of one packet inside a `recvfrom_zcopy` result buffer, followed
/// in memory by exactly `sz_iov` `libc::iovec` entries.
#[repr(C)]
pub struct RawPacket {
    pub packet_id: *mut c_void,
    pub sz_iov: usize,
    // `iov: [libc::iovec; sz_iov]` follows, accessed via `iovs()`.
}

impl RawPacket {
    /// Slice over this packet's inline iovec array.
    ///
    /// # Safety
    /// `self` must point into a live `recvfrom_zcopy` result buffer with
    /// at least `sz_iov` iovecs following the header.
    pub unsafe fn iovs(&self) -> &[libc::iovec] {
        let base = (self as *const RawPacket).add(1) as *const libc::iovec;
        std::slice::from_raw_parts(base, self.sz_iov)
    }

    /// Pointer to the next packet header in the same result buffer.
    ///
    /// # Safety
    /// Caller must know another packet follows (bounded by the result's
    /// `n_packet_num`).
    pub unsafe fn next(&self) -> *const RawPacket {
        let base = (self as *const RawPacket).add(1) as *const libc::iovec;
        base.add(self.sz_iov) as *const RawPacket
    }
}

/// Header of a `recvfrom_zcopy` result: `n_packet_num` [`RawPacket`]s
/// follow inline, back to back.
#[repr(C)]
pub struct RawPacketsHeader {
    pub n_packet_num: usize,
}

impl RawPacketsHeader {
    /// Pointer to the first packet header following this one.
    ///
    /// # Safety
    /// `self` must point into a result buffer that actually has
    /// `n_packet_num >= 1` packets following it.
    pub unsafe fn first_packet(&self) -> *const RawPacket {
        (self as *const RawPacketsHeader).add(1) as *const RawPacket
    }
}

/// Set by the vendor stack in the `flags` out-param of `recvfrom_zcopy`
/// when the call actually returned zero-copy packets (as opposed to
/// falling back to a copy internally).
pub const MSG_XLIO_ZCOPY: c_int = 0x100_0000;

/// One packet to hand back to the vendor stack's free function. Only
/// `packet_id` matters on free; `sz_iov` is set to zero as the original
/// does (the iovecs aren't needed to release the packet).
#[repr(C)]
pub struct FreePacket {
    pub packet_id: *mut c_void,
    pub sz_iov: usize,
}

/// Per-iov memory-key record attached to a zero-copy send's control
/// message (spec.md §4.4, §6 "memory-key blocks").
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PdKey {
    pub mkey: u32,
    pub flags: u32,
}

/// `(ee_info, ee_data)` out of a `sock_extended_err` control message:
/// the inclusive `[lo, hi]` range of sendmsg sequence numbers the error
/// queue just confirmed (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZerocopyCompletionRange {
    pub lo: u32,
    pub hi: u32,
}

/// The subset of the vendor's extended API this core calls, obtained via
/// `SO_XLIO_GET_API` (spec.md §4.1).
#[repr(C)]
pub struct XlioApi {
    pub recvfrom_zcopy: unsafe extern "C" fn(
        fd: c_int,
        buf: *mut c_void,
        len: usize,
        flags: *mut c_int,
        from: *mut libc::sockaddr,
        from_len: *mut libc::socklen_t,
    ) -> isize,
    pub recvfrom_zcopy_free_packets:
        unsafe extern "C" fn(fd: c_int, pkts: *const FreePacket, count: usize) -> c_int,
    pub ioctl: unsafe extern "C" fn(cmsg: *const libc::cmsghdr, len: usize) -> c_int,
}

/// `SO_XLIO_GET_API` and `SO_XLIO_PD` socket option numbers, and the
/// control-message type used to register the caller's allocator and to
/// attach per-iov memory keys. These are vendor-private option numbers in
/// the real stack; the values here are placeholders consistent with the
/// vendor's documented range and are only ever interpreted by the loaded
/// vendor module itself, never by the kernel.
pub const SO_XLIO_GET_API: c_int = 2900;
pub const SO_XLIO_PD: c_int = 2901;
pub const CMSG_XLIO_IOCTL_USER_ALLOC: c_int = 2902;
pub const SCM_XLIO_PD: c_int = 2903;

pub const IOCTL_USER_ALLOC_RX: u8 = 1 << 1;
