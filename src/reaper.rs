//! Zero-copy completion reaper (spec.md §4.5).
//!
//! Drains a socket's error queue (`recvmsg(MSG_ERRQUEUE)`) and matches
//! each announced `[lo, hi]` sendmsg-sequence range back to the
//! [`TransmitBatcher`]'s pending-completion queue. Invoked both from
//! `flush` (spec.md §4.6, mirroring `xlio_sock_flush`'s call to
//! `_sock_check_zcopy` before `_sock_flush_ext`) and from the group
//! poller when a socket's error event fires (spec.md §4.7 step 4).

use std::mem::size_of;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;

use crate::batcher::TransmitBatcher;
use crate::stack::ffi::ZerocopyCompletionRange;
use crate::stack::Stack;

/// `sock_extended_err`, as delivered in an `IP_RECVERR` control message.
/// Only the fields this core reads are named; padding matches the
/// kernel's `struct sock_extended_err` layout on Linux.
#[repr(C)]
struct SockExtendedErr {
    ee_errno: u32,
    ee_origin: u8,
    ee_type: u8,
    ee_code: u8,
    ee_pad: u8,
    ee_info: u32,
    ee_data: u32,
}

/// `cmsg_level`/`cmsg_type` the kernel uses for an IPv4 zero-copy
/// completion notification.
const SOL_IP: c_int = 0;
const IP_RECVERR: c_int = 11;
/// IPv6 equivalents, since a zero-copy send over an AF_INET6 socket
/// reports completions with these instead.
const SOL_IPV6: c_int = 41;
const IPV6_RECVERR: c_int = 25;
/// `sock_extended_err.ee_origin` value identifying a `MSG_ZEROCOPY`
/// completion (as opposed to, say, an ICMP error).
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

/// Drain the error queue for `fd`, completing every pending send request
/// whose sequence falls in an announced range (spec.md §4.5's match
/// policy, implemented by [`TransmitBatcher::complete_range`]). Returns
/// the total number of requests completed across every control message
/// read, so the caller knows whether this socket needs to (re)join the
/// group's pending-receive queue.
///
/// Stops at the first `EAGAIN`/`EWOULDBLOCK` (spec.md §7, "treated as try
/// later"). A control message with an unexpected level/type/origin is a
/// non-fatal warning that ends the loop early, matching the original's
/// `_sock_check_zcopy` (spec.md §7, "Error-queue parse mismatch").
pub fn reap(stack: &dyn Stack, fd: RawFd, batcher: &mut TransmitBatcher) -> usize {
    let mut total_completed = 0;

    loop {
        let mut cmsg_buf = [0u8; size_of::<libc::cmsghdr>() + size_of::<SockExtendedErr>()];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = cmsg_buf.len();

        let rc = stack.recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE);
        let _n = match rc {
            Ok(n) => n,
            Err(e) => {
                if !is_again!(e) {
                    warn_log!("xlio-sock: recvmsg(MSG_ERRQUEUE) failed on fd {fd}: {e}");
                }
                return total_completed;
            }
        };

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            warn_log!("xlio-sock: MSG_ERRQUEUE recvmsg on fd {fd} returned no control message");
            return total_completed;
        }
        let cmsg_ref = unsafe { &*cmsg };
        let is_ipv4_err = cmsg_ref.cmsg_level == SOL_IP && cmsg_ref.cmsg_type == IP_RECVERR;
        let is_ipv6_err = cmsg_ref.cmsg_level == SOL_IPV6 && cmsg_ref.cmsg_type == IPV6_RECVERR;
        if !is_ipv4_err && !is_ipv6_err {
            warn_log!(
                "xlio-sock: unexpected cmsg level/type ({}/{}) on fd {fd}",
                cmsg_ref.cmsg_level,
                cmsg_ref.cmsg_type
            );
            return total_completed;
        }

        let serr = unsafe { &*(libc::CMSG_DATA(cmsg) as *const SockExtendedErr) };
        if serr.ee_errno != 0 || serr.ee_origin != SO_EE_ORIGIN_ZEROCOPY {
            warn_log!("xlio-sock: unexpected extended error origin on fd {fd}");
            return total_completed;
        }

        let range = ZerocopyCompletionRange { lo: serr.ee_info, hi: serr.ee_data };
        let completed = batcher.complete_range(range.lo, range.hi);
        total_completed += completed;
        trace_log!(
            "xlio-sock: fd {fd} reaped zcopy completions [{}, {}], {completed} request(s)",
            range.lo,
            range.hi
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SendRequest;
    use std::cell::Cell;
    use std::io;
    use std::rc::Rc;
    use std::sync::Mutex;

    /// A fake [`Stack`] that only implements `recvmsg`, handing back one
    /// queued `sock_extended_err` per call and `EAGAIN` once exhausted.
    struct FakeErrQueue {
        ranges: Mutex<Vec<(u32, u32)>>,
    }

    impl crate::stack::Stack for FakeErrQueue {
        fn socket(&self, _: c_int, _: c_int, _: c_int) -> io::Result<RawFd> { unimplemented!() }
        fn bind(&self, _: RawFd, _: *const libc::sockaddr, _: libc::socklen_t) -> io::Result<()> { unimplemented!() }
        fn listen(&self, _: RawFd, _: c_int) -> io::Result<()> { unimplemented!() }
        fn connect(&self, _: RawFd, _: *const libc::sockaddr, _: libc::socklen_t) -> io::Result<()> { unimplemented!() }
        fn accept(&self, _: RawFd, _: *mut libc::sockaddr, _: *mut libc::socklen_t) -> io::Result<RawFd> { unimplemented!() }
        fn close(&self, _: RawFd) -> io::Result<()> { unimplemented!() }
        fn readv(&self, _: RawFd, _: &mut [libc::iovec]) -> io::Result<usize> { unimplemented!() }
        fn writev(&self, _: RawFd, _: &[libc::iovec]) -> io::Result<usize> { unimplemented!() }
        fn recv(&self, _: RawFd, _: &mut [u8], _: c_int) -> io::Result<usize> { unimplemented!() }
        fn sendmsg(&self, _: RawFd, _: &libc::msghdr, _: c_int) -> io::Result<usize> { unimplemented!() }
        fn recvmsg(&self, _fd: RawFd, msg: &mut libc::msghdr, flags: c_int) -> io::Result<usize> {
            assert_eq!(flags, libc::MSG_ERRQUEUE);
            let mut ranges = self.ranges.lock().unwrap();
            let Some((lo, hi)) = ranges.pop() else {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            };
            let cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
            let cmsg_ref = unsafe { &mut *cmsg };
            cmsg_ref.cmsg_level = SOL_IP;
            cmsg_ref.cmsg_type = IP_RECVERR;
            let serr = SockExtendedErr {
                ee_errno: 0,
                ee_origin: SO_EE_ORIGIN_ZEROCOPY,
                ee_type: 0,
                ee_code: 0,
                ee_pad: 0,
                ee_info: lo,
                ee_data: hi,
            };
            unsafe {
                std::ptr::write(libc::CMSG_DATA(cmsg) as *mut SockExtendedErr, serr);
            }
            Ok(size_of::<SockExtendedErr>())
        }
        fn epoll_create1(&self, _: c_int) -> io::Result<RawFd> { unimplemented!() }
        fn epoll_ctl(&self, _: RawFd, _: c_int, _: RawFd, _: *mut libc::epoll_event) -> io::Result<()> { unimplemented!() }
        fn epoll_wait(&self, _: RawFd, _: &mut [libc::epoll_event], _: c_int) -> io::Result<usize> { unimplemented!() }
        fn fcntl_getfl(&self, _: RawFd) -> io::Result<c_int> { unimplemented!() }
        fn fcntl_setfl(&self, _: RawFd, _: c_int) -> io::Result<()> { unimplemented!() }
        fn ioctl_get_if_flags(&self, _: RawFd, _: &str) -> io::Result<i16> { unimplemented!() }
        fn getsockopt_raw(&self, _: RawFd, _: c_int, _: c_int, _: &mut [u8]) -> io::Result<usize> { unimplemented!() }
        fn setsockopt_raw(&self, _: RawFd, _: c_int, _: c_int, _: &[u8]) -> io::Result<()> { unimplemented!() }
        fn getsockname(&self, _: RawFd) -> io::Result<libc::sockaddr_storage> { unimplemented!() }
        fn getpeername(&self, _: RawFd) -> io::Result<libc::sockaddr_storage> { unimplemented!() }
        fn getaddrinfo(&self, _: &str, _: &str) -> io::Result<Vec<crate::stack::CandidateAddr>> { unimplemented!() }
        fn interface_addrs(&self) -> io::Result<Vec<(String, libc::sockaddr_storage, bool)>> { unimplemented!() }
        fn get_extended_api(&self) -> io::Result<crate::stack::ffi::XlioApi> { unimplemented!() }
        fn register_allocator(
            &self,
            _: &crate::stack::ffi::XlioApi,
            _: unsafe extern "C" fn(usize) -> *mut std::os::raw::c_void,
            _: unsafe extern "C" fn(*mut std::os::raw::c_void),
        ) -> io::Result<()> { unimplemented!() }
        fn recvfrom_zcopy(&self, _: &crate::stack::ffi::XlioApi, _: RawFd) -> io::Result<Vec<crate::stack::ZcopyPacket>> { unimplemented!() }
        fn free_zcopy_packet(&self, _: &crate::stack::ffi::XlioApi, _: RawFd, _: *mut std::os::raw::c_void) -> io::Result<()> { unimplemented!() }
        fn get_protection_domain(&self, _: RawFd) -> Option<crate::stack::ProtectionDomain> { unimplemented!() }
    }

    fn zcopy_req(results: Rc<Cell<usize>>) -> SendRequest {
        let buf = vec![0u8; 4].leak();
        SendRequest::new(
            vec![libc::iovec { iov_base: buf.as_mut_ptr() as *mut _, iov_len: buf.len() }],
            Some(vec![1]),
            false,
            Box::new(move |r| {
                assert!(r.is_ok());
                results.set(results.get() + 1);
            }),
        )
    }

    /// Scenario 4 (spec.md §8): two zero-copy sends sequenced M, M+1; the
    /// error queue announces the whole range in one shot.
    #[test]
    fn reap_completes_requests_in_announced_range() {
        let stack = FakeErrQueue { ranges: Mutex::new(vec![(1, 2)]) };
        let completed = Rc::new(Cell::new(0));

        let mut batcher = TransmitBatcher::new();
        batcher.queue(zcopy_req(completed.clone()));
        batcher.queue(zcopy_req(completed.clone()));
        batcher
            .flush(
                |iovs, _, _| Ok(iovs.iter().map(|i| i.iov_len).sum()),
                true,
                4096,
            )
            .unwrap();
        assert_eq!(batcher.pending_len(), 2);

        let n = reap(&stack, 7, &mut batcher);
        assert_eq!(n, 2);
        assert_eq!(completed.get(), 2);
        assert!(batcher.pending_is_empty());
    }

    #[test]
    fn reap_stops_at_eagain() {
        let stack = FakeErrQueue { ranges: Mutex::new(vec![]) };
        let mut batcher = TransmitBatcher::new();
        assert_eq!(reap(&stack, 7, &mut batcher), 0);
    }
}
