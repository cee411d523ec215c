//! Socket object and lifecycle (spec.md §4.6).
//!
//! A [`Socket`] owns one kernel descriptor plus its private packet and
//! buffer pools (spec.md §3: "A socket exclusively owns its slabs"). It
//! is created through [`Socket::create_listen`]/[`Socket::create_connect`],
//! handed off to a [`crate::group::SocketGroup`], and closed through
//! [`Socket::close`].

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;

use crate::batcher::TransmitBatcher;
use crate::cursor::{ReceiveCursor, RecvBuf};
use crate::options::{MIN_SO_RCVBUF_SIZE, MIN_SO_SNDBUF_SIZE};
use crate::packet::DEFAULT_PACKET_POOL_SIZE;
use crate::reaper;
use crate::request::SendRequest;
use crate::stack::ffi::PdKey;
use crate::stack::{ProtectionDomain, Stack};

/// Default buffer-view pool capacity per socket (spec.md §4.2,
/// `N_BUFFERS`). The receive cursor only ever needs one `BufferView` per
/// outstanding `recv_zcopy` handle, so this bounds concurrent zero-copy
/// read handles rather than packets.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 4096;

/// Caller-supplied options at socket creation time (spec.md §4.6, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketOpts {
    pub zcopy: bool,
    pub priority: c_int,
    /// TCP_USER_TIMEOUT, in milliseconds. Zero means "leave at the
    /// kernel default".
    pub ack_timeout_ms: c_int,
}

/// Capability introspection (spec.md SPEC_FULL §B, "Capability
/// introspection"), mirroring `xlio_sock_get_caps`.
#[derive(Debug, Clone, Copy)]
pub struct SocketCaps {
    pub zerocopy_send: bool,
    pub zerocopy_recv: bool,
    pub protection_domain: Option<ProtectionDomain>,
}

/// Whether this socket was created via `create_listen` (server) or
/// `create_connect`/`accept` (client) — decides which of
/// `enable_zerocopy_send_server`/`_client` gates zero-copy send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// One connection endpoint (spec.md §3 "Socket").
pub struct Socket {
    fd: RawFd,
    stack: &'static dyn Stack,
    pd: Option<ProtectionDomain>,
    zcopy_send: bool,
    zcopy_recv: bool,
    priority: c_int,
    pub(crate) pending_recv: bool,
    /// Tracks whether the framework's read callback is still installed.
    /// The outer framework's actual callback type is out of scope
    /// (spec.md §1 Non-goals); the poller only needs to know whether one
    /// is set (spec.md §4.7 step 5, "skip ... sockets whose callback was
    /// cleared").
    has_callback: bool,
    cursor: ReceiveCursor,
    batcher: TransmitBatcher,
}

impl Socket {
    fn alloc(fd: RawFd, stack: &'static dyn Stack, zcopy_requested: bool, role: Role, opts: &SocketOpts) -> Socket {
        let mut zcopy_send = false;
        if zcopy_requested {
            let flag: c_int = 1;
            let buf = flag.to_ne_bytes();
            match stack.setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_ZEROCOPY, &buf) {
                Ok(()) => zcopy_send = true,
                Err(e) => warn_log!("xlio-sock: SO_ZEROCOPY not supported on fd {fd}: {e}"),
            }
        }

        let pd = if role != Role::Server {
            stack.get_protection_domain(fd)
        } else {
            None
        };
        if zcopy_send && pd.is_none() {
            debug_log!("xlio-sock: fd {fd} has no protection domain; memory keys unavailable");
        }

        let recv_zcopy = crate::options::global().enable_zerocopy_recv;

        debug_log!(
            "xlio-sock: created fd {fd}: zcopy_send={zcopy_send} zcopy_recv={recv_zcopy} pd={}",
            pd.is_some()
        );

        Socket {
            fd,
            stack,
            pd,
            zcopy_send,
            zcopy_recv: recv_zcopy,
            priority: opts.priority,
            pending_recv: false,
            has_callback: true,
            cursor: ReceiveCursor::new(DEFAULT_PACKET_POOL_SIZE, DEFAULT_BUFFER_POOL_SIZE),
            batcher: TransmitBatcher::new(),
        }
    }

    fn create(stack: &'static dyn Stack, host: &str, port: u16, listen: bool, opts: &SocketOpts) -> io::Result<Socket> {
        // Strip brackets around an IPv6 literal (spec.md §4.6).
        let host = host.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(host);
        let service = port.to_string();

        let candidates = stack.getaddrinfo(host, &service)?;
        let global = crate::options::global();

        let mut last_err: Option<io::Error> = None;
        for cand in &candidates {
            let fd = 'retry: loop {
                let fd = match stack.socket(cand.family, libc::SOCK_STREAM, cand.protocol) {
                    Ok(fd) => fd,
                    Err(e) => {
                        last_err = Some(e);
                        continue;
                    }
                };

                let sz = global.recv_buf_size as c_int;
                let _ = stack.setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &sz.to_ne_bytes());
                let sz = global.send_buf_size as c_int;
                let _ = stack.setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &sz.to_ne_bytes());

                let one: c_int = 1;
                if stack.setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one.to_ne_bytes()).is_err() {
                    let _ = stack.close(fd);
                    continue;
                }
                if stack.setsockopt_raw(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &one.to_ne_bytes()).is_err() {
                    let _ = stack.close(fd);
                    continue;
                }
                if opts.priority != 0
                    && stack
                        .setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, &opts.priority.to_ne_bytes())
                        .is_err()
                {
                    let _ = stack.close(fd);
                    continue;
                }
                if cand.family == libc::AF_INET6 {
                    if stack
                        .setsockopt_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, &one.to_ne_bytes())
                        .is_err()
                    {
                        let _ = stack.close(fd);
                        continue;
                    }
                }
                if opts.ack_timeout_ms != 0 {
                    if stack
                        .setsockopt_raw(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, &opts.ack_timeout_ms.to_ne_bytes())
                        .is_err()
                    {
                        let _ = stack.close(fd);
                        continue;
                    }
                }

                if listen {
                    match stack.bind(fd, &cand.addr as *const _ as *const libc::sockaddr, cand.addr_len) {
                        Ok(()) => {}
                        Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                            let _ = stack.close(fd);
                            continue 'retry;
                        }
                        Err(e) => {
                            last_err = Some(e);
                            let _ = stack.close(fd);
                            continue;
                        }
                    }
                    if let Err(e) = stack.listen(fd, 512) {
                        last_err = Some(e);
                        let _ = stack.close(fd);
                        continue;
                    }
                } else {
                    if let Err(e) = stack.connect(fd, &cand.addr as *const _ as *const libc::sockaddr, cand.addr_len) {
                        last_err = Some(e);
                        let _ = stack.close(fd);
                        continue;
                    }
                }

                let flags = stack.fcntl_getfl(fd)?;
                if let Err(e) = stack.fcntl_setfl(fd, flags | libc::O_NONBLOCK) {
                    let _ = stack.close(fd);
                    return Err(e);
                }

                break fd;
            };

            let role = if listen { Role::Server } else { Role::Client };
            let zcopy_impl_enabled = match role {
                Role::Server => global.enable_zerocopy_send_server,
                Role::Client => global.enable_zerocopy_send_client,
            };
            let loopback = is_loopback(stack, fd).unwrap_or(false);
            let zcopy_requested = opts.zcopy && !loopback && global.enable_zerocopy_send && zcopy_impl_enabled;

            return Ok(Socket::alloc(fd, stack, zcopy_requested, role, opts));
        }

        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate address succeeded")))
    }

    pub fn create_listen(stack: &'static dyn Stack, host: &str, port: u16, opts: &SocketOpts) -> io::Result<Socket> {
        Socket::create(stack, host, port, true, opts)
    }

    pub fn create_connect(stack: &'static dyn Stack, host: &str, port: u16, opts: &SocketOpts) -> io::Result<Socket> {
        Socket::create(stack, host, port, false, opts)
    }

    /// Accept one pending connection. The new socket inherits the
    /// parent's zero-copy flag (spec.md §4.6); priority is re-applied
    /// because the kernel does not inherit `SO_PRIORITY` across accept.
    pub fn accept(&self) -> io::Result<Socket> {
        let fd = self.stack.accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut())?;

        let flags = self.stack.fcntl_getfl(fd)?;
        if flags & libc::O_NONBLOCK == 0 {
            if let Err(e) = self.stack.fcntl_setfl(fd, flags | libc::O_NONBLOCK) {
                let _ = self.stack.close(fd);
                return Err(e);
            }
        }

        if self.priority != 0 {
            if let Err(e) = self
                .stack
                .setsockopt_raw(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, &self.priority.to_ne_bytes())
            {
                let _ = self.stack.close(fd);
                return Err(e);
            }
        }

        let opts = SocketOpts { zcopy: self.zcopy_send, priority: self.priority, ack_timeout_ms: 0 };
        Ok(Socket::alloc(fd, self.stack, self.zcopy_send, Role::Client, &opts))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn caps(&self) -> SocketCaps {
        SocketCaps { zerocopy_send: self.zcopy_send, zerocopy_recv: self.zcopy_recv, protection_domain: self.pd }
    }

    pub fn priority(&self) -> c_int {
        self.priority
    }

    pub fn set_priority(&mut self, priority: c_int) -> io::Result<()> {
        self.stack.setsockopt_raw(self.fd, libc::SOL_SOCKET, libc::SO_PRIORITY, &priority.to_ne_bytes())?;
        self.priority = priority;
        Ok(())
    }

    pub fn set_recv_buf_size(&self, size: c_int) -> io::Result<()> {
        let size = size.max(MIN_SO_RCVBUF_SIZE);
        self.stack.setsockopt_raw(self.fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &size.to_ne_bytes())
    }

    pub fn set_send_buf_size(&self, size: c_int) -> io::Result<()> {
        let size = size.max(MIN_SO_SNDBUF_SIZE);
        self.stack.setsockopt_raw(self.fd, libc::SOL_SOCKET, libc::SO_SNDBUF, &size.to_ne_bytes())
    }

    /// `SO_RCVLOWAT`. Matches `xlio_sock_set_recvlowat`: failure is
    /// logged and swallowed, never propagated (spec.md SPEC_FULL §B).
    pub fn set_recv_low_at_mark(&self, nbytes: c_int) {
        if let Err(e) = self.stack.setsockopt_raw(self.fd, libc::SOL_SOCKET, libc::SO_RCVLOWAT, &nbytes.to_ne_bytes()) {
            debug_log!("xlio-sock: SO_RCVLOWAT failed on fd {}: {e}", self.fd);
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockaddr_storage_to_std(self.stack.getsockname(self.fd)?)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockaddr_storage_to_std(self.stack.getpeername(self.fd)?)
    }

    pub fn is_ipv4(&self) -> bool {
        self.stack.getsockname(self.fd).map(|sa| sa.ss_family as c_int == libc::AF_INET).unwrap_or(false)
    }

    pub fn is_ipv6(&self) -> bool {
        self.stack.getsockname(self.fd).map(|sa| sa.ss_family as c_int == libc::AF_INET6).unwrap_or(false)
    }

    /// A one-byte `MSG_PEEK` recv: `0` means end-of-stream (not
    /// connected), `EAGAIN`/`EWOULDBLOCK` or a positive length both mean
    /// the connection is still open (spec.md SPEC_FULL §B).
    pub fn is_connected(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.stack.recv(self.fd, &mut byte, libc::MSG_PEEK) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => is_again!(e),
        }
    }

    /// Copying receive (spec.md §4.3 "Copy read"). Drains the vendor
    /// stack for fresh zero-copy packets first if none are already
    /// queued, then copies into `iovs`.
    pub fn readv(&mut self, iovs: &mut [libc::iovec]) -> io::Result<usize> {
        self.fill_cursor_if_empty()?;
        let stack = self.stack;
        let fd = self.fd;
        let api = crate::stack::extended_api();
        Ok(self.cursor.readv(iovs, |id| {
            if let Err(e) = stack.free_zcopy_packet(api, fd, id) {
                warn_log!("xlio-sock: failed to free packet on fd {fd}: {e}");
            }
        }))
    }

    /// Genuinely zero-copy receive (spec.md §4.3 "Zero-copy read").
    pub fn recv_zcopy(&mut self, len: usize) -> io::Result<Vec<RecvBuf>> {
        if !self.zcopy_recv {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "zero-copy receive not enabled on this socket"));
        }
        self.fill_cursor_if_empty()?;
        Ok(self.cursor.recv_zcopy(len))
    }

    pub fn free_bufs(&mut self, bufs: Vec<RecvBuf>) {
        let stack = self.stack;
        let fd = self.fd;
        let api = crate::stack::extended_api();
        self.cursor.free_bufs(bufs, |id| {
            if let Err(e) = stack.free_zcopy_packet(api, fd, id) {
                warn_log!("xlio-sock: failed to free packet on fd {fd}: {e}");
            }
        });
    }

    fn fill_cursor_if_empty(&mut self) -> io::Result<()> {
        if self.cursor.has_pending_data() || !self.zcopy_recv {
            return Ok(());
        }
        let api = crate::stack::extended_api();
        let packets = self.stack.recvfrom_zcopy(api, self.fd)?;
        let stack = self.stack;
        let fd = self.fd;
        self.cursor.ingest(packets, |id| {
            if let Err(e) = stack.free_zcopy_packet(api, fd, id) {
                warn_log!("xlio-sock: failed to free packet on fd {fd}: {e}");
            }
        });
        Ok(())
    }

    /// `writev_async`: queue a send request, flushing immediately if the
    /// queue has grown past one full batch (spec.md §4.4).
    pub fn writev_async(&mut self, req: SendRequest) -> io::Result<()> {
        self.batcher.queue(req);
        if self.batcher.should_flush_after_queue() {
            self.flush()?;
        }
        Ok(())
    }

    /// Reap any zero-copy completions, then flush the transmit queue
    /// (spec.md §4.6, mirroring `xlio_sock_flush`'s call to
    /// `_sock_check_zcopy` before `_sock_flush_ext`). Returns whether any
    /// completions were reaped, so the caller can decide if this socket
    /// needs to (re)join a group's pending-receive queue.
    pub fn flush(&mut self) -> io::Result<bool> {
        let mut completed_any = false;
        if self.zcopy_send && !self.batcher.pending_is_empty() {
            completed_any = reaper::reap(self.stack, self.fd, &mut self.batcher) > 0;
        }

        let zerocopy_threshold = crate::options::global().zerocopy_threshold;
        let zcopy_send = self.zcopy_send;
        let stack = self.stack;
        let fd = self.fd;
        self.batcher.flush(
            |iovs, mkeys, flags| send_batch(stack, fd, iovs, mkeys, flags),
            zcopy_send,
            zerocopy_threshold,
        )?;
        Ok(completed_any)
    }

    /// Narrow accessor for the group poller's error-event path (spec.md
    /// §4.7 step 4), which must invoke the reaper directly against a
    /// ready event rather than through [`Socket::flush`].
    pub(crate) fn batcher_mut(&mut self) -> &mut TransmitBatcher {
        &mut self.batcher
    }

    pub fn has_callback(&self) -> bool {
        self.has_callback
    }

    pub fn set_callback(&mut self) {
        self.has_callback = true;
    }

    pub fn clear_callback(&mut self) {
        self.has_callback = false;
    }

    /// Abort every queued and pending send request (spec.md §4.7,
    /// "Remove-socket").
    pub fn abort_requests(&mut self, err: impl Fn() -> io::Error) {
        self.batcher.abort_all(err);
    }

    /// Close the socket (spec.md §4.6): drain the received-packet queue
    /// (logging, not failing, on outstanding refs), assert the
    /// pending-completion queue is empty, then close the descriptor.
    pub fn close(mut self) -> io::Result<()> {
        let stack = self.stack;
        let fd = self.fd;
        let api = crate::stack::extended_api();
        self.cursor.drain(|id| {
            if let Err(e) = stack.free_zcopy_packet(api, fd, id) {
                warn_log!("xlio-sock: failed to free packet on fd {fd} at close: {e}");
            }
        });

        assert!(
            self.batcher.pending_is_empty(),
            "xlio-sock: closed fd {fd} with outstanding zero-copy completions pending"
        );

        stack.close(fd)
    }
}

/// Loopback detection (spec.md §4.6): match the socket's bound local
/// address against every interface address flagged loopback.
fn is_loopback(stack: &dyn Stack, fd: RawFd) -> io::Result<bool> {
    let local = stack.getsockname(fd)?;
    let local_addr = sockaddr_storage_to_std(local)?;
    for (_name, addr, loopback) in stack.interface_addrs()? {
        if !loopback {
            continue;
        }
        if let Ok(if_addr) = sockaddr_storage_to_std(addr) {
            if if_addr.ip() == local_addr.ip() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn sockaddr_storage_to_std(sa: libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match sa.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&sa as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&sa as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported address family")),
    }
}

/// Build and send one `sendmsg` call for a prepared batch, attaching the
/// per-iov memory-key control message when present (spec.md §4.4): the
/// control-message header is sized to the actual key count, not a fixed
/// capacity.
fn send_batch(
    stack: &dyn Stack,
    fd: RawFd,
    iovs: &[libc::iovec],
    mkeys: Option<&[PdKey]>,
    flags: c_int,
) -> io::Result<usize> {
    let mut cmsg_buf;
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iovs.len();

    if let Some(keys) = mkeys {
        let cmsg_len = unsafe { libc::CMSG_SPACE((keys.len() * size_of::<PdKey>()) as u32) } as usize;
        cmsg_buf = vec![0u8; cmsg_len];
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = cmsg_len;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        let cmsg_ref = unsafe { &mut *cmsg };
        cmsg_ref.cmsg_level = libc::SOL_SOCKET;
        cmsg_ref.cmsg_type = crate::stack::ffi::SCM_XLIO_PD;
        // Reduced to the actual fill, not the scratch buffer's capacity
        // (spec.md §4.4).
        let data_len = keys.len() * size_of::<PdKey>();
        cmsg_ref.cmsg_len = unsafe { libc::CMSG_LEN(data_len as u32) } as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(keys.as_ptr() as *const u8, libc::CMSG_DATA(cmsg), data_len);
        }
        msg.msg_controllen = cmsg_ref.cmsg_len;
    }

    stack.sendmsg(fd, &msg, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_storage_roundtrips_ipv4() {
        let addr: SocketAddr = "127.0.0.1:4420".parse().unwrap();
        let mut sa: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sin = unsafe { &mut *(&mut sa as *mut _ as *mut libc::sockaddr_in) };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = addr.port().to_be();
        sin.sin_addr.s_addr = u32::from(match addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        })
        .to_be();

        let decoded = sockaddr_storage_to_std(sa).unwrap();
        assert_eq!(decoded, addr);
    }
}
