//! Socket group / poller (spec.md §4.7).
//!
//! A [`SocketGroup`] multiplexes many sockets across one readiness
//! descriptor (`epoll` on Linux), fairly rotating a "pending receive"
//! queue that survives across poll cycles (spec.md §3 "Socket group"
//! invariants).

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use crate::socket::Socket;
use crate::stack::Stack;

/// Token identifying a socket within a group; stable for the socket's
/// lifetime in the group (spec.md §9, "back-reference by index, not by
/// raw pointer" applied here too, for the same relocatability reason).
pub type Token = u32;

/// Slot bookkeeping for the group's socket slab. Growable, unlike the
/// fixed-capacity packet/buffer pools (spec.md §4.2) — a group's socket
/// count isn't bounded up front.
enum Slot {
    Occupied(Socket),
    Free(Option<u32>),
}

/// Maximum epoll/kevent events read per `poll` call in one batch.
const MAX_EVENTS_PER_POLL: usize = 32;

pub struct SocketGroup {
    stack: &'static dyn Stack,
    epfd: RawFd,
    slots: Vec<Slot>,
    free_head: Option<u32>,
    /// Insertion order, walked for the per-poll flush pass (spec.md §4.7
    /// step 1). Removal is O(n) but group membership changes are rare
    /// relative to poll frequency.
    order: Vec<Token>,
    pending_recv: VecDeque<Token>,
}

impl SocketGroup {
    pub fn new(stack: &'static dyn Stack) -> io::Result<SocketGroup> {
        let epfd = stack.epoll_create1(0)?;
        Ok(SocketGroup { stack, epfd, slots: Vec::new(), free_head: None, order: Vec::new(), pending_recv: VecDeque::new() })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn get(&self, token: Token) -> &Socket {
        match &self.slots[token as usize] {
            Slot::Occupied(s) => s,
            Slot::Free(_) => panic!("xlio-sock: access to a removed socket token"),
        }
    }

    fn get_mut(&mut self, token: Token) -> &mut Socket {
        match &mut self.slots[token as usize] {
            Slot::Occupied(s) => s,
            Slot::Free(_) => panic!("xlio-sock: access to a removed socket token"),
        }
    }

    pub fn socket(&self, token: Token) -> &Socket {
        self.get(token)
    }

    pub fn socket_mut(&mut self, token: Token) -> &mut Socket {
        self.get_mut(token)
    }

    /// Register `socket` for read-readiness and error events (spec.md
    /// §4.7). Returns the token the caller uses to look the socket back
    /// up (via [`SocketGroup::socket`]/[`SocketGroup::socket_mut`]) and
    /// to remove it later.
    pub fn add_sock(&mut self, socket: Socket) -> io::Result<Token> {
        let fd = socket.fd();

        let token = match self.free_head {
            Some(idx) => {
                self.free_head = match &self.slots[idx as usize] {
                    Slot::Free(next) => *next,
                    Slot::Occupied(_) => unreachable!(),
                };
                self.slots[idx as usize] = Slot::Occupied(socket);
                idx
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot::Occupied(socket));
                idx
            }
        };

        let mut event = libc::epoll_event { events: (libc::EPOLLIN | libc::EPOLLERR) as u32, u64: token as u64 };
        if let Err(e) = self.stack.epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) {
            self.slots[token as usize] = Slot::Free(self.free_head);
            self.free_head = Some(token);
            return Err(e);
        }

        self.order.push(token);
        Ok(token)
    }

    /// Unregister a socket and abort all of its outstanding requests
    /// (spec.md §4.7 "Remove-socket"). The caller owns the returned
    /// [`Socket`] (normally to call [`Socket::close`] on it).
    pub fn remove_sock(&mut self, token: Token) -> io::Result<Socket> {
        let fd = self.get(token).fd();
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        let rc = self.stack.epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event);

        let slot = std::mem::replace(&mut self.slots[token as usize], Slot::Free(self.free_head));
        self.free_head = Some(token);
        self.order.retain(|&t| t != token);
        self.pending_recv.retain(|&t| t != token);

        let mut socket = match slot {
            Slot::Occupied(s) => s,
            Slot::Free(_) => unreachable!("token just validated by self.get()"),
        };
        socket.abort_requests(|| io::Error::new(io::ErrorKind::Other, "socket removed from group"));

        rc.map(|_| socket)
    }

    /// `group_impl_get_optimal` stub (spec.md SPEC_FULL §B): this core
    /// never implements sock-group affinity, so it always declines.
    pub fn optimal_group_for(&self, _fd: RawFd) -> Option<()> {
        None
    }

    /// Run one poll tick (spec.md §4.7). Emits up to `max` ready tokens
    /// into `out` (cleared first) and returns how many were emitted, or
    /// an error if the readiness query itself failed.
    pub fn poll(&mut self, max: usize, out: &mut Vec<Token>) -> io::Result<usize> {
        out.clear();

        // Step 1: flush every socket's transmit queue (and reap zero-copy
        // completions). Collect `order` up front since a completion
        // callback could, in principle, remove a socket mid-iteration.
        for &token in self.order.clone().iter() {
            if !matches!(self.slots.get(token as usize), Some(Slot::Occupied(_))) {
                continue;
            }
            let socket = self.get_mut(token);
            match socket.flush() {
                Ok(completed_any) => {
                    if completed_any && !socket.pending_recv {
                        socket.pending_recv = true;
                        self.pending_recv.push_back(token);
                    }
                }
                Err(_) => socket.abort_requests(|| io::Error::new(io::ErrorKind::Other, "flush failed")),
            }
        }

        // Step 2: query readiness with a zero timeout — this core never
        // blocks (spec.md §5).
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS_PER_POLL];
        let n = match self.stack.epoll_wait(self.epfd, &mut events, 0) {
            Ok(n) => n,
            Err(e) => return Err(e),
        };

        // Step 3: busy-poll hint. With zero events and a non-empty group,
        // peek the first socket if it has a nonzero priority.
        if n == 0 && !self.order.is_empty() {
            let token = self.order[0];
            let socket = self.get(token);
            if socket.priority() != 0 {
                let mut byte = [0u8; 1];
                let _ = self.stack.recv(socket.fd(), &mut byte, libc::MSG_PEEK);
            }
        }

        // Step 4: dispatch ready events.
        for event in &events[..n] {
            let token = event.u64 as Token;
            if !matches!(self.slots.get(token as usize), Some(Slot::Occupied(_))) {
                continue;
            }

            if event.events & (libc::EPOLLERR as u32) != 0 {
                let socket = self.get_mut(token);
                let completed = crate::reaper::reap(self.stack, socket.fd(), socket.batcher_mut()) > 0;
                if completed && !socket.pending_recv {
                    socket.pending_recv = true;
                    self.pending_recv.push_back(token);
                }
                if !matches!(self.slots.get(token as usize), Some(Slot::Occupied(_))) || !self.get(token).has_callback() {
                    continue;
                }
            }

            if event.events & (libc::EPOLLIN as u32) == 0 {
                continue;
            }
            let socket = self.get_mut(token);
            if !socket.pending_recv {
                socket.pending_recv = true;
                self.pending_recv.push_back(token);
            }
        }

        // Step 5: emit up to `max` sockets from the front of the
        // pending-receive queue, skipping (and dequeuing) any whose
        // callback was cleared, then rotate the queue.
        let mut emitted = 0usize;
        let mut requeue = VecDeque::new();
        while let Some(token) = self.pending_recv.pop_front() {
            if emitted == max {
                requeue.push_back(token);
                continue;
            }
            if !matches!(self.slots.get(token as usize), Some(Slot::Occupied(_))) {
                continue;
            }
            if !self.get(token).has_callback() {
                self.get_mut(token).pending_recv = false;
                continue;
            }
            out.push(token);
            self.get_mut(token).pending_recv = false;
            emitted += 1;
        }
        self.pending_recv = requeue;

        Ok(emitted)
    }
}

impl Drop for SocketGroup {
    fn drop(&mut self) {
        let _ = self.stack.close(self.epfd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketOpts;
    use crate::stack::{CandidateAddr, ProtectionDomain, ZcopyPacket};
    use std::cell::RefCell;
    use std::os::raw::{c_int, c_void};
    use std::sync::Mutex;

    /// A minimal fake [`Stack`] sufficient to exercise the group poller
    /// end to end without a real vendor module: one socket, a scripted
    /// sequence of epoll_wait results, and no-op everything else.
    struct FakeStack {
        next_fd: Mutex<RawFd>,
        epoll_registered: Mutex<Vec<(RawFd, u64)>>,
        wait_script: Mutex<VecDeque<Vec<(u64, u32)>>>,
    }

    impl FakeStack {
        fn new(script: Vec<Vec<(u64, u32)>>) -> FakeStack {
            FakeStack {
                next_fd: Mutex::new(100),
                epoll_registered: Mutex::new(Vec::new()),
                wait_script: Mutex::new(script.into()),
            }
        }
    }

    impl Stack for FakeStack {
        fn socket(&self, _: c_int, _: c_int, _: c_int) -> io::Result<RawFd> {
            let mut fd = self.next_fd.lock().unwrap();
            *fd += 1;
            Ok(*fd)
        }
        fn bind(&self, _: RawFd, _: *const libc::sockaddr, _: libc::socklen_t) -> io::Result<()> { Ok(()) }
        fn listen(&self, _: RawFd, _: c_int) -> io::Result<()> { Ok(()) }
        fn connect(&self, _: RawFd, _: *const libc::sockaddr, _: libc::socklen_t) -> io::Result<()> { Ok(()) }
        fn accept(&self, _: RawFd, _: *mut libc::sockaddr, _: *mut libc::socklen_t) -> io::Result<RawFd> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
        fn close(&self, _: RawFd) -> io::Result<()> { Ok(()) }
        fn readv(&self, _: RawFd, _: &mut [libc::iovec]) -> io::Result<usize> { Ok(0) }
        fn writev(&self, _: RawFd, _: &[libc::iovec]) -> io::Result<usize> { Ok(0) }
        fn recv(&self, _: RawFd, _: &mut [u8], _: c_int) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
        fn sendmsg(&self, _: RawFd, msg: &libc::msghdr, _: c_int) -> io::Result<usize> {
            let mut total = 0;
            for i in 0..msg.msg_iovlen {
                let iov = unsafe { &*(msg.msg_iov.add(i)) };
                total += iov.iov_len;
            }
            Ok(total)
        }
        fn recvmsg(&self, _: RawFd, _: &mut libc::msghdr, _: c_int) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EAGAIN))
        }
        fn epoll_create1(&self, _: c_int) -> io::Result<RawFd> { Ok(9000) }
        fn epoll_ctl(&self, _: RawFd, op: c_int, fd: RawFd, event: *mut libc::epoll_event) -> io::Result<()> {
            let mut reg = self.epoll_registered.lock().unwrap();
            if op == libc::EPOLL_CTL_ADD {
                reg.push((fd, unsafe { (*event).u64 }));
            } else if op == libc::EPOLL_CTL_DEL {
                reg.retain(|&(f, _)| f != fd);
            }
            Ok(())
        }
        fn epoll_wait(&self, _: RawFd, events: &mut [libc::epoll_event], _: c_int) -> io::Result<usize> {
            let mut script = self.wait_script.lock().unwrap();
            let batch = script.pop_front().unwrap_or_default();
            for (i, (u64_val, ev)) in batch.iter().enumerate() {
                events[i] = libc::epoll_event { events: *ev, u64: *u64_val };
            }
            Ok(batch.len())
        }
        fn fcntl_getfl(&self, _: RawFd) -> io::Result<c_int> { Ok(0) }
        fn fcntl_setfl(&self, _: RawFd, _: c_int) -> io::Result<()> { Ok(()) }
        fn ioctl_get_if_flags(&self, _: RawFd, _: &str) -> io::Result<i16> { Ok(0) }
        fn getsockopt_raw(&self, _: RawFd, _: c_int, _: c_int, _: &mut [u8]) -> io::Result<usize> { Ok(0) }
        fn setsockopt_raw(&self, _: RawFd, _: c_int, _: c_int, _: &[u8]) -> io::Result<()> { Ok(()) }
        fn getsockname(&self, _: RawFd) -> io::Result<libc::sockaddr_storage> { Ok(unsafe { std::mem::zeroed() }) }
        fn getpeername(&self, _: RawFd) -> io::Result<libc::sockaddr_storage> { Ok(unsafe { std::mem::zeroed() }) }
        fn getaddrinfo(&self, _: &str, _: &str) -> io::Result<Vec<CandidateAddr>> {
            Ok(vec![CandidateAddr {
                family: libc::AF_INET,
                sock_type: libc::SOCK_STREAM,
                protocol: 0,
                addr: unsafe { std::mem::zeroed() },
                addr_len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            }])
        }
        fn interface_addrs(&self) -> io::Result<Vec<(String, libc::sockaddr_storage, bool)>> { Ok(vec![]) }
        fn get_extended_api(&self) -> io::Result<crate::stack::ffi::XlioApi> {
            unimplemented!("not exercised by group tests")
        }
        fn register_allocator(
            &self,
            _: &crate::stack::ffi::XlioApi,
            _: unsafe extern "C" fn(usize) -> *mut c_void,
            _: unsafe extern "C" fn(*mut c_void),
        ) -> io::Result<()> { Ok(()) }
        fn recvfrom_zcopy(&self, _: &crate::stack::ffi::XlioApi, _: RawFd) -> io::Result<Vec<ZcopyPacket>> { Ok(vec![]) }
        fn free_zcopy_packet(&self, _: &crate::stack::ffi::XlioApi, _: RawFd, _: *mut c_void) -> io::Result<()> { Ok(()) }
        fn get_protection_domain(&self, _: RawFd) -> Option<ProtectionDomain> { None }
    }

    /// Leaks a [`FakeStack`] to get a genuine `'static` reference — the
    /// same lifetime production code gets from [`crate::stack::stack`],
    /// without reaching for `unsafe` `transmute` in test code.
    fn make_group(script: Vec<Vec<(u64, u32)>>) -> (&'static FakeStack, SocketGroup) {
        let stack: &'static FakeStack = Box::leak(Box::new(FakeStack::new(script)));
        let group = SocketGroup::new(stack as &dyn Stack).unwrap();
        (stack, group)
    }

    #[test]
    fn poll_rotates_pending_receive_queue() {
        let (stack, mut group) = make_group(vec![vec![(0, libc::EPOLLIN as u32)], vec![]]);
        let sock = Socket::create_connect(stack as &dyn Stack, "127.0.0.1", 4420, &SocketOpts::default()).unwrap();
        let token = group.add_sock(sock).unwrap();

        let mut out = Vec::new();
        let n = group.poll(4, &mut out).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, vec![token]);

        // Second poll: no new events, queue should be empty now (rotated
        // out after the first poll emitted it).
        let n = group.poll(4, &mut out).unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn remove_sock_aborts_outstanding_requests() {
        let (stack, mut group) = make_group(vec![]);
        let sock = Socket::create_connect(stack as &dyn Stack, "127.0.0.1", 4420, &SocketOpts::default()).unwrap();
        let token = group.add_sock(sock).unwrap();

        let results = RefCell::new(Vec::new());
        let buf = vec![0u8; 8].leak();
        group.socket_mut(token).writev_async(crate::request::SendRequest::new(
            vec![libc::iovec { iov_base: buf.as_mut_ptr() as *mut _, iov_len: buf.len() }],
            None,
            false,
            Box::new(|r| results.borrow_mut().push(r)),
        )).unwrap();

        let removed = group.remove_sock(token).unwrap();
        assert_eq!(results.borrow().len(), 1);
        assert!(results.borrow()[0].is_err());
        removed.close().unwrap();
    }
}
