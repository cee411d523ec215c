//! Stack binding (spec.md §4.1): an opaque, process-wide function table
//! resolved from a dynamically loaded vendor module.
//!
//! The binding is expressed as a trait (`Stack`) rather than a bag of
//! globals so that tests can inject a fake implementation instead of a
//! real `.so` (spec.md §9, "Stack function table"). Production code goes
//! through [`VendorStack`], which resolves every symbol via `libloading`
//! at [`load`] time and additionally fetches the vendor's *extended* API
//! (zero-copy receive, zero-copy free, allocator ioctl) through the
//! `SO_XLIO_GET_API` handshake described in spec.md §4.1.

pub mod ffi;

use std::ffi::c_void;
use std::io;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use libloading::{Library, Symbol};

use self::ffi::{
    FreePacket, RawPacketsHeader, XlioApi, CMSG_XLIO_IOCTL_USER_ALLOC, IOCTL_USER_ALLOC_RX,
    MSG_XLIO_ZCOPY, SO_XLIO_GET_API, SO_XLIO_PD,
};

/// Environment variable naming the vendor module to `dlopen`. Unset
/// disables the provider entirely (spec.md §4.1, §6).
pub const STACK_PATH_ENV: &str = "SOCK_XLIO_PATH";

/// Filename used when the variable is set but empty.
pub const DEFAULT_STACK_FILENAME: &str = "libxlio.so";

/// An RDMA protection-domain handle, scoping memory registrations to a
/// device context (GLOSSARY). Opaque to this crate beyond its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionDomain(pub(crate) *mut c_void);

/// One candidate resolved address, as returned by `getaddrinfo` (spec.md
/// §4.6).
#[derive(Debug, Clone, Copy)]
pub struct CandidateAddr {
    pub family: c_int,
    pub sock_type: c_int,
    pub protocol: c_int,
    pub addr: libc::sockaddr_storage,
    pub addr_len: libc::socklen_t,
}

/// A decoded packet from `recvfrom_zcopy`: the opaque id needed to free
/// it later, and its (borrowed, vendor-owned) iovecs.
pub struct ZcopyPacket {
    pub packet_id: *mut c_void,
    pub iovs: Vec<libc::iovec>,
}

/// The vendor stack's socket primitives plus its zero-copy extensions
/// (spec.md §4.1). Every method maps to one resolved symbol (or, for the
/// three `xlio_*` methods, to a call through the extended API pointer
/// fetched once at [`Stack::init`] time).
///
/// Not `Send`/`Sync`: the whole provider is single-threaded-per-group by
/// design (spec.md §5), and several vendor handles (the extended API
/// pointer, protection domains) are only ever touched from the thread
/// that owns the socket group.
pub trait Stack {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd>;
    fn bind(&self, fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()>;
    fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()>;
    fn connect(&self, fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()>;
    fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        len: *mut libc::socklen_t,
    ) -> io::Result<RawFd>;
    fn close(&self, fd: RawFd) -> io::Result<()>;
    fn readv(&self, fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize>;
    fn writev(&self, fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize>;
    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize>;
    fn sendmsg(&self, fd: RawFd, msg: &libc::msghdr, flags: c_int) -> io::Result<usize>;
    fn recvmsg(&self, fd: RawFd, msg: &mut libc::msghdr, flags: c_int) -> io::Result<usize>;
    fn epoll_create1(&self, flags: c_int) -> io::Result<RawFd>;
    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: c_int,
        fd: RawFd,
        event: *mut libc::epoll_event,
    ) -> io::Result<()>;
    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: c_int,
    ) -> io::Result<usize>;
    fn fcntl_getfl(&self, fd: RawFd) -> io::Result<c_int>;
    fn fcntl_setfl(&self, fd: RawFd, flags: c_int) -> io::Result<()>;
    fn ioctl_get_if_flags(&self, fd: RawFd, if_name: &str) -> io::Result<i16>;
    fn getsockopt_raw(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        buf: &mut [u8],
    ) -> io::Result<usize>;
    fn setsockopt_raw(&self, fd: RawFd, level: c_int, name: c_int, buf: &[u8]) -> io::Result<()>;
    fn getsockname(&self, fd: RawFd) -> io::Result<libc::sockaddr_storage>;
    fn getpeername(&self, fd: RawFd) -> io::Result<libc::sockaddr_storage>;
    fn getaddrinfo(&self, host: &str, service: &str) -> io::Result<Vec<CandidateAddr>>;

    /// Local network interfaces, for loopback detection (spec.md §4.6).
    /// Returns `(name, address, is_loopback)` triples.
    fn interface_addrs(&self) -> io::Result<Vec<(String, libc::sockaddr_storage, bool)>>;

    /// `SO_XLIO_GET_API`: fetch the vendor's extended function table.
    /// Called once, at [`init`].
    fn get_extended_api(&self) -> io::Result<XlioApi>;

    /// Register the caller's allocator pair with the stack via the
    /// extended API's `ioctl` (spec.md §4.1). Called once, at [`init`].
    fn register_allocator(
        &self,
        api: &XlioApi,
        alloc_fn: unsafe extern "C" fn(usize) -> *mut c_void,
        free_fn: unsafe extern "C" fn(*mut c_void),
    ) -> io::Result<()>;

    /// Zero-copy receive: drains the vendor's packet pool for `fd` into
    /// caller-owned [`ZcopyPacket`]s (spec.md §4.3).
    fn recvfrom_zcopy(&self, api: &XlioApi, fd: RawFd) -> io::Result<Vec<ZcopyPacket>>;

    /// Release a packet previously returned by `recvfrom_zcopy` back to
    /// the vendor stack.
    fn free_zcopy_packet(&self, api: &XlioApi, fd: RawFd, packet_id: *mut c_void) -> io::Result<()>;

    /// `SO_XLIO_PD`: the protection domain backing `fd`, if any (spec.md
    /// §4.6).
    fn get_protection_domain(&self, fd: RawFd) -> Option<ProtectionDomain>;
}

/// Production [`Stack`] implementation: every primitive is a symbol
/// resolved from a `dlopen`ed vendor module (spec.md §4.1).
pub struct VendorStack {
    // Kept alive for the process lifetime; dropping it would invalidate
    // every `Symbol` below.
    _lib: Library,
    socket: RawSym<unsafe extern "C" fn(c_int, c_int, c_int) -> c_int>,
    bind: RawSym<unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int>,
    listen: RawSym<unsafe extern "C" fn(c_int, c_int) -> c_int>,
    connect: RawSym<unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int>,
    accept:
        RawSym<unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int>,
    close: RawSym<unsafe extern "C" fn(c_int) -> c_int>,
    readv: RawSym<unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> isize>,
    writev: RawSym<unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> isize>,
    recv: RawSym<unsafe extern "C" fn(c_int, *mut c_void, usize, c_int) -> isize>,
    recvmsg: RawSym<unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> isize>,
    sendmsg: RawSym<unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> isize>,
    epoll_create1: RawSym<unsafe extern "C" fn(c_int) -> c_int>,
    epoll_ctl: RawSym<unsafe extern "C" fn(c_int, c_int, c_int, *mut libc::epoll_event) -> c_int>,
    epoll_wait:
        RawSym<unsafe extern "C" fn(c_int, *mut libc::epoll_event, c_int, c_int) -> c_int>,
    fcntl: RawSym<unsafe extern "C" fn(c_int, c_int, c_int) -> c_int>,
    ioctl: RawSym<unsafe extern "C" fn(c_int, u64, *mut c_void) -> c_int>,
    getsockopt: RawSym<
        unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut libc::socklen_t) -> c_int,
    >,
    setsockopt:
        RawSym<unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, libc::socklen_t) -> c_int>,
    getsockname:
        RawSym<unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int>,
    getpeername:
        RawSym<unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int>,
    getaddrinfo: RawSym<
        unsafe extern "C" fn(
            *const i8,
            *const i8,
            *const libc::addrinfo,
            *mut *mut libc::addrinfo,
        ) -> c_int,
    >,
    freeaddrinfo: RawSym<unsafe extern "C" fn(*mut libc::addrinfo)>,
}

/// A resolved symbol, boxed so `VendorStack` doesn't need a lifetime
/// parameter tied to `Library`'s borrow. Safe because `_lib` outlives
/// every `RawSym`.
struct RawSym<F>(F);

impl VendorStack {
    /// Implements spec.md §4.1 "Stack binding": read `SOCK_XLIO_PATH`,
    /// `dlopen` it (or the built-in default if the variable is set but
    /// empty), and resolve every base primitive by name. Returns `Ok(None)`
    /// if the variable is unset — "the provider declines to register
    /// itself" — rather than an error, since that's a normal outcome.
    pub fn load() -> io::Result<Option<VendorStack>> {
        let path = match std::env::var(STACK_PATH_ENV) {
            Ok(p) if p.is_empty() => DEFAULT_STACK_FILENAME.to_string(),
            Ok(p) => p,
            Err(_) => {
                debug_log!("{} is not set; xlio-sock will not register", STACK_PATH_ENV);
                return Ok(None);
            }
        };

        let lib = unsafe { Library::new(&path) }.map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to load vendor stack '{path}': {e}"),
            )
        })?;

        // `Symbol<T>` derefs to `&T`; copying `*s` out detaches the function
        // pointer from the `Symbol`'s borrow of `lib`. Sound as long as
        // `lib` (held in `_lib` below) outlives every call through it.
        macro_rules! sym {
            ($name:literal) => {{
                let s: Symbol<_> = unsafe { lib.get($name) }.map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("symbol '{}' missing from vendor stack: {e}", $name),
                    )
                })?;
                RawSym(*s)
            }};
        }

        let stack = VendorStack {
            socket: sym!(b"socket"),
            bind: sym!(b"bind"),
            listen: sym!(b"listen"),
            connect: sym!(b"connect"),
            accept: sym!(b"accept"),
            close: sym!(b"close"),
            readv: sym!(b"readv"),
            writev: sym!(b"writev"),
            recv: sym!(b"recv"),
            recvmsg: sym!(b"recvmsg"),
            sendmsg: sym!(b"sendmsg"),
            epoll_create1: sym!(b"epoll_create1"),
            epoll_ctl: sym!(b"epoll_ctl"),
            epoll_wait: sym!(b"epoll_wait"),
            fcntl: sym!(b"fcntl"),
            ioctl: sym!(b"ioctl"),
            getsockopt: sym!(b"getsockopt"),
            setsockopt: sym!(b"setsockopt"),
            getsockname: sym!(b"getsockname"),
            getpeername: sym!(b"getpeername"),
            getaddrinfo: sym!(b"getaddrinfo"),
            freeaddrinfo: sym!(b"freeaddrinfo"),
            _lib: lib,
        };
        Ok(Some(stack))
    }
}

impl Stack for VendorStack {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
        checked(unsafe { (self.socket.0)(domain, ty, protocol) })
    }

    fn bind(&self, fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
        checked(unsafe { (self.bind.0)(fd, addr, len) }).map(|_| ())
    }

    fn listen(&self, fd: RawFd, backlog: c_int) -> io::Result<()> {
        checked(unsafe { (self.listen.0)(fd, backlog) }).map(|_| ())
    }

    fn connect(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        len: libc::socklen_t,
    ) -> io::Result<()> {
        checked(unsafe { (self.connect.0)(fd, addr, len) }).map(|_| ())
    }

    fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        len: *mut libc::socklen_t,
    ) -> io::Result<RawFd> {
        checked(unsafe { (self.accept.0)(fd, addr, len) })
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        checked(unsafe { (self.close.0)(fd) }).map(|_| ())
    }

    fn readv(&self, fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
        checked_isize(unsafe { (self.readv.0)(fd, iov.as_ptr(), iov.len() as c_int) })
    }

    fn writev(&self, fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
        checked_isize(unsafe { (self.writev.0)(fd, iov.as_ptr(), iov.len() as c_int) })
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        checked_isize(unsafe {
            (self.recv.0)(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
        })
    }

    fn sendmsg(&self, fd: RawFd, msg: &libc::msghdr, flags: c_int) -> io::Result<usize> {
        checked_isize(unsafe { (self.sendmsg.0)(fd, msg, flags) })
    }

    fn recvmsg(&self, fd: RawFd, msg: &mut libc::msghdr, flags: c_int) -> io::Result<usize> {
        checked_isize(unsafe { (self.recvmsg.0)(fd, msg, flags) })
    }

    fn epoll_create1(&self, flags: c_int) -> io::Result<RawFd> {
        checked(unsafe { (self.epoll_create1.0)(flags) })
    }

    fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: c_int,
        fd: RawFd,
        event: *mut libc::epoll_event,
    ) -> io::Result<()> {
        checked(unsafe { (self.epoll_ctl.0)(epfd, op, fd, event) }).map(|_| ())
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [libc::epoll_event],
        timeout_ms: c_int,
    ) -> io::Result<usize> {
        let n = checked(unsafe {
            (self.epoll_wait.0)(epfd, events.as_mut_ptr(), events.len() as c_int, timeout_ms)
        })?;
        Ok(n as usize)
    }

    fn fcntl_getfl(&self, fd: RawFd) -> io::Result<c_int> {
        checked(unsafe { (self.fcntl.0)(fd, libc::F_GETFL, 0) })
    }

    fn fcntl_setfl(&self, fd: RawFd, flags: c_int) -> io::Result<()> {
        checked(unsafe { (self.fcntl.0)(fd, libc::F_SETFL, flags) }).map(|_| ())
    }

    fn ioctl_get_if_flags(&self, fd: RawFd, if_name: &str) -> io::Result<i16> {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let bytes = if_name.as_bytes();
        let n = bytes.len().min(ifr.ifr_name.len() - 1);
        for (dst, src) in ifr.ifr_name[..n].iter_mut().zip(&bytes[..n]) {
            *dst = *src as i8;
        }
        checked(unsafe {
            (self.ioctl.0)(fd, libc::SIOCGIFFLAGS, &mut ifr as *mut _ as *mut c_void)
        })?;
        Ok(unsafe { ifr.ifr_ifru.ifru_flags })
    }

    fn getsockopt_raw(
        &self,
        fd: RawFd,
        level: c_int,
        name: c_int,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut len = buf.len() as libc::socklen_t;
        checked(unsafe {
            (self.getsockopt.0)(fd, level, name, buf.as_mut_ptr() as *mut c_void, &mut len)
        })?;
        Ok(len as usize)
    }

    fn setsockopt_raw(&self, fd: RawFd, level: c_int, name: c_int, buf: &[u8]) -> io::Result<()> {
        checked(unsafe {
            (self.setsockopt.0)(
                fd,
                level,
                name,
                buf.as_ptr() as *const c_void,
                buf.len() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    fn getsockname(&self, fd: RawFd) -> io::Result<libc::sockaddr_storage> {
        let mut sa: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        checked(unsafe { (self.getsockname.0)(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) })?;
        Ok(sa)
    }

    fn getpeername(&self, fd: RawFd) -> io::Result<libc::sockaddr_storage> {
        let mut sa: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        checked(unsafe { (self.getpeername.0)(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) })?;
        Ok(sa)
    }

    fn getaddrinfo(&self, host: &str, service: &str) -> io::Result<Vec<CandidateAddr>> {
        let host_c = std::ffi::CString::new(host)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "host contains NUL"))?;
        let service_c = std::ffi::CString::new(service)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "service contains NUL"))?;

        let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
        hints.ai_family = libc::PF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        hints.ai_flags = libc::AI_NUMERICSERV | libc::AI_PASSIVE | libc::AI_NUMERICHOST;

        let mut res0: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe {
            (self.getaddrinfo.0)(host_c.as_ptr(), service_c.as_ptr(), &hints, &mut res0)
        };
        if rc != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("getaddrinfo failed: {rc}"),
            ));
        }

        let mut out = Vec::new();
        let mut cur = res0;
        while !cur.is_null() {
            let ai = unsafe { &*cur };
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ai.ai_addr as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    ai.ai_addrlen as usize,
                );
            }
            out.push(CandidateAddr {
                family: ai.ai_family,
                sock_type: ai.ai_socktype,
                protocol: ai.ai_protocol,
                addr: storage,
                addr_len: ai.ai_addrlen,
            });
            cur = ai.ai_next;
        }
        unsafe { (self.freeaddrinfo.0)(res0) };
        Ok(out)
    }

    fn interface_addrs(&self) -> io::Result<Vec<(String, libc::sockaddr_storage, bool)>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        checked(unsafe { libc::getifaddrs(&mut head) })?;
        let mut out = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            let ifa = unsafe { &*cur };
            if !ifa.ifa_addr.is_null() {
                let family = unsafe { (*ifa.ifa_addr).sa_family as c_int };
                let len = match family {
                    libc::AF_INET => std::mem::size_of::<libc::sockaddr_in>(),
                    libc::AF_INET6 => std::mem::size_of::<libc::sockaddr_in6>(),
                    _ => 0,
                };
                if len > 0 {
                    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            ifa.ifa_addr as *const u8,
                            &mut storage as *mut _ as *mut u8,
                            len,
                        );
                    }
                    let name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) }
                        .to_string_lossy()
                        .into_owned();
                    let is_loopback = ifa.ifa_flags & (libc::IFF_LOOPBACK as u32) != 0;
                    out.push((name, storage, is_loopback));
                }
            }
            cur = ifa.ifa_next;
        }
        unsafe { libc::freeifaddrs(head) };
        Ok(out)
    }

    fn get_extended_api(&self) -> io::Result<XlioApi> {
        let mut api_ptr: *mut XlioApi = std::ptr::null_mut();
        let mut len = std::mem::size_of::<*mut XlioApi>() as libc::socklen_t;
        checked(unsafe {
            (self.getsockopt.0)(
                -2,
                libc::SOL_SOCKET,
                SO_XLIO_GET_API,
                &mut api_ptr as *mut _ as *mut c_void,
                &mut len,
            )
        })?;
        if api_ptr.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "vendor stack returned a null API pointer"));
        }
        Ok(unsafe { std::ptr::read(api_ptr) })
    }

    fn register_allocator(
        &self,
        api: &XlioApi,
        alloc_fn: unsafe extern "C" fn(usize) -> *mut c_void,
        free_fn: unsafe extern "C" fn(*mut c_void),
    ) -> io::Result<()> {
        #[repr(C, packed)]
        struct AllocData {
            flags: u8,
            alloc_func: unsafe extern "C" fn(usize) -> *mut c_void,
            free_func: unsafe extern "C" fn(*mut c_void),
        }
        let data = AllocData {
            flags: IOCTL_USER_ALLOC_RX,
            alloc_func: alloc_fn,
            free_func: free_fn,
        };

        let cmsg_len = std::mem::size_of::<libc::cmsghdr>() + std::mem::size_of::<AllocData>();
        let mut buf = vec![0u8; cmsg_len];
        unsafe {
            let cmsg = buf.as_mut_ptr() as *mut libc::cmsghdr;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = CMSG_XLIO_IOCTL_USER_ALLOC;
            (*cmsg).cmsg_len = cmsg_len;
            std::ptr::copy_nonoverlapping(
                &data as *const AllocData as *const u8,
                buf.as_mut_ptr().add(std::mem::size_of::<libc::cmsghdr>()),
                std::mem::size_of::<AllocData>(),
            );
            let cmsg = buf.as_ptr() as *const libc::cmsghdr;
            checked((api.ioctl)(cmsg, cmsg_len))?;
        }
        Ok(())
    }

    fn recvfrom_zcopy(&self, api: &XlioApi, fd: RawFd) -> io::Result<Vec<ZcopyPacket>> {
        let mut scratch = [0u8; ffi::XLIO_PACKETS_BUF_SIZE];
        let mut flags: c_int = 0;
        let ret = unsafe {
            (api.recvfrom_zcopy)(
                fd,
                scratch.as_mut_ptr() as *mut c_void,
                scratch.len(),
                &mut flags,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret <= 0 {
            return checked_isize(ret).map(|_| Vec::new());
        }
        if flags & MSG_XLIO_ZCOPY == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "zero-copy receive was not performed",
            ));
        }

        let header = scratch.as_ptr() as *const RawPacketsHeader;
        let n = unsafe { (*header).n_packet_num };
        let mut packets = Vec::with_capacity(n);
        let mut cur = unsafe { (*header).first_packet() };
        for _ in 0..n {
            let raw = unsafe { &*cur };
            let iovs = unsafe { raw.iovs() }.to_vec();
            packets.push(ZcopyPacket {
                packet_id: raw.packet_id,
                iovs,
            });
            cur = unsafe { raw.next() };
        }
        Ok(packets)
    }

    fn free_zcopy_packet(&self, api: &XlioApi, fd: RawFd, packet_id: *mut c_void) -> io::Result<()> {
        let pkt = FreePacket {
            packet_id,
            sz_iov: 0,
        };
        checked(unsafe { (api.recvfrom_zcopy_free_packets)(fd, &pkt, 1) }).map(|_| ())
    }

    fn get_protection_domain(&self, fd: RawFd) -> Option<ProtectionDomain> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let mut len = std::mem::size_of::<*mut c_void>() as libc::socklen_t;
        let rc = unsafe {
            (self.getsockopt.0)(
                fd,
                libc::SOL_SOCKET,
                SO_XLIO_PD,
                &mut ptr as *mut _ as *mut c_void,
                &mut len,
            )
        };
        if rc < 0 || ptr.is_null() {
            None
        } else {
            Some(ProtectionDomain(ptr))
        }
    }
}

fn checked(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn checked_isize(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Process-wide stack handle, set once by [`init`] and cleared by
/// [`teardown`]. `OnceLock` gives us the "initialized once" half of
/// spec.md §5's "Shared resources"; the null-check on free (spec.md §9,
/// "Process-wide state") is handled by simply never freeing
/// vendor-allocated memory after teardown (see [`teardown`]).
static STACK: OnceLock<Box<dyn Stack>> = OnceLock::new();
static EXTENDED_API: OnceLock<XlioApi> = OnceLock::new();

/// Set by [`teardown`]. `OnceLock` has no safe "clear" for a `'static`
/// handle shared across threads, so teardown is modeled as a flag rather
/// than actually dropping the `Box<dyn Stack>`: every entry point that
/// would otherwise touch the stack after teardown (notably the injected
/// `free_fn` the registration constructor hands to the vendor) checks
/// [`is_initialized`] first and drops the call on the floor if it's
/// false, matching spec.md §9's "refusing to free when the handle is
/// null".
static TORN_DOWN: AtomicBool = AtomicBool::new(false);

/// Load the vendor module and perform the init handshake (spec.md §4.1):
/// fetch the extended API, then register the allocator pair. Returns
/// `Ok(false)` if the environment variable was unset (decline silently);
/// `Ok(true)` on success; `Err` on any failure past that point, which the
/// registration constructor treats as "do not register".
pub fn init(
    alloc_fn: unsafe extern "C" fn(usize) -> *mut c_void,
    free_fn: unsafe extern "C" fn(*mut c_void),
) -> io::Result<bool> {
    let Some(stack) = VendorStack::load()? else {
        return Ok(false);
    };
    let api = stack.get_extended_api()?;
    stack.register_allocator(&api, alloc_fn, free_fn)?;

    let _ = STACK.set(Box::new(stack));
    let _ = EXTENDED_API.set(api);
    Ok(true)
}

/// Access the process-wide stack. Panics if [`init`] has not succeeded —
/// every entry point that needs a `Stack` is only reachable once
/// registration has completed.
pub fn stack() -> &'static dyn Stack {
    STACK.get().expect("xlio-sock stack used before init()").as_ref()
}

pub fn extended_api() -> &'static XlioApi {
    EXTENDED_API
        .get()
        .expect("xlio-sock extended API used before init()")
}

/// Whether the stack has been initialized and not yet torn down (used by
/// the registration constructor/destructor pair, and by the allocator
/// pair's `free_fn`, to decide whether the stack is still live).
pub fn is_initialized() -> bool {
    STACK.get().is_some() && !TORN_DOWN.load(Ordering::Acquire)
}

/// Reverse [`init`] (spec.md §4.1, "Teardown reverses these steps"). Does
/// not attempt to unwind the vendor module itself — `VendorStack`'s
/// `Library` is unloaded on process exit along with everything else;
/// this just stops the provider from handing out the stack or honoring
/// further frees, so a destructor race with a late vendor-internal free
/// lands on the "refuse" side (spec.md §9).
pub fn teardown() {
    TORN_DOWN.store(true, Ordering::Release);
}
