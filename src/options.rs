//! Provider-wide options (spec.md §6, `SockImplOpts`).

use std::mem::size_of;
use std::ptr;
use std::sync::{Mutex, OnceLock};

/// Minimum kernel socket buffer sizes the provider will ever request,
/// regardless of what a caller asks for.
pub const MIN_SO_RCVBUF_SIZE: i32 = 2 * 1024 * 1024;
pub const MIN_SO_SNDBUF_SIZE: i32 = 2 * 1024 * 1024;

/// Default zero-copy threshold, in bytes: below this, a send without
/// memory keys goes out as a plain (non zero-copy) `sendmsg`.
pub const DEFAULT_ZEROCOPY_THRESHOLD: u32 = 4096;

/// Provider-level options, settable independently of any one socket.
///
/// Mirrors `struct spdk_sock_impl_opts` in the original: every field is
/// independently gettable/settable and the struct is versioned by
/// declared length rather than by a schema, so that a caller linked
/// against an older or newer version of this crate can still round-trip
/// the fields it knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SockImplOpts {
    pub recv_buf_size: u32,
    pub send_buf_size: u32,
    /// Advisory; this core does not implement a receive pipe.
    pub enable_recv_pipe: bool,
    pub enable_zerocopy_send: bool,
    pub enable_quickack: bool,
    /// Advisory; no placement-id support in this core.
    pub enable_placement_id: bool,
    pub enable_zerocopy_send_server: bool,
    pub enable_zerocopy_send_client: bool,
    pub enable_zerocopy_recv: bool,
    pub zerocopy_threshold: u32,
}

impl Default for SockImplOpts {
    fn default() -> Self {
        SockImplOpts {
            recv_buf_size: MIN_SO_RCVBUF_SIZE as u32,
            send_buf_size: MIN_SO_SNDBUF_SIZE as u32,
            enable_recv_pipe: false,
            enable_zerocopy_send: true,
            enable_quickack: false,
            enable_placement_id: false,
            enable_zerocopy_send_server: true,
            enable_zerocopy_send_client: true,
            enable_zerocopy_recv: true,
            zerocopy_threshold: DEFAULT_ZEROCOPY_THRESHOLD,
        }
    }
}

impl SockImplOpts {
    /// Copy up to `len` bytes of `self` (in declared field order) into
    /// `dst`, truncating to whichever of `len` and `size_of::<Self>()` is
    /// shorter. Returns the number of bytes actually written.
    ///
    /// This is the Rust-shaped equivalent of the original's
    /// `FIELD_OK`/`GET_FIELD` macro pair: instead of testing each field's
    /// offset against the caller's declared length individually, we copy
    /// a single `min(len, size_of::<Self>())`-byte prefix of the
    /// `#[repr(C)]` struct. Because fields are declared in the same order
    /// as the original C struct, a short `len` still yields exactly the
    /// same "leading fields only" truncation.
    pub fn get(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(size_of::<Self>());
        unsafe {
            ptr::copy_nonoverlapping(self as *const Self as *const u8, dst.as_mut_ptr(), n);
        }
        n
    }

    /// Overwrite the leading `min(src.len(), size_of::<Self>())` bytes of
    /// `self` from `src`. See [`SockImplOpts::get`] for the truncation
    /// rule.
    pub fn set(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(size_of::<Self>());
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self as *mut Self as *mut u8, n);
        }
        n
    }
}

/// Process-wide options singleton, the Rust shape of
/// `g_spdk_xlio_sock_impl_opts`. Guarded by a `Mutex` rather than
/// per-group state since registration-time `get`/`set` calls can race
/// with socket creation on another group's thread (spec.md §5 notes
/// groups themselves don't share sockets, but the options struct is
/// explicitly process-wide, spec.md §6).
static GLOBAL_OPTS: OnceLock<Mutex<SockImplOpts>> = OnceLock::new();

fn global_opts() -> &'static Mutex<SockImplOpts> {
    GLOBAL_OPTS.get_or_init(|| Mutex::new(SockImplOpts::default()))
}

/// A snapshot of the current provider-wide options, for internal callers
/// (socket creation, the transmit batcher) that just need the values.
pub fn global() -> SockImplOpts {
    *global_opts().lock().unwrap()
}

/// `spdk_sock_impl_get_opts` equivalent: copy the current options into
/// `dst`, truncated to its length (spec.md §6).
pub fn get_opts_raw(dst: &mut [u8]) -> usize {
    global_opts().lock().unwrap().get(dst)
}

/// `spdk_sock_impl_set_opts` equivalent: overwrite the leading prefix of
/// the global options from `src` (spec.md §6).
pub fn set_opts_raw(src: &[u8]) -> usize {
    global_opts().lock().unwrap().set(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_original_constants() {
        let opts = SockImplOpts::default();
        assert!(opts.enable_zerocopy_send);
        assert!(opts.enable_zerocopy_recv);
        assert!(!opts.enable_quickack);
        assert_eq!(opts.zerocopy_threshold, 4096);
    }

    #[test]
    fn get_truncates_to_caller_length() {
        let opts = SockImplOpts::default();
        let mut short = [0u8; 4];
        let n = opts.get(&mut short);
        assert_eq!(n, 4);
        // First field is recv_buf_size: u32, little-endian on the archs we
        // care about.
        assert_eq!(u32::from_ne_bytes(short), opts.recv_buf_size);
    }

    #[test]
    fn set_only_touches_declared_prefix() {
        let mut opts = SockImplOpts::default();
        let original_threshold = opts.zerocopy_threshold;
        let small_update = 9000u32.to_ne_bytes();
        opts.set(&small_update);
        assert_eq!(opts.recv_buf_size, 9000);
        assert_eq!(opts.zerocopy_threshold, original_threshold);
    }

    #[test]
    fn roundtrip_is_lossless_at_full_length() {
        let mut opts = SockImplOpts::default();
        opts.zerocopy_threshold = 1234;
        let mut buf = [0u8; size_of::<SockImplOpts>()];
        opts.get(&mut buf);
        let mut restored = SockImplOpts::default();
        restored.set(&buf);
        assert_eq!(restored, opts);
    }
}
