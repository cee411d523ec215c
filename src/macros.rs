//! Small helper macros shared across the crate.

/// Execute a libc call that signals failure with `-1`, turning it into an
/// `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// True if `err` is one of the "try again" conditions the spec treats as
/// zero progress rather than a hard failure.
macro_rules! is_again {
    ($err: expr) => {
        matches!(
            $err.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
        )
    };
}

// Thin, crate-wide wrappers around the `log` crate's macros, no-ops
// unless the `log` cargo feature is enabled — mio's own convention for
// gating its (also optional, default-on) `log` dependency. One call site
// per notable event, matching the density of the original's
// `SPDK_DEBUGLOG`/`SPDK_NOTICELOG`/`SPDK_WARNLOG`/`SPDK_ERRLOG` macros.
macro_rules! trace_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
    };
}

macro_rules! debug_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
    };
}

macro_rules! warn_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
    };
}

macro_rules! error_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($arg)*);
    };
}
