//! A zero-copy TCP socket provider on top of a kernel-bypass user-space
//! stack (the vendor library named by `SOCK_XLIO_PATH`), pluggable as a
//! network implementation alongside the standard POSIX and io_uring ones
//! (spec.md §1).
//!
//! The crate is organized bottom-up, the way the subsystems depend on
//! each other:
//!
//! - [`pool`] — fixed-capacity free lists every socket's packet and
//!   buffer pools are built from.
//! - [`packet`] — refcounted packet wrappers built on top of a pool.
//! - [`cursor`] — the receive-side read cursor over a socket's packet
//!   queue.
//! - [`request`] / [`batcher`] — queued send requests and the transmit
//!   batching/zero-copy-threshold pipeline.
//! - [`reaper`] — the zero-copy completion reaper, matching error-queue
//!   notifications back to pending sends.
//! - [`stack`] — the vendor function table binding, expressed as the
//!   [`stack::Stack`] trait.
//! - [`socket`] — socket lifecycle: create/accept/close, option
//!   negotiation, loopback/zero-copy decisions.
//! - [`group`] — the event-group poller that multiplexes many sockets.
//! - [`options`] — provider-wide configuration (`SockImplOpts`).
//!
//! Logging follows mio's convention: every notable event is one `log`
//! call site, gated behind this crate's own `log` feature (see
//! [`features`]).

#[macro_use]
mod macros;

pub mod batcher;
pub mod cursor;
pub mod group;
pub mod options;
pub mod packet;
pub mod pool;
pub mod reaper;
pub mod request;
pub mod socket;
pub mod stack;

mod registration;

pub use group::SocketGroup;
pub use options::SockImplOpts;
pub use socket::{Socket, SocketCaps, SocketOpts};
pub use stack::{ProtectionDomain, Stack, VendorStack};

/// Documents the crate's cargo features; not meant to be used directly.
///
/// - **`log`** (default on): enables `log` crate integration. Without
///   it, diagnostics that would otherwise be a `trace!`/`debug!`/
///   `warn!`/`error!` call are simply compiled out, exactly as in mio.
pub mod features {}
