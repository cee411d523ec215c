//! Queued send requests (spec.md §4.4).
//!
//! A [`SendRequest`] starts out queued with a byte offset of zero. As the
//! batcher consumes it, `offset` tracks how many bytes of its iovs have
//! actually gone out on the wire. Once the whole request has been
//! consumed it moves to the pending-completion queue; at that point
//! `offset` stops meaning "bytes consumed" and `send_seq` instead records
//! which `sendmsg` call it went out on, if it needs to wait for a
//! zero-copy completion notification.
//!
//! (The original C structure reuses one field for both meanings, keyed
//! off the request's position in the queue; this splits them into two
//! named fields rather than playing that trick on `offset` — an explicit
//! deviation noted in the grounding ledger.)
//!
//! The spec calls this type "owned by the framework, interface only"
//! (spec.md §3): this core never decides what a completed or aborted
//! request *means* to the caller, it only ever needs to tell the caller
//! that one of those two things happened. [`SendRequest::on_complete`]
//! is that seam — the framework attaches a closure when it builds the
//! request, and this core calls it exactly once, matching the one call
//! to `spdk_sock_request_put`/`spdk_sock_abort_requests` the original
//! makes per request.

use std::io;

/// One pending `writev`/`writev_async` call.
pub struct SendRequest {
    pub iovs: Vec<libc::iovec>,
    /// Per-iov memory keys, if the caller registered memory for
    /// zero-copy send with mkeys (spec.md §4.4, §6).
    pub mkeys: Option<Vec<u32>>,
    pub has_memory_domain_data: bool,
    /// Bytes already consumed from the front of `iovs` while this
    /// request was still in the queued state.
    offset: usize,
    /// Set once the request has been fully handed to `sendmsg`.
    pub is_zcopy: bool,
    /// The `sendmsg` sequence number this request's completion waits on,
    /// once pending. `None` for a request that completed synchronously
    /// (non zero-copy, sent while at the head of the pending queue) or
    /// that hasn't been sent yet.
    pub send_seq: Option<u32>,
    /// Invoked exactly once: with `Ok(n)` on successful completion (`n`
    /// is always the full request length — partial sends stay queued)
    /// or `Err` when the socket aborts outstanding requests (spec.md
    /// §4.7, "Remove-socket").
    on_complete: Option<Box<dyn FnOnce(io::Result<usize>)>>,
}

impl SendRequest {
    pub fn new(
        iovs: Vec<libc::iovec>,
        mkeys: Option<Vec<u32>>,
        has_memory_domain_data: bool,
        on_complete: Box<dyn FnOnce(io::Result<usize>)>,
    ) -> SendRequest {
        SendRequest {
            iovs,
            mkeys,
            has_memory_domain_data,
            offset: 0,
            is_zcopy: false,
            send_seq: None,
            on_complete: Some(on_complete),
        }
    }

    /// Total requested length, for the `Ok` arm of the completion
    /// callback.
    pub fn total_len(&self) -> usize {
        self.iovs.iter().map(|iov| iov.iov_len).sum()
    }

    /// Fire the completion callback. A no-op if called twice (defensive;
    /// production code paths only ever call this once per request).
    pub fn complete(mut self, result: io::Result<usize>) {
        if let Some(cb) = self.on_complete.take() {
            cb(result);
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Total bytes still unconsumed across every iov.
    pub fn remaining(&self) -> usize {
        let mut skip = self.offset;
        let mut total = 0usize;
        for iov in &self.iovs {
            if skip >= iov.iov_len {
                skip -= iov.iov_len;
            } else {
                total += iov.iov_len - skip;
                skip = 0;
            }
        }
        total
    }

    pub fn is_fully_consumed(&self) -> bool {
        self.remaining() == 0
    }

    /// Advance the consumed-offset by `n` bytes. Must not exceed
    /// [`SendRequest::remaining`].
    pub fn consume(&mut self, n: usize) {
        self.offset += n;
    }
}

impl Drop for SendRequest {
    /// A request dropped without going through [`SendRequest::complete`]
    /// is a bug in this core (every code path that removes a request
    /// from a queue must also complete it) rather than a normal outcome,
    /// but failing the callback rather than panicking keeps a latent bug
    /// here from taking the whole event loop down with it.
    fn drop(&mut self) {
        if let Some(cb) = self.on_complete.take() {
            cb(Err(io::Error::new(
                io::ErrorKind::Other,
                "send request dropped without completion",
            )));
        }
    }
}
