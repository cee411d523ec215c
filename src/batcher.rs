//! Zero-copy transmit batching pipeline (spec.md §4.4).
//!
//! [`TransmitBatcher`] owns a socket's queued and pending-completion send
//! requests. [`TransmitBatcher::flush`] drains as much of the queue as
//! fits in one `sendmsg` batch — stopping at the first request whose
//! memory-key presence disagrees with the batch so far — decides whether
//! the batch goes out zero-copy, and re-files each fully-sent request as
//! either synchronously complete or pending a zero-copy notification.

use std::collections::VecDeque;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;

use crate::stack::ffi::PdKey;
use crate::request::SendRequest;

/// Matches the original's batch cap on iovecs (and, by extension,
/// memory-key cmsg slots) per `sendmsg` call.
pub const IOV_BATCH_SIZE: usize = 64;

/// A prepared batch: iovecs plus, if this socket has zero-copy send with
/// memory keys enabled and the head of the queue carries them, the
/// matching per-iov key array.
struct PreparedBatch {
    iovs: Vec<libc::iovec>,
    mkeys: Option<Vec<PdKey>>,
    total_bytes: u32,
    has_memory_domain_data: bool,
    /// How many requests (fully or partially) this batch touches.
    requests_touched: usize,
}

/// Transmit-side state for one socket.
pub struct TransmitBatcher {
    queued: VecDeque<SendRequest>,
    pending: VecDeque<SendRequest>,
    queued_iov_count: usize,
    next_send_seq: u32,
}

impl TransmitBatcher {
    pub fn new() -> TransmitBatcher {
        TransmitBatcher {
            queued: VecDeque::new(),
            pending: VecDeque::new(),
            queued_iov_count: 0,
            next_send_seq: 0,
        }
    }

    pub fn queued_iov_count(&self) -> usize {
        self.queued_iov_count
    }

    pub fn queued_is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `writev_async`: enqueue, then flush immediately if that grows the
    /// queue past one full batch (spec.md §4.4).
    pub fn queue(&mut self, req: SendRequest) {
        self.queued_iov_count += req.iovs.len();
        self.queued.push_back(req);
    }

    pub fn should_flush_after_queue(&self) -> bool {
        self.queued_iov_count >= IOV_BATCH_SIZE
    }

    /// Build one `sendmsg`-sized batch from the front of the queue,
    /// stopping at `IOV_BATCH_SIZE` iovecs or at the first request whose
    /// memory-key presence disagrees with the first request in the batch
    /// (spec.md §4.4, "mixed-mkey batch-stop condition"). Returns `None`
    /// if the queue has nothing to send (already fully consumed offsets
    /// aside, this only happens when the queue itself is empty).
    fn prepare_batch(&self) -> Option<PreparedBatch> {
        let first_has_mkeys = self.queued.front()?.mkeys.is_some();

        let mut iovs = Vec::with_capacity(IOV_BATCH_SIZE);
        let mut mkeys: Option<Vec<PdKey>> = None;
        let mut total_bytes: u32 = 0;
        let mut has_memory_domain_data = false;
        let mut requests_touched = 0;

        'requests: for req in &self.queued {
            if req.mkeys.is_some() != first_has_mkeys {
                break;
            }

            let mut skip = req.offset();
            let mut touched_this_req = false;
            for (i, iov) in req.iovs.iter().enumerate() {
                if skip >= iov.iov_len {
                    skip -= iov.iov_len;
                    continue;
                }

                if let Some(per_iov) = &req.mkeys {
                    let keys = mkeys.get_or_insert_with(Vec::new);
                    keys.push(PdKey {
                        mkey: per_iov[i],
                        flags: 0,
                    });
                }

                iovs.push(libc::iovec {
                    iov_base: unsafe { (iov.iov_base as *mut u8).add(skip) as *mut _ },
                    iov_len: iov.iov_len - skip,
                });
                total_bytes += (iov.iov_len - skip) as u32;
                touched_this_req = true;
                skip = 0;

                if iovs.len() >= IOV_BATCH_SIZE {
                    if touched_this_req {
                        requests_touched += 1;
                    }
                    break 'requests;
                }
            }

            if touched_this_req {
                requests_touched += 1;
            }
            if !has_memory_domain_data {
                has_memory_domain_data = req.has_memory_domain_data;
            }
        }

        if iovs.is_empty() {
            return None;
        }

        Some(PreparedBatch {
            iovs,
            mkeys,
            total_bytes,
            has_memory_domain_data,
            requests_touched,
        })
    }

    /// Build the batch, send it, and reconcile request state. Mirrors
    /// `_sock_flush_ext`: skipped entirely while a completion callback is
    /// executing (the caller is expected to check `cb_depth == 0` before
    /// calling this, per spec.md §4.4) and a no-op if the queue is empty.
    pub fn flush(
        &mut self,
        sendmsg: impl FnOnce(&[libc::iovec], Option<&[PdKey]>, c_int) -> std::io::Result<usize>,
        zcopy_enabled: bool,
        zerocopy_threshold: u32,
    ) -> std::io::Result<()> {
        if self.queued.is_empty() {
            return Ok(());
        }

        let Some(batch) = self.prepare_batch() else {
            return Ok(());
        };

        let use_zerocopy = zcopy_enabled
            && (batch.mkeys.is_some() || batch.total_bytes >= zerocopy_threshold);
        let flags = if use_zerocopy { libc::MSG_ZEROCOPY } else { 0 };

        let rc = match sendmsg(&batch.iovs, batch.mkeys.as_deref(), flags) {
            Ok(n) => n,
            Err(e) => {
                if is_again!(e) || e.raw_os_error() == Some(libc::ENOBUFS) && zcopy_enabled {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let send_seq = if use_zerocopy {
            self.next_send_seq = self.next_send_seq.wrapping_add(1);
            if self.next_send_seq == 0 {
                // Never let the sequence number be zero: it doubles as
                // "not yet assigned" in the completion path.
                self.next_send_seq = 1;
            }
            Some(self.next_send_seq)
        } else {
            None
        };

        let _ = batch.has_memory_domain_data;
        let _ = batch.requests_touched;
        self.apply_send_result(rc, use_zerocopy, send_seq);
        Ok(())
    }

    /// Walk the front of the queue, consuming `sent_bytes`, and move
    /// every fully consumed request to the pending-completion queue.
    /// Non zero-copy requests landing at the head of an otherwise-empty
    /// pending queue complete immediately (the `sendmsg` call that moved
    /// them was synchronous); everything else waits for `send_seq` to be
    /// confirmed by the reaper.
    fn apply_send_result(&mut self, mut sent_bytes: usize, is_zcopy: bool, send_seq: Option<u32>) {
        while sent_bytes > 0 {
            let Some(req) = self.queued.front_mut() else {
                break;
            };
            req.is_zcopy = is_zcopy;

            let remaining = req.remaining();
            if remaining > sent_bytes {
                req.consume(sent_bytes);
                return;
            }

            sent_bytes -= remaining;
            let mut done = self.queued.pop_front().expect("front() just matched");
            self.queued_iov_count = self.queued_iov_count.saturating_sub(done.iovs.len());

            if !done.is_zcopy && self.pending.is_empty() {
                // The sendmsg syscall above isn't asynchronous for a
                // plain (non zero-copy) send, so this request is already
                // done — report it now rather than parking it.
                let len = done.total_len();
                done.complete(Ok(len));
                continue;
            }

            done.send_seq = send_seq;
            self.pending.push_back(done);
        }
    }

    /// Abort every queued and pending request for this socket, in order
    /// (spec.md §4.7, "Remove-socket"). Used when a send fails
    /// unrecoverably or the socket is removed from its group.
    pub fn abort_all(&mut self, err: impl Fn() -> std::io::Error) {
        self.queued_iov_count = 0;
        while let Some(req) = self.queued.pop_front() {
            req.complete(Err(err()));
        }
        while let Some(req) = self.pending.pop_front() {
            req.complete(Err(err()));
        }
    }

    /// Complete every pending request whose `send_seq` falls in
    /// `[lo, hi]` (inclusive), in FIFO order, stopping at the first
    /// non-match encountered after at least one match — the ordering
    /// guarantee documented in spec.md §4.5. Requests that were never
    /// zero-copy (no `send_seq`) complete unconditionally as they're
    /// encountered, since they were merely waiting their turn. Returns
    /// the number of requests completed, so the caller (the reaper) can
    /// decide whether this socket needs to join the pending-receive
    /// queue.
    pub fn complete_range(&mut self, lo: u32, hi: u32) -> usize {
        let mut completed = 0;
        loop {
            let Some(front) = self.pending.front() else {
                break;
            };
            let is_target = match front.send_seq {
                None => true,
                Some(seq) => seq >= lo && seq <= hi,
            };
            if !is_target {
                break;
            }
            let req = self.pending.pop_front().expect("front() just matched");
            let len = req.total_len();
            req.complete(Ok(len));
            completed += 1;
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SendRequest;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn req(len: usize) -> SendRequest {
        let buf = vec![0u8; len].leak();
        SendRequest::new(
            vec![libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut _,
                iov_len: buf.len(),
            }],
            None,
            false,
            Box::new(|_| {}),
        )
    }

    fn req_tracked(len: usize, results: Rc<RefCell<Vec<std::io::Result<usize>>>>) -> SendRequest {
        let buf = vec![0u8; len].leak();
        SendRequest::new(
            vec![libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut _,
                iov_len: buf.len(),
            }],
            None,
            false,
            Box::new(move |r| results.borrow_mut().push(r)),
        )
    }

    /// Scenario 1 (spec.md §8): under a 4096-byte zero-copy threshold, a
    /// 1000+2000-byte batch (3000 bytes total, below the threshold) goes
    /// out non zero-copy; a subsequent lone 5000-byte request goes out
    /// zero-copy by itself.
    #[test]
    fn threshold_decides_zero_copy_per_batch() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut batcher = TransmitBatcher::new();
        batcher.queue(req_tracked(1000, results.clone()));
        batcher.queue(req_tracked(2000, results.clone()));

        let mut used_zcopy = None;
        batcher
            .flush(
                |iovs, mkeys, flags| {
                    assert!(mkeys.is_none());
                    used_zcopy = Some(flags & libc::MSG_ZEROCOPY != 0);
                    Ok(iovs.iter().map(|i| i.iov_len).sum())
                },
                true,
                4096,
            )
            .unwrap();
        assert_eq!(used_zcopy, Some(false));
        assert_eq!(results.borrow().len(), 2);
        assert!(results.borrow().iter().all(|r| r.is_ok()));

        batcher.queue(req_tracked(5000, results.clone()));
        let mut used_zcopy = None;
        batcher
            .flush(
                |iovs, _, flags| {
                    used_zcopy = Some(flags & libc::MSG_ZEROCOPY != 0);
                    Ok(iovs.iter().map(|i| i.iov_len).sum())
                },
                true,
                4096,
            )
            .unwrap();
        assert_eq!(used_zcopy, Some(true));
    }

    #[test]
    fn flushing_empty_queue_twice_is_a_noop() {
        let mut batcher = TransmitBatcher::new();
        batcher.flush(|_, _, _| unreachable!(), true, 4096).unwrap();
        batcher.flush(|_, _, _| unreachable!(), true, 4096).unwrap();
    }

    #[test]
    fn again_is_a_noop_not_an_error() {
        let mut batcher = TransmitBatcher::new();
        batcher.queue(req(10));
        batcher
            .flush(
                |_, _, _| Err(std::io::Error::from_raw_os_error(libc::EAGAIN)),
                true,
                4096,
            )
            .unwrap();
        assert!(!batcher.queued_is_empty());
    }

    /// Scenario 4 (spec.md §8): two zero-copy sends sequenced M, M+1; the
    /// error queue announces the whole range in one shot, and both
    /// complete in submission order.
    #[test]
    fn completion_range_fires_callbacks_in_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut batcher = TransmitBatcher::new();
        for tag in [1usize, 2] {
            let order = order.clone();
            let buf = vec![0u8; 4].leak();
            batcher.queue(SendRequest::new(
                vec![libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut _,
                    iov_len: buf.len(),
                }],
                Some(vec![42]),
                false,
                Box::new(move |_| order.borrow_mut().push(tag)),
            ));
        }
        batcher
            .flush(
                |iovs, _, _| Ok(iovs.iter().map(|i| i.iov_len).sum()),
                true,
                4096,
            )
            .unwrap();
        assert_eq!(batcher.pending_len(), 2);

        let completed = batcher.complete_range(1, 2);
        assert_eq!(completed, 2);
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn abort_all_fails_every_outstanding_request() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let mut batcher = TransmitBatcher::new();
        batcher.queue(req_tracked(10, results.clone()));
        batcher.abort_all(|| std::io::Error::new(std::io::ErrorKind::Other, "removed"));
        assert_eq!(results.borrow().len(), 1);
        assert!(results.borrow()[0].is_err());
    }
}
