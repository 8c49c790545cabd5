//! Bounded FIFO admission queue.
//!
//! The key idea is borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html): we hold a small,
//! bounded backlog of jobs waiting for a free worker, and once it fills we
//! reject new arrivals immediately rather than buffering without limit. This
//! queue is the only place admission control happens; workers themselves never
//! queue more than the single job they are executing.

use std::collections::VecDeque;

use tokio::{sync::oneshot, task::AbortHandle};

use crate::{error::PoolError, pool::OcrResult, prelude::*};

/// A job waiting for a free worker.
pub(crate) struct QueueEntry {
    /// Identity of this entry, used to remove it when its timer fires.
    pub seq: u64,

    /// Path of the staged PDF.
    pub pdf_path: PathBuf,

    /// Client-side request id, carried for log correlation only.
    pub request_id: String,

    /// Where to deliver the outcome.
    pub tx: oneshot::Sender<Result<OcrResult, PoolError>>,

    /// Expiry timer, aborted on dequeue.
    pub timer: Option<AbortHandle>,
}

/// Bounded FIFO of jobs awaiting dispatch.
pub(crate) struct AdmissionQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    next_seq: u64,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Append a job, returning its identity. The caller has already checked
    /// capacity; the timer is armed separately via [`Self::set_timer`].
    pub fn push_back(
        &mut self,
        pdf_path: PathBuf,
        request_id: String,
        tx: oneshot::Sender<Result<OcrResult, PoolError>>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(QueueEntry {
            seq,
            pdf_path,
            request_id,
            tx,
            timer: None,
        });
        seq
    }

    /// Return an entry to the head of the queue, preserving FIFO order for
    /// everything behind it.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
    }

    /// Take the oldest entry, cancelling its timer.
    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        let mut entry = self.entries.pop_front()?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some(entry)
    }

    /// Remove an entry by identity. Returns `None` when the entry was already
    /// dispatched, which makes a late-firing timer a no-op.
    pub fn remove(&mut self, seq: u64) -> Option<QueueEntry> {
        let idx = self.entries.iter().position(|entry| entry.seq == seq)?;
        self.entries.remove(idx)
    }

    /// Attach the expiry timer to an entry, if it is still queued.
    pub fn set_timer(&mut self, seq: u64, timer: AbortHandle) {
        match self.entries.iter_mut().find(|entry| entry.seq == seq) {
            Some(entry) => entry.timer = Some(timer),
            // Dispatched (or expired) before the timer was registered; stop
            // the timer instead of letting it fire against a ghost entry.
            None => timer.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(queue: &mut AdmissionQueue, request_id: &str) -> u64 {
        let (tx, _rx) = oneshot::channel();
        queue.push_back(PathBuf::from("/tmp/input.pdf"), request_id.to_owned(), tx)
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut queue = AdmissionQueue::new(8);
        push(&mut queue, "a");
        push(&mut queue, "b");
        push(&mut queue, "c");

        assert_eq!(queue.pop_front().unwrap().request_id, "a");
        assert_eq!(queue.pop_front().unwrap().request_id, "b");
        assert_eq!(queue.pop_front().unwrap().request_id, "c");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn reports_full_at_capacity() {
        let mut queue = AdmissionQueue::new(2);
        assert!(!queue.is_full());
        push(&mut queue, "a");
        push(&mut queue, "b");
        assert!(queue.is_full());
        queue.pop_front().unwrap();
        assert!(!queue.is_full());
    }

    #[test]
    fn removes_by_identity_only_once() {
        let mut queue = AdmissionQueue::new(8);
        let a = push(&mut queue, "a");
        let b = push(&mut queue, "b");

        assert_eq!(queue.remove(a).unwrap().request_id, "a");
        assert!(queue.remove(a).is_none());
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.remove(b).unwrap().request_id, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn push_front_restores_head_position() {
        let mut queue = AdmissionQueue::new(8);
        push(&mut queue, "a");
        push(&mut queue, "b");

        let head = queue.pop_front().unwrap();
        queue.push_front(head);
        assert_eq!(queue.pop_front().unwrap().request_id, "a");
        assert_eq!(queue.pop_front().unwrap().request_id, "b");
    }
}
