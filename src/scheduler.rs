//! Worker selection.
//!
//! The pick itself is a pure function over the slot table; the asynchronous
//! "call me when a worker is free" contract is an [`Assignment`] future
//! backed by a FIFO waiter queue the pool services whenever a slot may have
//! become eligible. Dropping an [`Assignment`] cancels the request, in both
//! orderings: a waiter that is already gone when the pool grants makes the
//! grant fail and roll back on the sender side, and a grant that lands just
//! before the requester goes away is drained and released by the
//! [`Assignment`]'s own drop. Either way no slot stays assigned to a caller
//! that will never proxy.

use crate::pool::Pool;
use crate::slot::WorkerSlot;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// A granted worker assignment. The generation ties the lease to the child
/// that was alive at assignment time, so a release racing a respawn cannot
/// touch the fresh child's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub slot_id: usize,
    pub(crate) generation: u64,
}

/// A queued dispatcher request for a worker.
pub type Waiter = oneshot::Sender<Lease>;

/// Choose the slot for the next request: among eligible slots, minimum
/// `in_flight`, ties broken by lowest slot id.
pub fn pick(slots: &[WorkerSlot], concurrent: bool) -> Option<usize> {
    slots
        .iter()
        .filter(|s| s.eligible(concurrent))
        .min_by_key(|s| (s.in_flight, s.id))
        .map(|s| s.id)
}

/// A pending worker assignment. Resolves to `Some(lease)` exactly once, or
/// `None` if the pool shut down before a worker became available.
#[derive(Debug)]
pub struct Assignment {
    rx: oneshot::Receiver<Lease>,
    pool: Weak<Pool>,
    resolved: bool,
}

impl Assignment {
    pub(crate) fn new(rx: oneshot::Receiver<Lease>, pool: Weak<Pool>) -> Self {
        Self {
            rx,
            pool,
            resolved: false,
        }
    }
}

impl Future for Assignment {
    type Output = Option<Lease>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(res) => {
                this.resolved = true;
                Poll::Ready(res.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // A grant can race the requester going away: `Sender::send` only
        // fails when the receiver is gone before the send, so a lease may
        // already be sitting in the channel, its slot marked busy. Drain it
        // and hand it back, or the slot would stay assigned forever.
        if let Ok(lease) = self.rx.try_recv() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(lease, false);
            }
        }
    }
}
