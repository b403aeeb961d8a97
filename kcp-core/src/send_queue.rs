//! Bounded queue of outbound fragments awaiting a send-window slot

use crate::error::{KcpCoreError, KcpCoreResult};
use crate::lease::{BufferLease, BufferPool};
use crate::node_queue::NodeQueue;
use crate::slot::{OperationId, OperationIds, OperationSlot};
use std::sync::Arc;
use std::task::{Poll, Waker};

/// One outbound fragment: payload plus the count of fragments following it.
#[derive(Debug)]
pub(crate) struct QueuedFragment {
    pub data: BufferLease,
    pub fragment: u8,
}

/// Producer-facing half of the engine.
///
/// Capacity covers both queued fragments and segments the engine still has
/// in flight, so a writer parks until acknowledgements free space. Only one
/// write may be outstanding.
#[derive(Debug)]
pub struct SendQueue {
    items: NodeQueue<QueuedFragment>,
    stream: bool,
    mss: usize,
    capacity: usize,
    message_limit: usize,
    closed: Option<KcpCoreError>,
    slot: OperationSlot<KcpCoreResult<()>>,
    ids: OperationIds,
    pool: Arc<dyn BufferPool>,
}

impl SendQueue {
    pub fn new(
        stream: bool,
        mss: usize,
        capacity: usize,
        message_limit: usize,
        pool: Arc<dyn BufferPool>,
    ) -> Self {
        Self {
            items: NodeQueue::new(),
            stream,
            mss: mss.max(1),
            capacity,
            message_limit,
            closed: None,
            slot: OperationSlot::Idle,
            ids: OperationIds::default(),
            pool,
        }
    }

    /// Allocate an id for a new send call.
    pub fn new_operation(&mut self) -> OperationId {
        self.ids.next()
    }

    /// Fragments waiting for the send window
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drive a send for `op`.
    ///
    /// `written` carries progress across polls: datagrams are accepted all
    /// at once, stream writes may advance partially before parking.
    /// `in_flight` is the number of unacknowledged segments the engine holds.
    pub fn poll_send(
        &mut self,
        waker: Option<&Waker>,
        op: OperationId,
        data: &[u8],
        written: &mut usize,
        in_flight: usize,
    ) -> Poll<KcpCoreResult<()>> {
        if let Some(reason) = &self.closed {
            self.slot.release(op);
            return Poll::Ready(Err(reason.clone()));
        }
        match self.slot.claim(op) {
            Err(e) => return Poll::Ready(Err(e)),
            Ok(Some(result)) => return Poll::Ready(result),
            Ok(None) => {}
        }

        if !self.stream && data.len() > self.message_limit {
            self.slot.release(op);
            return Poll::Ready(Err(KcpCoreError::MessageTooLarge {
                size: data.len(),
                limit: self.message_limit,
            }));
        }

        let free = self
            .capacity
            .saturating_sub(self.items.len() + in_flight);
        let done = if self.stream {
            self.push_stream(data, written, free);
            *written == data.len()
        } else {
            self.push_datagram(data, written, free)
        };

        if done {
            self.slot.release(op);
            return Poll::Ready(Ok(()));
        }
        match waker {
            Some(waker) => self.slot.park(op, waker),
            None => self.slot.release(op),
        }
        Poll::Pending
    }

    /// Forget `op`, typically because its future was dropped. Stream bytes
    /// already accepted stay queued.
    pub fn abandon(&mut self, op: OperationId) {
        self.slot.release(op);
    }

    pub(crate) fn pop_front(&mut self) -> Option<QueuedFragment> {
        self.items.pop_front()
    }

    /// Acknowledgements freed capacity; let a parked writer retry.
    pub fn notify_space(&self) {
        self.slot.wake();
    }

    /// Refuse further writes with `reason` and drop queued fragments.
    pub fn close(&mut self, reason: KcpCoreError) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason);
        self.items.clear();
        self.slot.wake();
    }

    /// Release all fragments; every later write fails with `Disposed`.
    pub fn dispose(&mut self) {
        self.closed = Some(KcpCoreError::Disposed);
        self.items.clear_and_shrink();
        self.slot.wake();
    }

    fn push_datagram(&mut self, data: &[u8], written: &mut usize, free: usize) -> bool {
        if data.is_empty() {
            return true;
        }
        let count = data.len().div_ceil(self.mss);
        if count > free {
            return false;
        }
        for (i, chunk) in data.chunks(self.mss).enumerate() {
            self.items.push_back(QueuedFragment {
                data: BufferLease::copy_from_slice(&self.pool, chunk),
                fragment: (count - 1 - i) as u8,
            });
        }
        *written = data.len();
        true
    }

    fn push_stream(&mut self, data: &[u8], written: &mut usize, mut free: usize) {
        let mut rest = &data[*written..];

        if let Some(last) = self.items.back_mut() {
            let room = self.mss.saturating_sub(last.data.written());
            let n = room.min(rest.len());
            if n > 0 {
                last.data.extend_from_slice(&rest[..n]);
                rest = &rest[n..];
                *written += n;
            }
        }

        while !rest.is_empty() && free > 0 {
            let n = self.mss.min(rest.len());
            let mut lease = BufferLease::new(&self.pool, self.mss);
            lease.extend_from_slice(&rest[..n]);
            self.items.push_back(QueuedFragment {
                data: lease,
                fragment: 0,
            });
            rest = &rest[n..];
            *written += n;
            free -= 1;
        }
    }
}
