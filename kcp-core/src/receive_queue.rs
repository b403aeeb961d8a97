//! Ordered delivery of reassembled payloads to a single reader

use crate::error::{KcpCoreError, KcpCoreResult};
use crate::lease::BufferLease;
use crate::node_queue::NodeQueue;
use crate::slot::{OperationId, OperationIds, OperationSlot};
use std::task::{Poll, Waker};
use tracing::trace;

/// What a receive call wants from the queue.
#[derive(Debug)]
pub enum ReceiveTarget<'a> {
    /// Report the size of the next message without consuming it
    Peek,
    /// Copy the next message (datagram mode) or as many bytes as fit
    /// (stream mode) into the buffer
    Buffer(&'a mut [u8]),
}

#[derive(Debug)]
struct Fragment {
    data: BufferLease,
    /// Fragments remaining after this one; 0 ends a message
    remaining: u8,
}

/// Consumer-facing half of the engine.
///
/// Holds in-order fragments until the application reads them. At most one
/// receive is outstanding at a time; a second one fails with
/// [`KcpCoreError::ConcurrentOperation`].
#[derive(Debug)]
pub struct ReceiveQueue {
    items: NodeQueue<Fragment>,
    stream: bool,
    /// Complete messages (datagram mode) or non-empty nodes (stream mode)
    completed: usize,
    closed: bool,
    disposed: bool,
    slot: OperationSlot<KcpCoreResult<Option<usize>>>,
    ids: OperationIds,
}

impl ReceiveQueue {
    pub fn new(stream: bool) -> Self {
        Self {
            items: NodeQueue::new(),
            stream,
            completed: 0,
            closed: false,
            disposed: false,
            slot: OperationSlot::Idle,
            ids: OperationIds::default(),
        }
    }

    /// Allocate an id for a new receive call.
    pub fn new_operation(&mut self) -> OperationId {
        self.ids.next()
    }

    /// Number of queued fragments, counted against the receive window.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Size of the next complete message.
    ///
    /// `None` while a receive is outstanding, when nothing complete is
    /// queued, or after disposal. Stream mode reports every buffered byte.
    pub fn try_peek(&self) -> Option<usize> {
        if self.disposed || !self.slot.is_idle() || self.completed == 0 {
            return None;
        }
        self.next_message_size()
    }

    /// Drive a receive for `op`.
    ///
    /// `Ready(Ok(None))` means the transport closed and the queue is
    /// drained. With no waker the call is a non-blocking attempt that never
    /// parks.
    pub fn poll_receive(
        &mut self,
        waker: Option<&Waker>,
        op: OperationId,
        target: ReceiveTarget<'_>,
    ) -> Poll<KcpCoreResult<Option<usize>>> {
        let claimed = self.slot.claim(op);
        if self.disposed {
            self.slot.release(op);
            return Poll::Ready(match claimed {
                Ok(Some(result)) => result,
                _ => Err(KcpCoreError::Disposed),
            });
        }
        match claimed {
            Err(e) => return Poll::Ready(Err(e)),
            Ok(Some(result)) => return Poll::Ready(result),
            Ok(None) => {}
        }

        if let ReceiveTarget::Buffer(buf) = &target {
            if buf.is_empty() {
                self.slot.release(op);
                return Poll::Ready(Ok(Some(0)));
            }
        }

        if self.completed > 0 {
            if let Some(size) = self.next_message_size() {
                self.slot.release(op);
                return Poll::Ready(self.consume(size, target));
            }
        }

        if self.closed {
            self.slot.release(op);
            return Poll::Ready(Ok(None));
        }

        match waker {
            Some(waker) => self.slot.park(op, waker),
            None => self.slot.release(op),
        }
        Poll::Pending
    }

    /// Forget `op`, typically because its future was dropped.
    pub fn abandon(&mut self, op: OperationId) {
        self.slot.release(op);
    }

    /// Append an in-order fragment.
    ///
    /// A fragment that does not continue the current run is forced to close
    /// it, so only the tail of the queue can ever hold an incomplete message.
    pub fn enqueue(&mut self, data: BufferLease, fragment: u8) {
        if self.closed || self.disposed {
            return;
        }

        let remaining = if self.stream {
            if data.is_empty() {
                return;
            }
            0
        } else {
            match self.items.back() {
                Some(last) if last.remaining != 0 && last.remaining - 1 != fragment => {
                    trace!(
                        expected = last.remaining - 1,
                        got = fragment,
                        "fragment run broken, terminating message"
                    );
                    0
                }
                _ => fragment,
            }
        };

        self.items.push_back(Fragment { data, remaining });
        if remaining == 0 {
            self.completed += 1;
            self.slot.wake();
        }
    }

    /// Mark the transport closed. Queued data stays readable; once drained
    /// reads return `Ok(None)`.
    pub fn set_transport_closed(&mut self) {
        if self.closed || self.disposed {
            return;
        }
        self.closed = true;
        self.slot.wake();
    }

    /// Close the queue because the connection failed. A parked reader gets
    /// `err`; later reads drain what is left and then see closure.
    pub fn fail(&mut self, err: KcpCoreError) {
        if self.closed || self.disposed {
            return;
        }
        self.closed = true;
        self.slot.complete(Err(err));
    }

    /// Release every queued lease and refuse further use.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.closed = true;
        self.completed = 0;
        self.items.clear_and_shrink();
        self.slot.complete(Ok(None));
    }

    fn next_message_size(&self) -> Option<usize> {
        if self.stream {
            return Some(self.items.iter().map(|f| f.data.len()).sum());
        }
        let mut size = 0;
        for fragment in self.items.iter() {
            size += fragment.data.len();
            if fragment.remaining == 0 {
                return Some(size);
            }
        }
        None
    }

    fn consume(&mut self, size: usize, target: ReceiveTarget<'_>) -> KcpCoreResult<Option<usize>> {
        let buf = match target {
            ReceiveTarget::Peek => return Ok(Some(size)),
            ReceiveTarget::Buffer(buf) => buf,
        };

        if self.stream {
            return Ok(Some(self.consume_stream(buf)));
        }

        if size > buf.len() {
            return Err(KcpCoreError::BufferTooSmall {
                required: size,
                available: buf.len(),
            });
        }

        let mut copied = 0;
        while let Some(fragment) = self.items.pop_front() {
            let chunk = fragment.data.data();
            buf[copied..copied + chunk.len()].copy_from_slice(chunk);
            copied += chunk.len();
            if fragment.remaining == 0 {
                break;
            }
        }
        self.completed -= 1;
        Ok(Some(copied))
    }

    fn consume_stream(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.items.front_mut() else {
                break;
            };
            let n = front.data.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&front.data.data()[..n]);
            front.data.advance(n);
            copied += n;
            if front.data.is_empty() {
                self.items.pop_front();
                self.completed -= 1;
            }
        }
        copied
    }
}
