//! Single-slot parking for the one outstanding operation a queue allows

use crate::error::KcpCoreError;
use std::mem;
use std::task::Waker;

/// Identifies one logical receive or send call across its polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

/// Hands out fresh [`OperationId`]s.
#[derive(Debug, Default)]
pub(crate) struct OperationIds {
    next: u64,
}

impl OperationIds {
    pub fn next(&mut self) -> OperationId {
        self.next = self.next.wrapping_add(1);
        OperationId(self.next)
    }
}

/// Reusable completion slot. Guarded by the conversation lock, never
/// reallocated between operations.
#[derive(Debug)]
pub(crate) enum OperationSlot<T> {
    Idle,
    Pending { op: OperationId, waker: Waker },
    Completed { op: OperationId, result: T },
}

impl<T> OperationSlot<T> {
    /// Check that `op` may proceed. Hands back a result stored for `op` by
    /// the producer side, rejects any other operation holding the slot.
    pub fn claim(&mut self, op: OperationId) -> Result<Option<T>, KcpCoreError> {
        match self {
            OperationSlot::Idle => Ok(None),
            OperationSlot::Pending { op: owner, .. } if *owner == op => Ok(None),
            OperationSlot::Completed { op: owner, .. } if *owner == op => {
                match mem::replace(self, OperationSlot::Idle) {
                    OperationSlot::Completed { result, .. } => Ok(Some(result)),
                    _ => Ok(None),
                }
            }
            _ => Err(KcpCoreError::ConcurrentOperation),
        }
    }

    /// Park `op` until the producer wakes it.
    pub fn park(&mut self, op: OperationId, waker: &Waker) {
        match self {
            OperationSlot::Pending { op: owner, waker: current } if *owner == op => {
                if !current.will_wake(waker) {
                    current.clone_from(waker);
                }
            }
            _ => {
                *self = OperationSlot::Pending {
                    op,
                    waker: waker.clone(),
                }
            }
        }
    }

    /// Free the slot if `op` holds it.
    pub fn release(&mut self, op: OperationId) {
        let owned = match self {
            OperationSlot::Pending { op: owner, .. } | OperationSlot::Completed { op: owner, .. } => {
                *owner == op
            }
            OperationSlot::Idle => false,
        };
        if owned {
            *self = OperationSlot::Idle;
        }
    }

    /// Wake the parked operation without deciding its result.
    pub fn wake(&self) {
        if let OperationSlot::Pending { waker, .. } = self {
            waker.wake_by_ref();
        }
    }

    /// Store `result` for the parked operation and wake it.
    pub fn complete(&mut self, result: T) {
        if let OperationSlot::Pending { op, .. } = self {
            let op = *op;
            if let OperationSlot::Pending { waker, .. } =
                mem::replace(self, OperationSlot::Completed { op, result })
            {
                waker.wake();
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, OperationSlot::Idle)
    }
}
