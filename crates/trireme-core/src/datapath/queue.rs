//! User-space packet queue abstraction.
//!
//! The kernel binding that feeds intercepted packets to the datapath is
//! a collaborator; the datapath only needs a blocking receive and a way
//! to return a verdict with an optionally rewritten payload. An
//! in-memory implementation backs tests and the loopback wiring of the
//! daemon.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::conntrack::Direction;

/// Errors produced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed; workers should drain and exit.
    #[error("packet queue closed")]
    Closed,

    /// A transient read or verdict failure; logged and retried.
    #[error("transient queue error: {reason}")]
    Transient {
        /// What failed.
        reason: String,
    },
}

/// A packet delivered from the kernel queue.
#[derive(Debug)]
pub struct QueuedPacket {
    /// Kernel-assigned packet id, echoed in the verdict.
    pub id: u64,
    /// Queue number the packet arrived on.
    pub queue: u16,
    /// Side of the PU the capturing rule belongs to.
    pub direction: Direction,
    /// Raw IPv4 packet bytes.
    pub payload: Vec<u8>,
}

/// Datapath decision for one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictAction {
    /// Re-inject the packet.
    Accept,
    /// Drop the packet.
    Drop {
        /// Ask the queue binding to answer with a TCP RST.
        rst: bool,
    },
}

/// Verdict returned to the kernel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Accept or drop.
    pub action: VerdictAction,
    /// Rewritten packet bytes, when the datapath mutated the segment.
    pub payload: Option<Vec<u8>>,
}

impl Verdict {
    /// Accept without modification.
    #[must_use]
    pub const fn accept() -> Self {
        Self {
            action: VerdictAction::Accept,
            payload: None,
        }
    }

    /// Accept with a rewritten payload.
    #[must_use]
    pub const fn accept_rewritten(payload: Vec<u8>) -> Self {
        Self {
            action: VerdictAction::Accept,
            payload: Some(payload),
        }
    }

    /// Drop silently.
    #[must_use]
    pub const fn drop_silent() -> Self {
        Self {
            action: VerdictAction::Drop { rst: false },
            payload: None,
        }
    }

    /// Drop and reset the connection.
    #[must_use]
    pub const fn drop_with_rst() -> Self {
        Self {
            action: VerdictAction::Drop { rst: true },
            payload: None,
        }
    }

    /// Returns `true` if the verdict accepts the packet.
    #[must_use]
    pub fn accepted(&self) -> bool {
        matches!(self.action, VerdictAction::Accept)
    }
}

/// Blocking source of intercepted packets.
pub trait PacketQueue: Send + Sync {
    /// Blocks until the next packet or queue closure.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] once the queue shuts down and
    /// [`QueueError::Transient`] for retryable failures.
    fn recv(&self) -> Result<QueuedPacket, QueueError>;

    /// Returns the verdict for a previously received packet.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Transient`] if the verdict could not be
    /// delivered.
    fn put_verdict(&self, id: u64, verdict: Verdict) -> Result<(), QueueError>;
}

/// In-memory queue used by tests and loopback deployments.
pub struct InMemoryQueue {
    rx: Mutex<Receiver<QueuedPacket>>,
    verdicts: Arc<Mutex<HashMap<u64, Verdict>>>,
}

/// Producer half of an [`InMemoryQueue`].
#[derive(Clone)]
pub struct InMemoryQueueHandle {
    tx: Sender<QueuedPacket>,
    verdicts: Arc<Mutex<HashMap<u64, Verdict>>>,
}

impl InMemoryQueue {
    /// Creates a queue and its producer handle.
    #[must_use]
    pub fn channel() -> (Self, InMemoryQueueHandle) {
        let (tx, rx) = std::sync::mpsc::channel();
        let verdicts = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                rx: Mutex::new(rx),
                verdicts: Arc::clone(&verdicts),
            },
            InMemoryQueueHandle { tx, verdicts },
        )
    }
}

impl PacketQueue for InMemoryQueue {
    fn recv(&self) -> Result<QueuedPacket, QueueError> {
        self.rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .recv()
            .map_err(|_| QueueError::Closed)
    }

    fn put_verdict(&self, id: u64, verdict: Verdict) -> Result<(), QueueError> {
        self.verdicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id, verdict);
        Ok(())
    }
}

impl InMemoryQueueHandle {
    /// Enqueues a packet for the datapath.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the consumer is gone.
    pub fn push(&self, packet: QueuedPacket) -> Result<(), QueueError> {
        self.tx.send(packet).map_err(|_| QueueError::Closed)
    }

    /// Takes the verdict recorded for packet `id`, if any.
    #[must_use]
    pub fn take_verdict(&self, id: u64) -> Option<Verdict> {
        self.verdicts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_queue_round_trip() {
        let (queue, handle) = InMemoryQueue::channel();

        handle
            .push(QueuedPacket {
                id: 7,
                queue: 0,
                direction: Direction::App,
                payload: vec![1, 2, 3],
            })
            .unwrap();

        let packet = queue.recv().unwrap();
        assert_eq!(packet.id, 7);

        queue.put_verdict(7, Verdict::accept()).unwrap();
        assert!(handle.take_verdict(7).unwrap().accepted());
    }

    #[test]
    fn test_closed_queue_reports_closed() {
        let (queue, handle) = InMemoryQueue::channel();
        drop(handle);

        assert!(matches!(queue.recv(), Err(QueueError::Closed)));
    }
}
