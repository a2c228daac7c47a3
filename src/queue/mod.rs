use std::fmt;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

#[derive(Debug, PartialEq, Eq)]
pub enum QueueError {
    Full { capacity: usize },
    Disconnected,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full { capacity } => {
                write!(f, "work queue is at capacity ({capacity} entries)")
            }
            Self::Disconnected => write!(f, "work queue consumer has gone away"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Bounded in-memory work queue between the ingestion handler and the
/// consumer thread. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct WorkQueue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    capacity: usize,
}

impl WorkQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub fn try_push(&self, payload: String) -> Result<(), QueueError> {
        self.sender.try_send(payload).map_err(|error| match error {
            TrySendError::Full(_) => QueueError::Full {
                capacity: self.capacity,
            },
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    pub fn try_pop(&self) -> Option<String> {
        match self.receiver.try_recv() {
            Ok(payload) => Some(payload),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
