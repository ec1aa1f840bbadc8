//! Bounded FIFO admission gate for outbound editor requests.
//!
//! Producers are the concurrent tool calls; the single consumer is the
//! dispatcher feeding the active connection. A full queue rejects immediately
//! instead of making the caller wait, which bounds memory while the editor is
//! away.

use crate::error::{BridgeError, Result};
use tokio::sync::mpsc;
use tracing::warn;

/// Why an item could not be admitted. The item is handed back.
#[derive(Debug)]
pub enum AdmissionError<T> {
    /// Queue is at capacity.
    Full { item: T, capacity: usize },
    /// The consumer is gone (bridge shut down).
    Closed { item: T },
}

impl<T> AdmissionError<T> {
    pub fn into_item(self) -> T {
        match self {
            AdmissionError::Full { item, .. } | AdmissionError::Closed { item } => item,
        }
    }
}

/// Create a queue with fixed `capacity`.
///
/// A capacity of 0 is a configuration error.
pub fn admission_queue<T>(capacity: usize) -> Result<(AdmissionSender<T>, AdmissionReceiver<T>)> {
    if capacity == 0 {
        return Err(BridgeError::config(
            "queue_capacity",
            "must be greater than 0",
        ));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((AdmissionSender { tx, capacity }, AdmissionReceiver { rx }))
}

/// Producer half. Cheap to clone.
#[derive(Debug)]
pub struct AdmissionSender<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
}

impl<T> Clone for AdmissionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> AdmissionSender<T> {
    /// Admit `item` or fail immediately.
    pub fn try_enqueue(&self, item: T) -> std::result::Result<(), AdmissionError<T>> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => {
                warn!(
                    "Admission queue full ({} pending), rejecting request",
                    self.capacity
                );
                Err(AdmissionError::Full {
                    item,
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(item)) => Err(AdmissionError::Closed { item }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently waiting for the consumer.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. There is exactly one.
#[derive(Debug)]
pub struct AdmissionReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> AdmissionReceiver<T> {
    /// Next item in enqueue order, or `None` once every sender is gone.
    pub async fn dequeue(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stop admitting; already queued items can still be dequeued.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
