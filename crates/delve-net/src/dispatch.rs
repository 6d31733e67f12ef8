//! Hand-off from I/O tasks to the single consumer context.
//!
//! Any number of [`DispatchSender`] clones may enqueue from any thread.
//! There is exactly one [`DispatchReceiver`]; it is not `Clone`, and every
//! drain takes `&mut self`, so two drains can never run at once. Items come
//! out in the order they went in.

use tokio::sync::mpsc;

/// Create a connected sender/receiver pair.
pub fn dispatch_queue<T>() -> (DispatchSender<T>, DispatchReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DispatchSender { tx }, DispatchReceiver { rx })
}

/// Producer side. Cheap to clone.
#[derive(Debug)]
pub struct DispatchSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for DispatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DispatchSender<T> {
    /// Enqueue an item. Returns `false` if the consumer is gone.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Whether the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side. Exactly one exists per queue.
#[derive(Debug)]
pub struct DispatchReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> DispatchReceiver<T> {
    /// Run `action` on every queued item, in FIFO order, without waiting.
    ///
    /// Returns the number of items drained.
    pub fn drain_all(&mut self, mut action: impl FnMut(T)) -> usize {
        let mut drained = 0;
        while let Ok(item) = self.rx.try_recv() {
            action(item);
            drained += 1;
        }
        drained
    }

    /// Wait for at least one item, then drain everything queued.
    ///
    /// Returns `None` once every sender is gone and the queue is empty.
    pub async fn wait_and_drain(&mut self, mut action: impl FnMut(T)) -> Option<usize> {
        let first = self.rx.recv().await?;
        action(first);
        Some(1 + self.drain_all(action))
    }

    /// Wait for the next single item.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
