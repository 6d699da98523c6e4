//! Zero-capacity handoff queues
//!
//! A handoff queue has no buffer of its own: `send` returns only after a
//! receiver has taken the item. Waiting senders are served in arrival
//! order, which is what keeps POST bodies of one session in order.
//!
//! Built on a one-slot `mpsc` channel whose items carry a oneshot
//! acknowledgement. The slot is released as soon as the receiver dequeues,
//! and the acknowledgement is what the sender waits on.

use std::fmt;

use tokio::sync::{mpsc, oneshot};

/// Error returned by [`HandoffSender::send`]
#[derive(thiserror::Error, PartialEq, Eq)]
pub enum HandoffError<T> {
    /// The receiver is gone; the item is handed back
    #[error("handoff receiver closed")]
    Closed(T),
    /// The receiving side vanished mid-handoff and the item went with it
    #[error("handoff item lost")]
    Lost,
}

impl<T> fmt::Debug for HandoffError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Closed(_) => f.write_str("Closed(..)"),
            HandoffError::Lost => f.write_str("Lost"),
        }
    }
}

impl<T> HandoffError<T> {
    /// Recover the item, if it survived
    pub fn into_inner(self) -> Option<T> {
        match self {
            HandoffError::Closed(item) => Some(item),
            HandoffError::Lost => None,
        }
    }
}

type Ack<T> = oneshot::Sender<Result<(), T>>;

struct Handoff<T> {
    item: Option<T>,
    ack: Option<Ack<T>>,
}

impl<T> Handoff<T> {
    fn complete(&mut self) -> Option<T> {
        let item = self.item.take()?;
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(Ok(()));
        }
        Some(item)
    }
}

impl<T> Drop for Handoff<T> {
    // Dropped while still queued: the receiver went away, give the item back
    fn drop(&mut self) {
        if let (Some(item), Some(ack)) = (self.item.take(), self.ack.take()) {
            let _ = ack.send(Err(item));
        }
    }
}

/// Sending half of a handoff queue
pub struct HandoffSender<T> {
    tx: mpsc::Sender<Handoff<T>>,
}

/// Receiving half of a handoff queue
pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<Handoff<T>>,
}

/// Create a zero-capacity handoff queue
pub fn channel<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

impl<T> HandoffSender<T> {
    /// Hand `item` to the receiver, waiting until it has been taken
    ///
    /// Dropping this future before the item is queued sends nothing; once
    /// queued the item is delivered even if the future is dropped.
    pub async fn send(&self, item: T) -> Result<(), HandoffError<T>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let handoff = Handoff {
            item: Some(item),
            ack: Some(ack_tx),
        };

        if let Err(mpsc::error::SendError(mut handoff)) = self.tx.send(handoff).await {
            return match handoff.item.take() {
                Some(item) => Err(HandoffError::Closed(item)),
                None => Err(HandoffError::Lost),
            };
        }

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(item)) => Err(HandoffError::Closed(item)),
            Err(_) => Err(HandoffError::Lost),
        }
    }

    /// Whether the receiver has been dropped or closed
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both senders feed the same queue
    pub fn same_channel(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Resolves once the receiver is gone
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for HandoffSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> HandoffReceiver<T> {
    /// Take the next item; `None` once every sender is dropped
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let mut handoff = self.rx.recv().await?;
            if let Some(item) = handoff.complete() {
                return Some(item);
            }
        }
    }

    /// Stop accepting items; waiting senders get their items back
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<T> fmt::Debug for HandoffReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandoffReceiver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_waits_for_receiver() {
        let (tx, mut rx) = channel::<u32>();

        let mut send = tokio::spawn(async move { tx.send(1).await });

        // Nobody is receiving, so the send cannot complete
        assert!(timeout(Duration::from_millis(50), &mut send).await.is_err());

        assert_eq!(rx.recv().await, Some(1));
        assert!(send.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_waiting_senders_are_served_in_order() {
        let (tx, mut rx) = channel::<u32>();

        let mut sends = Vec::new();
        for i in 0..5 {
            let tx = tx.clone();
            sends.push(tokio::spawn(async move { tx.send(i).await }));
            // Let each sender enqueue before spawning the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(rx.recv().await.unwrap());
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);

        for send in sends {
            assert!(send.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_send_to_dropped_receiver_returns_item() {
        let (tx, rx) = channel::<String>();
        drop(rx);

        let err = tx.send("hello".to_string()).await.unwrap_err();
        assert_eq!(err.into_inner(), Some("hello".to_string()));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_receiver_dropped_while_item_waits() {
        let (tx, rx) = channel::<u32>();

        let send = tokio::spawn(async move { tx.send(7).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        let result = timeout(Duration::from_secs(1), send)
            .await
            .expect("send must not hang")
            .unwrap();
        assert_eq!(result, Err(HandoffError::Closed(7)));
    }

    #[tokio::test]
    async fn test_recv_ends_when_senders_dropped() {
        let (tx, mut rx) = channel::<u32>();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_same_channel() {
        let (tx_a, _rx_a) = channel::<u32>();
        let (tx_b, _rx_b) = channel::<u32>();

        assert!(tx_a.same_channel(&tx_a.clone()));
        assert!(!tx_a.same_channel(&tx_b));
    }
}
