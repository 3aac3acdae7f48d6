use crate::types::Exchange;
use keeper_common::{KeeperError, Result};
use tokio::sync::mpsc;

/// Room for bursty failovers before producers start to block
pub const DEFAULT_EXCHANGE_CAPACITY: usize = 4096;

/// Create a bounded exchange queue
pub fn exchange_queue(capacity: usize) -> (ExchangeSender, ExchangeReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ExchangeSender { tx }, ExchangeReceiver { rx })
}

/// Producer side, held by every group monitor
#[derive(Debug, Clone)]
pub struct ExchangeSender {
    tx: mpsc::Sender<Exchange>,
}

impl ExchangeSender {
    /// Enqueue an event, waiting while the queue is full
    pub async fn send(&self, exchange: Exchange) -> Result<()> {
        self.tx
            .send(exchange)
            .await
            .map_err(|_| KeeperError::QueueClosed)
    }

    /// Free slots left in the queue
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer side, owned by the reconciliation loop
#[derive(Debug)]
pub struct ExchangeReceiver {
    rx: mpsc::Receiver<Exchange>,
}

impl ExchangeReceiver {
    pub async fn recv(&mut self) -> Option<Exchange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Exchange> {
        self.rx.try_recv().ok()
    }

    /// Take everything currently queued
    pub fn drain(&mut self) -> Vec<Exchange> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_per_producer() {
        let (tx, mut rx) = exchange_queue(8);
        tx.send(Exchange::exit("g1")).await.unwrap();
        tx.send(Exchange::update("g1", "n1", "n2")).await.unwrap();
        tx.send(Exchange::stop("g1")).await.unwrap();

        let events = rx.drain();
        assert_eq!(
            events,
            vec![
                Exchange::exit("g1"),
                Exchange::update("g1", "n1", "n2"),
                Exchange::stop("g1"),
            ]
        );
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (tx, mut rx) = exchange_queue(1);
        tx.send(Exchange::exit("g1")).await.unwrap();
        assert_eq!(tx.capacity(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(Exchange::exit("g2"))).await;
        assert!(blocked.is_err());

        assert_eq!(rx.recv().await.unwrap().group, "g1");
        tx.send(Exchange::exit("g2")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().group, "g2");
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (tx, rx) = exchange_queue(4);
        drop(rx);
        assert!(matches!(
            tx.send(Exchange::exit("g1")).await,
            Err(KeeperError::QueueClosed)
        ));
    }
}
