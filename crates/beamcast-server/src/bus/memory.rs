//! In-process bus backend for development and tests.
//!
//! Implements the at-least-once contract honestly: every delivery carries
//! an ack handle, and deliveries whose ack deadline lapses are requeued
//! with an incremented attempt counter. In deployment a managed queue
//! adapter sits behind the same trait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::{BroadcastBus, BusError, BusMessage};

const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Bounds outstanding unacked deliveries per subscriber (flow control).
const MAX_OUTSTANDING: usize = 8;

#[derive(Debug, Clone)]
struct Delivery {
    broadcast_id: String,
    attempt: u32,
}

#[derive(Clone)]
pub struct MemoryBus {
    queue: Arc<Mutex<VecDeque<Delivery>>>,
    notify: Arc<Notify>,
    ack_deadline: Duration,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            ack_deadline: DEFAULT_ACK_DEADLINE,
        }
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }

    async fn pop(&self) -> Option<Delivery> {
        self.queue.lock().await.pop_front()
    }

    async fn requeue(&self, delivery: Delivery) {
        self.queue.lock().await.push_back(delivery);
        self.notify.notify_one();
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BroadcastBus for MemoryBus {
    async fn verify_topic(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn verify_subscription(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn publish(&self, broadcast_id: &str) -> Result<(), BusError> {
        self.queue.lock().await.push_back(Delivery {
            broadcast_id: broadcast_id.to_string(),
            attempt: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(MAX_OUTSTANDING);
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                let delivery = loop {
                    if let Some(delivery) = bus.pop().await {
                        break delivery;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = bus.notify.notified() => {}
                    }
                };

                let attempt = delivery.attempt + 1;
                let (ack_tx, ack_rx) = oneshot::channel();
                let message =
                    BusMessage::new(delivery.broadcast_id.clone(), attempt, ack_tx);
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(message) => sent,
                };
                if sent.is_err() {
                    return;
                }

                // Track the ack deadline off the delivery path.
                let bus = bus.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        ack = ack_rx => {
                            if ack.is_ok() {
                                return;
                            }
                            // Handle dropped without ack: redeliver now.
                            bus.requeue(Delivery { broadcast_id: delivery.broadcast_id, attempt }).await;
                        }
                        _ = tokio::time::sleep(bus.ack_deadline) => {
                            bus.requeue(Delivery { broadcast_id: delivery.broadcast_id, attempt }).await;
                        }
                    }
                });
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let mut deliveries = bus.subscribe(cancel.clone());

        bus.publish("b1").await.unwrap();
        let message = deliveries.recv().await.unwrap();
        assert_eq!(message.broadcast_id, "b1");
        assert_eq!(message.delivery_attempt, 1);
        message.ack();
        cancel.cancel();
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered() {
        let bus = MemoryBus::new().with_ack_deadline(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let mut deliveries = bus.subscribe(cancel.clone());

        bus.publish("b1").await.unwrap();
        let first = deliveries.recv().await.unwrap();
        assert_eq!(first.delivery_attempt, 1);
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(2), deliveries.recv())
            .await
            .expect("redelivery")
            .unwrap();
        assert_eq!(second.broadcast_id, "b1");
        assert!(second.delivery_attempt >= 2);
        second.ack();
        cancel.cancel();
    }

    #[tokio::test]
    async fn acked_delivery_is_not_redelivered() {
        let bus = MemoryBus::new().with_ack_deadline(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let mut deliveries = bus.subscribe(cancel.clone());

        bus.publish("b1").await.unwrap();
        deliveries.recv().await.unwrap().ack();

        let extra =
            tokio::time::timeout(Duration::from_millis(300), deliveries.recv()).await;
        assert!(extra.is_err(), "acked message must stay acked");
        cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_publishes_yield_duplicate_deliveries() {
        let bus = MemoryBus::new();
        let cancel = CancellationToken::new();
        let mut deliveries = bus.subscribe(cancel.clone());

        bus.publish("b1").await.unwrap();
        bus.publish("b1").await.unwrap();

        let first = deliveries.recv().await.unwrap();
        let second = deliveries.recv().await.unwrap();
        assert_eq!(first.broadcast_id, "b1");
        assert_eq!(second.broadcast_id, "b1");
        first.ack();
        second.ack();
        cancel.cancel();
    }
}
