//! Message bus between the monitor and the broadcast workers.
//!
//! The bus carries exactly one message shape: the id of a broadcaster
//! request, published by the monitor and pulled by workers. Delivery is
//! at-least-once; consumers must tolerate duplicates.

mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic {0} does not exist")]
    MissingTopic(String),

    #[error("subscription {0} does not exist")]
    MissingSubscription(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// A delivery pulled from the `broadcasts` subscription. Dropping the
/// message without calling [`BusMessage::ack`] leaves it eligible for
/// redelivery once the ack deadline passes.
#[derive(Debug)]
pub struct BusMessage {
    pub broadcast_id: String,
    /// 1 for the first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
    ack: Option<oneshot::Sender<()>>,
}

impl BusMessage {
    pub(crate) fn new(
        broadcast_id: String,
        delivery_attempt: u32,
        ack: oneshot::Sender<()>,
    ) -> Self {
        Self {
            broadcast_id,
            delivery_attempt,
            ack: Some(ack),
        }
    }

    /// Acknowledge the delivery. Workers ack immediately on dispatch:
    /// session work exceeds any reasonable ack deadline, and a dead worker
    /// leads the client to abort and re-create the request.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

/// Contract for the message bus: durable topic publish plus an
/// at-least-once pull subscription with bounded outstanding deliveries.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    /// Verify the topic exists. Missing topics are a fatal initialization
    /// error for both roles.
    async fn verify_topic(&self) -> Result<(), BusError>;

    /// Verify the worker subscription exists.
    async fn verify_subscription(&self) -> Result<(), BusError>;

    async fn publish(&self, broadcast_id: &str) -> Result<(), BusError>;

    /// Pull deliveries until cancellation.
    fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<BusMessage>;
}
