//! Broadcast role: pulls broadcast ids from the bus subscription and runs
//! one session per id.
//!
//! Deliveries are acked immediately on dispatch. The in-flight guard
//! serializes duplicate deliveries of the same id within this worker;
//! cross-worker duplicates are caught later by the already-answered check
//! inside the session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::request::{BROADCASTS_SUBSCRIPTION, BROADCASTS_TOPIC};

use crate::error::SessionError;
use crate::sfu::BroadcastSession;
use crate::state::AppState;

pub async fn run(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    tracing::info!(
        topic = BROADCASTS_TOPIC,
        subscription = BROADCASTS_SUBSCRIPTION,
        "broadcast role started"
    );

    state.bus.verify_topic().await?;
    state.bus.verify_subscription().await?;

    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut deliveries = state.bus.subscribe(cancel.child_token());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("broadcast role cancelled");
                return Ok(());
            }
            message = deliveries.recv() => {
                let Some(message) = message else { return Ok(()) };
                let started = Instant::now();
                let broadcast_id = message.broadcast_id.clone();
                tracing::info!(
                    broadcast_id = %broadcast_id,
                    attempt = message.delivery_attempt,
                    "received broadcast dispatch"
                );
                message.ack();

                if !in_flight.lock().await.insert(broadcast_id.clone()) {
                    tracing::info!(broadcast_id = %broadcast_id, "duplicate dispatch dropped");
                    state.telemetry.receive_duration(started.elapsed());
                    continue;
                }

                let session_state = state.clone();
                let session_cancel = cancel.child_token();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let session = BroadcastSession::new(
                        session_state.clone(),
                        broadcast_id.clone(),
                        session_cancel,
                    );
                    match session.run().await {
                        Ok(()) | Err(SessionError::Cancelled) => {
                            tracing::info!(broadcast_id = %broadcast_id, "session ended");
                        }
                        Err(err) => {
                            session_state
                                .errors
                                .report("session", Some(&broadcast_id), true, err)
                                .await;
                        }
                    }
                    in_flight.lock().await.remove(&broadcast_id);
                });

                state.telemetry.receive_duration(started.elapsed());
            }
        }
    }
}
