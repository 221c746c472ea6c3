//! Monitor role: one logical instance converting new broadcaster requests
//! into durable, load-balanceable bus messages.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use beamcast_protocol::request::BROADCASTS_TOPIC;

use crate::state::AppState;
use crate::store::{watcher, RequestFilter};

pub async fn run(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    tracing::info!(topic = BROADCASTS_TOPIC, "monitor role started");

    state.bus.verify_topic().await?;

    let mut requests = watcher::watch(
        state.store.clone(),
        RequestFilter::broadcasters(),
        state.errors.clone(),
        cancel.child_token(),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("monitor role cancelled");
                return Ok(());
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    // The watch only ends on a fatal store error.
                    anyhow::bail!("broadcaster watch ended");
                };
                let started = Instant::now();
                match state.bus.publish(&request.id).await {
                    Ok(()) => {
                        tracing::info!(broadcast_id = %request.id, "published broadcast request");
                    }
                    // No retry here: the document stays unanswered and
                    // reappears on restart; workers are idempotent on id.
                    Err(err) => {
                        state.errors.report("monitor", Some(&request.id), true, err).await;
                    }
                }
                state.telemetry.publish_duration(started.elapsed());
            }
        }
    }
}
