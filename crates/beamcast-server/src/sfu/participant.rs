//! Egress side: one peer connection per participant, fed by the broadcast
//! session's server-local track.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use beamcast_protocol::{encode_description, Request, SessionDescription};

use crate::error::SessionError;
use crate::state::AppState;
use crate::store::watcher;

use super::forward::RTCP_MTU;

/// Spawn a participant session. Failures are isolated here: whatever goes
/// wrong, the owning broadcast session never sees it.
pub(crate) fn spawn(
    state: AppState,
    request: Request,
    local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let request_id = request.id.clone();
        match run(&state, request, local_track, cancel).await {
            Ok(()) | Err(SessionError::Cancelled) => {
                tracing::info!(request_id = %request_id, "participant session ended");
            }
            Err(err) => {
                state
                    .errors
                    .report("participant", Some(&request_id), true, err)
                    .await;
            }
        }
    });
}

async fn run(
    state: &AppState,
    request: Request,
    local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let offer = watcher::wait_for_offer(
        state.store.clone(),
        &request.id,
        state.config.offer_wait_timeout,
        &state.errors,
        &cancel,
    )
    .await?;
    tracing::info!(request_id = %request.id, "participant offer received");

    let api = super::build_api()?;
    let peer_conn = Arc::new(
        api.new_peer_connection(super::peer_config(&state.config.stun_servers))
            .await?,
    );

    let result = attach(state, &request, local_track, &peer_conn, offer, &cancel).await;

    if let Err(err) = peer_conn.close().await {
        state
            .errors
            .report("participant", Some(&request.id), true, err)
            .await;
    }
    result
}

/// Everything between peer connection creation and teardown: attach the
/// fan-out track, answer the offer, then hold until cancellation.
async fn attach(
    state: &AppState,
    request: &Request,
    local_track: Arc<TrackLocalStaticRTP>,
    peer_conn: &Arc<RTCPeerConnection>,
    offer: SessionDescription,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let sender = peer_conn
        .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    spawn_rtcp_drain(sender, cancel.child_token());

    // Egress connection closing ends this session.
    {
        let cancel = cancel.clone();
        peer_conn.on_peer_connection_state_change(Box::new(move |conn_state| {
            if matches!(
                conn_state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                cancel.cancel();
            }
            Box::pin(async {})
        }));
    }

    peer_conn
        .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
        .await?;
    let answer = peer_conn.create_answer(None).await?;

    // One-shot signaling: collect every candidate before answering.
    let mut gather_complete = peer_conn.gathering_complete_promise().await;
    peer_conn.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local_desc = peer_conn
        .local_description()
        .await
        .ok_or(SessionError::MissingLocalDescription)?;
    state
        .store
        .set_answer(
            &request.id,
            &encode_description(&SessionDescription::answer(local_desc.sdp)),
        )
        .await?;
    tracing::info!(request_id = %request.id, "participant answer written");

    cancel.cancelled().await;
    Ok(())
}

/// Drain RTCP on the egress sender; the NACK/PLI interceptors only run
/// while someone reads. Terminal read errors end the drain.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTCP_MTU];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                read = sender.read(&mut buf) => {
                    if read.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
