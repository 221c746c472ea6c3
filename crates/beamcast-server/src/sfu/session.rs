//! Broadcast session: the per-broadcast state machine on the ingress side.
//!
//! One session owns the broadcaster's peer connection, the current
//! server-local track, and every participant spawned under it. It moves
//! through `awaiting-offer → answered → awaiting-track → live` and tears
//! everything down on abort, cancellation, track timeout, or peer
//! connection failure.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use beamcast_protocol::{encode_description, SessionDescription};

use crate::error::SessionError;
use crate::state::AppState;
use crate::store::{watcher, RequestFilter};

use super::forward::{self, TrackEvent};
use super::participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitingOffer,
    Answered,
    AwaitingTrack,
    Live,
}

pub struct BroadcastSession {
    state: AppState,
    broadcast_id: String,
    cancel: CancellationToken,
    phase: SessionState,
    peer_conn: Option<Arc<RTCPeerConnection>>,
}

impl BroadcastSession {
    pub fn new(state: AppState, broadcast_id: String, cancel: CancellationToken) -> Self {
        Self {
            state,
            broadcast_id,
            cancel,
            phase: SessionState::AwaitingOffer,
            peer_conn: None,
        }
    }

    /// Run the session to completion. Always tears down child scopes and
    /// the ingress peer connection on the way out.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        self.cancel.cancel();
        if let Some(peer_conn) = self.peer_conn.take() {
            if let Err(err) = peer_conn.close().await {
                self.state
                    .errors
                    .report("session", Some(&self.broadcast_id), true, err)
                    .await;
            }
        }
        result
    }

    fn enter(&mut self, phase: SessionState) {
        tracing::debug!(
            broadcast_id = %self.broadcast_id,
            from = ?self.phase,
            to = ?phase,
            "session phase"
        );
        self.phase = phase;
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let config = self.state.config.clone();

        let offer = watcher::wait_for_offer(
            self.state.store.clone(),
            &self.broadcast_id,
            config.offer_wait_timeout,
            &self.state.errors,
            &self.cancel,
        )
        .await?;
        tracing::info!(broadcast_id = %self.broadcast_id, "broadcaster offer received");

        // A duplicate dispatch on another worker may have answered while we
        // waited; the stored answer is authoritative.
        let request = self.state.store.get(&self.broadcast_id).await?;
        if !request.answer.is_empty() {
            return Err(SessionError::AlreadyAnswered(self.broadcast_id.clone()));
        }

        let api = super::build_api()?;
        let peer_conn = Arc::new(
            api.new_peer_connection(super::peer_config(&config.stun_servers))
                .await?,
        );
        self.peer_conn = Some(peer_conn.clone());

        // Receive exactly one video track from the broadcaster.
        peer_conn
            .add_transceiver_from_kind(RTPCodecType::Video, None)
            .await?;

        let (track_tx, mut track_rx) = mpsc::channel::<TrackEvent>(1);
        let media_ssrc = Arc::new(AtomicU64::new(0));
        forward::install_on_track(
            &peer_conn,
            &self.cancel,
            track_tx,
            media_ssrc.clone(),
            self.state.errors.clone(),
            self.broadcast_id.clone(),
            config.split_rtp_forwarding,
        );
        forward::spawn_pli_sender(peer_conn.clone(), media_ssrc, self.cancel.child_token());

        // Ingress connection dying ends the session.
        {
            let cancel = self.cancel.clone();
            let broadcast_id = self.broadcast_id.clone();
            peer_conn.on_peer_connection_state_change(Box::new(move |conn_state| {
                if matches!(
                    conn_state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    tracing::info!(broadcast_id = %broadcast_id, ?conn_state, "ingress connection gone");
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
        self.state
            .store
            .set_answer(
                &self.broadcast_id,
                &encode_description(&SessionDescription::answer(local_desc.sdp)),
            )
            .await?;
        self.enter(SessionState::Answered);

        spawn_abort_watcher(
            self.state.clone(),
            self.broadcast_id.clone(),
            self.cancel.clone(),
            config.abort_poll_interval,
        );

        self.enter(SessionState::AwaitingTrack);
        let first = self.await_first_track(&mut track_rx, config.track_timeout).await?;
        self.enter(SessionState::Live);

        self.live_loop(track_rx, first).await
    }

    async fn await_first_track(
        &self,
        track_rx: &mut mpsc::Receiver<TrackEvent>,
        timeout: Duration,
    ) -> Result<TrackEvent, SessionError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(SessionError::TrackTimeout(timeout)),
            event = track_rx.recv() => event.ok_or(SessionError::Cancelled),
        }
    }

    /// Live phase: hand new participants the current track and adopt newer
    /// track epochs as they arrive, cancelling the superseded loop.
    async fn live_loop(
        &mut self,
        mut track_rx: mpsc::Receiver<TrackEvent>,
        first: TrackEvent,
    ) -> Result<(), SessionError> {
        let mut local_track: Arc<TrackLocalStaticRTP> = first.track;
        let mut epoch_cancel = first.cancel;
        let mut epoch = first.epoch;
        tracing::info!(broadcast_id = %self.broadcast_id, epoch, "session live, accepting participants");

        let mut participants = watcher::watch(
            self.state.store.clone(),
            RequestFilter::participants(self.broadcast_id.clone()),
            self.state.errors.clone(),
            self.cancel.child_token(),
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                event = track_rx.recv() => {
                    let Some(event) = event else { return Err(SessionError::Cancelled) };
                    tracing::info!(
                        broadcast_id = %self.broadcast_id,
                        superseded = epoch,
                        adopted = event.epoch,
                        "track epoch swap"
                    );
                    epoch_cancel.cancel();
                    self.state.telemetry.epoch_swap();
                    local_track = event.track;
                    epoch_cancel = event.cancel;
                    epoch = event.epoch;
                }
                request = participants.recv() => {
                    let Some(request) = request else {
                        // Participant watch only dies on a fatal store error.
                        return Err(SessionError::Store(crate::store::StoreError::FeedClosed));
                    };
                    tracing::info!(
                        broadcast_id = %self.broadcast_id,
                        request_id = %request.id,
                        "participant request"
                    );
                    participant::spawn(
                        self.state.clone(),
                        request,
                        local_track.clone(),
                        self.cancel.child_token(),
                    );
                }
            }
        }
    }
}

/// Poll the broadcaster request document and cancel the session when the
/// client flags `abort`. Out-of-band termination through the store is the
/// only signal that survives a flaky client connection.
fn spawn_abort_watcher(
    state: AppState,
    broadcast_id: String,
    session_cancel: CancellationToken,
    poll_interval: Duration,
) {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + poll_interval;
        let mut ticker = tokio::time::interval_at(start, poll_interval);
        loop {
            tokio::select! {
                _ = session_cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match state.store.get(&broadcast_id).await {
                Ok(request) if request.abort => {
                    tracing::info!(broadcast_id = %broadcast_id, "abort requested, cancelling session");
                    session_cancel.cancel();
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    state
                        .errors
                        .report("abort-watcher", Some(&broadcast_id), true, err)
                        .await;
                }
            }
        }
    });
}
