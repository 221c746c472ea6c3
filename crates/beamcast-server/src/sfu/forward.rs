//! Epoch-based RTP forwarding from the ingress track to the server-local
//! track.
//!
//! The WebRTC stack may fire the on-track callback more than once for one
//! ingress peer connection. Rather than assuming uniqueness, every
//! invocation opens a new epoch: a fresh server-local track plus a
//! forwarding loop scoped to its own cancellation token. The session loop
//! adopts the latest epoch and cancels the superseded one; participants
//! keep writing to whichever track they captured at attach time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ErrorSink;

/// RTP read buffer size; packets larger than the path MTU do not occur.
const RTP_MTU: usize = 1400;

/// RTCP drain buffer size on egress senders.
pub(crate) const RTCP_MTU: usize = 1500;

/// Split-path queue depth before packets are dropped.
const SPLIT_QUEUE_CAPACITY: usize = 100;

/// Consecutive read failures tolerated before the epoch loop gives up.
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 500;

/// Interval between PLI requests to the broadcaster's encoder.
const PLI_INTERVAL: Duration = Duration::from_secs(3);

/// Track id and stream id on the server-local track. Stable across epochs
/// so participants observe one continuous stream identity.
const TRACK_ID: &str = "video";
const STREAM_ID: &str = "beamcast";

/// A server-local track generation. Only the latest epoch is authoritative.
pub(crate) struct TrackEvent {
    pub epoch: u64,
    pub track: Arc<TrackLocalStaticRTP>,
    /// Cancelling this token terminates the epoch's forwarding loop.
    pub cancel: CancellationToken,
}

/// Install the on-track callback on the ingress peer connection. Each
/// invocation records the remote SSRC for the PLI sender, opens a new
/// epoch, publishes it on `track_tx`, and spawns the forwarding loop,
/// which runs until the epoch is superseded or the session ends.
#[allow(clippy::too_many_arguments)]
pub(crate) fn install_on_track(
    peer_conn: &Arc<RTCPeerConnection>,
    session_cancel: &CancellationToken,
    track_tx: mpsc::Sender<TrackEvent>,
    media_ssrc: Arc<AtomicU64>,
    errors: ErrorSink,
    broadcast_id: String,
    split_paths: bool,
) {
    let epochs = Arc::new(AtomicU64::new(0));
    let session_cancel = session_cancel.clone();
    peer_conn.on_track(Box::new(move |remote_track, _receiver, _transceiver| {
        let epoch = epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = session_cancel.child_token();
        let track_tx = track_tx.clone();
        let media_ssrc = media_ssrc.clone();
        let errors = errors.clone();
        let broadcast_id = broadcast_id.clone();
        Box::pin(async move {
            tracing::info!(
                broadcast_id = %broadcast_id,
                epoch,
                ssrc = remote_track.ssrc(),
                "remote track arrived"
            );
            media_ssrc.store(remote_track.ssrc() as u64, Ordering::Relaxed);

            let local_track = Arc::new(TrackLocalStaticRTP::new(
                remote_track.codec().capability.clone(),
                TRACK_ID.to_string(),
                STREAM_ID.to_string(),
            ));

            let event = TrackEvent {
                epoch,
                track: local_track.clone(),
                cancel: cancel.clone(),
            };
            if track_tx.send(event).await.is_err() {
                // Session loop is gone; nothing to forward to.
                return;
            }

            // Spawn the loop rather than awaiting it here: the stack holds
            // the on_track handler lock across this future, and a re-fired
            // on_track (the next epoch) must be able to dispatch while the
            // current loop is still running.
            tokio::spawn(async move {
                if split_paths {
                    forward_split(remote_track, local_track, cancel, errors, broadcast_id).await;
                } else {
                    forward(remote_track, local_track, cancel, errors, broadcast_id).await;
                }
            });
        })
    }));
}

/// Direct forwarding: the read buffer is reused for the write, no copy in
/// between. Transient read errors keep the loop alive; pipe-closed writes
/// mean no subscribers yet and are ignored.
async fn forward(
    remote_track: Arc<TrackRemote>,
    local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    errors: ErrorSink,
    broadcast_id: String,
) {
    let mut buf = vec![0u8; RTP_MTU];
    let mut read_failures = 0u32;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(broadcast_id = %broadcast_id, "forwarding loop cancelled");
                return;
            }
            read = remote_track.read(&mut buf) => read,
        };
        match read {
            Ok((packet, _)) => {
                read_failures = 0;
                match local_track.write_rtp(&packet).await {
                    Ok(_) | Err(webrtc::Error::ErrClosedPipe) => {}
                    Err(err) => {
                        errors
                            .report("rtp-forward", Some(&broadcast_id), true, err)
                            .await;
                    }
                }
            }
            Err(err) => {
                read_failures += 1;
                if read_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    errors
                        .report("rtp-forward", Some(&broadcast_id), true, err)
                        .await;
                    return;
                }
            }
        }
    }
}

/// Split-path forwarding: reads enqueue into a bounded channel and a
/// dedicated writer drains it, decoupling read jitter from write jitter.
/// Packets are copied out at the enqueue boundary; overflow drops them.
async fn forward_split(
    remote_track: Arc<TrackRemote>,
    local_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    errors: ErrorSink,
    broadcast_id: String,
) {
    let (packet_tx, mut packet_rx) = mpsc::channel::<webrtc::rtp::packet::Packet>(SPLIT_QUEUE_CAPACITY);

    {
        let cancel = cancel.clone();
        let errors = errors.clone();
        let broadcast_id = broadcast_id.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => return,
                    packet = packet_rx.recv() => packet,
                };
                let Some(packet) = packet else { return };
                match local_track.write_rtp(&packet).await {
                    Ok(_) | Err(webrtc::Error::ErrClosedPipe) => {}
                    Err(err) => {
                        errors
                            .report("rtp-writer", Some(&broadcast_id), true, err)
                            .await;
                    }
                }
            }
        });
    }

    let mut buf = vec![0u8; RTP_MTU];
    let mut read_failures = 0u32;
    let mut dropped = 0u64;
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = remote_track.read(&mut buf) => read,
        };
        match read {
            Ok((packet, _)) => {
                read_failures = 0;
                if packet_tx.try_send(packet).is_err() {
                    dropped += 1;
                    if dropped % 1000 == 1 {
                        tracing::warn!(
                            broadcast_id = %broadcast_id,
                            dropped,
                            "split-path queue full, dropping packets"
                        );
                    }
                }
            }
            Err(err) => {
                read_failures += 1;
                if read_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    errors
                        .report("rtp-forward", Some(&broadcast_id), true, err)
                        .await;
                    break;
                }
            }
        }
    }
    // Dropping packet_tx ends the writer task.
}

/// Periodically ask the broadcaster's encoder for a keyframe. Runs for the
/// session lifetime; skips ticks until the first remote track sets the
/// SSRC. A failed RTCP write means the peer connection is gone.
pub(crate) fn spawn_pli_sender(
    peer_conn: Arc<RTCPeerConnection>,
    media_ssrc: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PLI_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let ssrc = media_ssrc.load(Ordering::Relaxed);
            if ssrc == 0 {
                continue;
            }
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: ssrc as u32,
            };
            if let Err(err) = peer_conn.write_rtcp(&[Box::new(pli)]).await {
                tracing::debug!("PLI send failed, stopping: {err}");
                return;
            }
        }
    });
}
