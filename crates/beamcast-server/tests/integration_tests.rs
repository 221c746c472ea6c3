//! Integration tests for the beamcast server.
//!
//! The pipeline tests run the real roles and real WebRTC peer connections
//! against the in-process store and bus backends; nothing external is
//! required. ICE gathering uses host candidates only (no STUN configured),
//! so handshakes complete without network access.
//!
//! Run with: cargo test -p beamcast-server --test integration_tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::{decode_description, encode_description, Request, SessionDescription};
use beamcast_server::bus::{BroadcastBus, MemoryBus};
use beamcast_server::error::{ErrorEvent, ErrorSink, SessionError};
use beamcast_server::sfu::BroadcastSession;
use beamcast_server::state::{AppState, Config};
use beamcast_server::store::{MemoryStore, RequestStore};
use beamcast_server::telemetry::NoopTelemetry;
use beamcast_server::{http, roles};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

struct Harness {
    state: AppState,
    store: MemoryStore,
    bus: MemoryBus,
    errors_rx: mpsc::Receiver<ErrorEvent>,
    root: CancellationToken,
}

impl Harness {
    fn new(config: Config) -> Self {
        let store = MemoryStore::new();
        let bus = MemoryBus::new();
        let (errors, errors_rx) = ErrorSink::channel(64);
        let state = AppState::with_backends(
            config,
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            Arc::new(NoopTelemetry),
            errors,
        );
        Self {
            state,
            store,
            bus,
            errors_rx,
            root: CancellationToken::new(),
        }
    }

    /// Poll the store until the request's answer is written.
    async fn await_answer(&self, id: &str, deadline: Duration) -> String {
        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        loop {
            let request = self.store.get(id).await.expect("request exists");
            if !request.answer.is_empty() {
                return request.answer;
            }
            assert!(waited < deadline, "no answer for {id} within {deadline:?}");
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn test_config() -> Config {
    Config {
        app_name: "beamcast-test".to_string(),
        app_port: 0,
        stun_servers: vec![],
        store_url: None,
        store_token: None,
        disable_telemetry: true,
        split_rtp_forwarding: false,
        abort_poll_interval: Duration::from_millis(200),
        track_timeout: Duration::from_secs(2),
        offer_wait_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_millis(100),
    }
}

/// Build a client-side peer connection that offers to send one video
/// track, with ICE gathering already complete (one-shot signaling).
async fn client_video_offer() -> (Arc<RTCPeerConnection>, String) {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let peer_conn = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    );
    peer_conn
        .add_transceiver_from_kind(RTPCodecType::Video, None)
        .await
        .unwrap();

    let offer = peer_conn.create_offer(None).await.unwrap();
    let mut gather_complete = peer_conn.gathering_complete_promise().await;
    peer_conn.set_local_description(offer).await.unwrap();
    let _ = gather_complete.recv().await;

    let local_desc = peer_conn.local_description().await.unwrap();
    let encoded = encode_description(&SessionDescription::offer(local_desc.sdp));
    (peer_conn, encoded)
}

#[tokio::test]
async fn ping_endpoint_reports_configured_port() {
    let mut config = test_config();
    config.app_port = 18080;
    let harness = Harness::new(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = harness.root.child_token();
    let app = http::router(harness.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .ok();
    });

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/ping"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["message"], "pong:18080");
}

#[tokio::test]
async fn monitor_publishes_new_broadcaster_requests() {
    let harness = Harness::new(test_config());
    let mut deliveries = harness.bus.subscribe(harness.root.child_token());

    {
        let state = harness.state.clone();
        let cancel = harness.root.child_token();
        tokio::spawn(async move { roles::monitor::run(state, cancel).await });
    }

    let id = harness
        .store
        .insert(Request::broadcaster("alice", "b64-offer"))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .expect("monitor published nothing")
        .unwrap();
    assert_eq!(message.broadcast_id, id);
    message.ack();
}

#[tokio::test]
async fn pipeline_answers_broadcaster_offer() {
    let harness = Harness::new(test_config());

    for role in ["monitor", "broadcast"] {
        let state = harness.state.clone();
        let cancel = harness.root.child_token();
        let entry = *roles::registry().get(role).unwrap();
        tokio::spawn(async move { entry(state, cancel).await });
    }

    let (_client, offer) = client_video_offer().await;
    let id = harness
        .store
        .insert(Request::broadcaster("alice", offer))
        .await
        .unwrap();

    let answer = harness.await_answer(&id, Duration::from_secs(10)).await;
    let decoded = decode_description(&answer).expect("stored answer decodes");
    assert!(decoded.is_answer());
    assert!(!decoded.sdp.is_empty());
}

#[tokio::test]
async fn duplicate_dispatch_runs_a_single_session() {
    let mut config = test_config();
    // Keep the first session alive in awaiting-track for the whole test.
    config.track_timeout = Duration::from_secs(30);
    let mut harness = Harness::new(config);

    {
        let state = harness.state.clone();
        let cancel = harness.root.child_token();
        tokio::spawn(async move { roles::broadcast::run(state, cancel).await });
    }

    let (_client, offer) = client_video_offer().await;
    let id = harness
        .store
        .insert(Request::broadcaster("alice", offer))
        .await
        .unwrap();
    harness.bus.publish(&id).await.unwrap();
    harness.bus.publish(&id).await.unwrap();

    harness.await_answer(&id, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The duplicate must be dropped by the in-flight guard: no session
    // scoped error (an AlreadyAnswered bail-out would report one).
    while let Ok(event) = harness.errors_rx.try_recv() {
        assert_ne!(event.scope, "session", "unexpected session error: {event:?}");
    }
}

#[tokio::test]
async fn track_timeout_terminates_session_after_answer() {
    let harness = Harness::new(test_config());

    let (_client, offer) = client_video_offer().await;
    let id = harness
        .store
        .insert(Request::broadcaster("alice", offer))
        .await
        .unwrap();

    let session = BroadcastSession::new(
        harness.state.clone(),
        id.clone(),
        harness.root.child_token(),
    );
    let handle = tokio::spawn(session.run());

    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("session outlived the track timeout")
        .unwrap();
    assert!(matches!(result, Err(SessionError::TrackTimeout(_))));

    // The answer is written before awaiting-track, so it must be present.
    let request = harness.store.get(&id).await.unwrap();
    assert!(!request.answer.is_empty());
}

#[tokio::test]
async fn abort_flag_terminates_session() {
    let mut config = test_config();
    config.track_timeout = Duration::from_secs(30);
    let harness = Harness::new(config);

    let (_client, offer) = client_video_offer().await;
    let id = harness
        .store
        .insert(Request::broadcaster("alice", offer))
        .await
        .unwrap();

    let session = BroadcastSession::new(
        harness.state.clone(),
        id.clone(),
        harness.root.child_token(),
    );
    let handle = tokio::spawn(session.run());

    harness.await_answer(&id, Duration::from_secs(10)).await;
    harness.store.set_abort(&id, true).await.unwrap();

    // Abort must be observed within two poll intervals (plus margin).
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("abort was not observed in time")
        .unwrap();
    assert!(matches!(result, Err(SessionError::Cancelled)));
}

#[tokio::test]
async fn malformed_offer_terminates_session_without_answer() {
    let harness = Harness::new(test_config());

    let id = harness
        .store
        .insert(Request::broadcaster("alice", "not-base64!!!"))
        .await
        .unwrap();

    let session = BroadcastSession::new(
        harness.state.clone(),
        id.clone(),
        harness.root.child_token(),
    );
    let result = session.run().await;
    assert!(matches!(result, Err(SessionError::Signal(_))));

    let request = harness.store.get(&id).await.unwrap();
    assert!(request.answer.is_empty());
}
