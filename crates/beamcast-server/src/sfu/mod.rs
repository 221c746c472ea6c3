//! SFU (Selective Forwarding Unit) for one-to-many video streaming
//!
//! This module implements zero-copy RTP packet forwarding for a single
//! broadcast: one ingress peer connection publishes a server-local track,
//! and every participant's egress peer connection sends that track back
//! out. No processing or transcoding happens in between.

mod forward;
mod participant;
mod session;

pub use session::BroadcastSession;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Build a WebRTC API with the default codecs and the default RTCP
/// interceptor chain (NACK, reports). Each peer connection gets its own
/// API instance because the media engine is consumed by the builder.
pub(crate) fn build_api() -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Peer connection configuration. The ICE server list must match the one
/// configured in the browser client.
pub(crate) fn peer_config(stun_servers: &[String]) -> RTCConfiguration {
    let ice_servers = stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
