use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::bus::{BroadcastBus, MemoryBus};
use crate::error::ErrorSink;
use crate::store::{HttpStore, MemoryStore, RequestStore};
use crate::telemetry::{self, Telemetry};

#[derive(Clone)]
pub struct Config {
    pub app_name: String,
    pub app_port: u16,
    /// Must match the ICE server list configured in the browser client.
    pub stun_servers: Vec<String>,
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub disable_telemetry: bool,
    /// Experimental split-path RTP forwarding (`EXPERIMENT_RTP_SEP_RW`).
    pub split_rtp_forwarding: bool,
    pub abort_poll_interval: Duration,
    pub track_timeout: Duration,
    pub offer_wait_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let app_port = std::env::var("APP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("APP_PORT must be a port number")?;

        let app_name = std::env::var("APP_NAME").unwrap_or_else(|_| "beamcast".to_string());

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let store_url = std::env::var("STORE_URL").ok();
        if store_url.is_none() {
            tracing::warn!("STORE_URL not set, using the in-process store (development only)");
        }
        let store_token = std::env::var("STORE_TOKEN").ok();

        let disable_telemetry = env_flag("DISABLE_TELEMETRY");
        let split_rtp_forwarding = env_flag("EXPERIMENT_RTP_SEP_RW");

        Ok(Config {
            app_name,
            app_port,
            stun_servers,
            store_url,
            store_token,
            disable_telemetry,
            split_rtp_forwarding,
            abort_poll_interval: Duration::from_secs(5),
            track_timeout: Duration::from_secs(30),
            offer_wait_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(4),
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true").unwrap_or(false)
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn RequestStore>,
    pub bus: Arc<dyn BroadcastBus>,
    pub telemetry: Arc<dyn Telemetry>,
    pub errors: ErrorSink,
}

impl AppState {
    /// Build the state with backends selected from the configuration.
    pub fn new(config: Config, errors: ErrorSink) -> Self {
        let store: Arc<dyn RequestStore> = match &config.store_url {
            Some(url) => Arc::new(HttpStore::new(url, config.store_token.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        let bus: Arc<dyn BroadcastBus> = Arc::new(MemoryBus::new());
        let telemetry = telemetry::for_namespace(&config.app_name, config.disable_telemetry);
        Self::with_backends(config, store, bus, telemetry, errors)
    }

    /// Build the state around explicit backends (tests and embedding).
    pub fn with_backends(
        config: Config,
        store: Arc<dyn RequestStore>,
        bus: Arc<dyn BroadcastBus>,
        telemetry: Arc<dyn Telemetry>,
        errors: ErrorSink,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            telemetry,
            errors,
        }
    }
}
