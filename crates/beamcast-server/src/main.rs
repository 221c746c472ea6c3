use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use beamcast_server::{error, http, roles, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beamcast=debug,beamcast_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let role_name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| roles::DEFAULT_ROLE.to_string());
    let registry = roles::registry();
    let role = *registry
        .get(role_name.as_str())
        .with_context(|| format!("unknown role {role_name:?}, expected monitor or broadcast"))?;

    let config = state::Config::load()?;
    tracing::info!(role = %role_name, app = %config.app_name, "starting beamcast");

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, cancelling root scope");
            root.cancel();
        });
    }

    let (errors, error_rx) = error::ErrorSink::channel(64);
    tokio::spawn(error::drain_errors(error_rx, root.child_token()));

    let app_state = state::AppState::new(config.clone(), errors);

    {
        let app_state = app_state.clone();
        let cancel = root.child_token();
        tokio::spawn(async move {
            if let Err(err) = http::serve(app_state, cancel).await {
                tracing::error!("health endpoint failed: {err:#}");
            }
        });
    }

    let result = role(app_state, root.child_token()).await;

    // Give in-flight sessions and watchers time to unwind.
    root.cancel();
    tokio::time::sleep(config.shutdown_grace).await;

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("installing SIGTERM handler failed: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
