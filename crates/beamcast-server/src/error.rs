//! Error taxonomy and the process-wide error stream.
//!
//! Results propagate through direct returns; the error stream is only for
//! faults that must not unwind their producer (a forwarding loop hiccup, a
//! failed store poll). Sessions never crash the process: anything session
//! scoped surfaces here as a tagged event and gets logged by the drain task.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::SignalError;

use crate::store::StoreError;

/// Errors that terminate a single broadcast or participant session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("signaling: {0}")]
    Signal(#[from] SignalError),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("no remote track arrived within {0:?}")]
    TrackTimeout(std::time::Duration),

    #[error("no offer arrived within {0:?}")]
    OfferTimeout(std::time::Duration),

    #[error("request {0} was already answered by another worker")]
    AlreadyAnswered(String),

    #[error("local description unavailable after ICE gathering")]
    MissingLocalDescription,

    #[error("session cancelled")]
    Cancelled,
}

/// A tagged event on the process-wide error stream.
#[derive(Debug)]
pub struct ErrorEvent {
    /// Component that produced the error.
    pub scope: &'static str,
    /// Owning session, when the error is session scoped.
    pub session_id: Option<String>,
    /// Whether the producer kept running after reporting.
    pub recoverable: bool,
    pub cause: anyhow::Error,
}

/// Multi-producer handle to the error stream. Cloneable; the single
/// consumer is [`drain_errors`].
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<ErrorEvent>,
}

impl ErrorSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ErrorEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn report(
        &self,
        scope: &'static str,
        session_id: Option<&str>,
        recoverable: bool,
        cause: impl Into<anyhow::Error>,
    ) {
        let event = ErrorEvent {
            scope,
            session_id: session_id.map(str::to_string),
            recoverable,
            cause: cause.into(),
        };
        // A closed stream means the process is already shutting down.
        let _ = self.tx.send(event).await;
    }
}

/// Drains the error stream and logs every event. Runs until the stream
/// closes or the root scope is cancelled.
pub async fn drain_errors(mut rx: mpsc::Receiver<ErrorEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("error drain cancelled");
                return;
            }
            event = rx.recv() => {
                let Some(event) = event else { return };
                if event.recoverable {
                    tracing::warn!(
                        scope = event.scope,
                        session = event.session_id.as_deref(),
                        "recoverable: {:#}",
                        event.cause
                    );
                } else {
                    tracing::error!(
                        scope = event.scope,
                        session = event.session_id.as_deref(),
                        "fatal: {:#}",
                        event.cause
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_after_drain_shutdown_does_not_panic() {
        let (sink, rx) = ErrorSink::channel(4);
        drop(rx);
        sink.report("test", None, true, anyhow::anyhow!("boom")).await;
    }
}
