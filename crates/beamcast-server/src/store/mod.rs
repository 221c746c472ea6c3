//! Document store access.
//!
//! The store is the only signaling channel between clients and the server:
//! clients insert request documents carrying offers, the server watches for
//! them and writes answers back. [`RequestStore`] is the contract every
//! backend provides; [`watcher`] layers the exactly-once watch and the
//! offer-wait on top of it.

mod http;
mod memory;
pub mod watcher;

pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::{Request, RequestKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(String),

    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store authentication lost: {0}")]
    AuthLost(String),

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("change feed closed")]
    FeedClosed,
}

impl StoreError {
    /// Fatal errors terminate the owning role; transient ones are reported
    /// on the error stream and the subscription continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::AuthLost(_))
    }
}

/// Predicate for the live change feed. The readiness clause
/// (`offer != "" AND answer == "" AND abort == false`) is implicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFilter {
    pub kind: RequestKind,
    pub parent: String,
}

impl RequestFilter {
    /// New broadcaster requests (the monitor's predicate).
    pub fn broadcasters() -> Self {
        Self {
            kind: RequestKind::Broadcaster,
            parent: String::new(),
        }
    }

    /// Participant requests under one broadcast.
    pub fn participants(parent: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Participant,
            parent: parent.into(),
        }
    }

    pub fn matches(&self, request: &Request) -> bool {
        request.kind == self.kind && request.parent == self.parent && request.is_ready()
    }
}

/// A classified change from the store backend.
#[derive(Debug, Clone)]
pub enum DocChange {
    /// Document newly entered the filter predicate.
    Added(Request),
    /// A previously seen document mutated.
    Modified(Request),
}

/// Contract every document store backend provides: inserts and atomic field
/// updates, a predicate-filtered live change feed with added/modified
/// classification, and a single-document live feed.
///
/// `insert` and `set_abort` are client-side operations; the server itself
/// only reads, watches, and writes answers. They live on the trait so tests
/// and tooling can drive the full exchange against any backend.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new request and return its store-assigned id.
    async fn insert(&self, request: Request) -> Result<String, StoreError>;

    async fn get(&self, id: &str) -> Result<Request, StoreError>;

    /// Atomically set the `offer` field (clients publish the offer after
    /// creating the document).
    async fn set_offer(&self, id: &str, offer: &str) -> Result<(), StoreError>;

    /// Atomically set the `answer` field.
    async fn set_answer(&self, id: &str, answer: &str) -> Result<(), StoreError>;

    /// Atomically set the `abort` flag.
    async fn set_abort(&self, id: &str, abort: bool) -> Result<(), StoreError>;

    /// Live change feed for documents matching `filter`. Documents already
    /// matching when the feed starts are delivered as `Added`; a given
    /// document is `Added` at most once per feed, with every later event
    /// for it classified as `Modified`. Transient backend errors are
    /// surfaced in-band; the feed ends on cancellation or a fatal error.
    fn changes(
        &self,
        filter: RequestFilter,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<DocChange, StoreError>>;

    /// Live feed of one document's states, starting from its current state
    /// if it exists.
    fn document(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Request, StoreError>>;
}
