//! In-process store backend for development and tests.
//!
//! Mutations fan out through a broadcast channel of post-change document
//! states; each feed task classifies them against its own filter. Lagging
//! feeds surface a transient error in-band rather than silently dropping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use beamcast_protocol::Request;

use super::{DocChange, RequestFilter, RequestStore, StoreError};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    documents: RwLock<HashMap<String, Request>>,
    events: broadcast::Sender<Request>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                documents: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Request),
    {
        let mut documents = self.inner.documents.write().await;
        let request = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply(request);
        // No receivers is fine; feeds subscribe lazily.
        let _ = self.inner.events.send(request.clone());
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, mut request: Request) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        request.id = id.clone();
        let mut documents = self.inner.documents.write().await;
        documents.insert(id.clone(), request.clone());
        let _ = self.inner.events.send(request);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Request, StoreError> {
        self.inner
            .documents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_offer(&self, id: &str, offer: &str) -> Result<(), StoreError> {
        self.mutate(id, |request| request.offer = offer.to_string())
            .await
    }

    async fn set_answer(&self, id: &str, answer: &str) -> Result<(), StoreError> {
        self.mutate(id, |request| request.answer = answer.to_string())
            .await
    }

    async fn set_abort(&self, id: &str, abort: bool) -> Result<(), StoreError> {
        self.mutate(id, |request| request.abort = abort).await
    }

    fn changes(
        &self,
        filter: RequestFilter,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<DocChange, StoreError>> {
        // Capacity 1: at most one in-flight change per consumer.
        let (tx, rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut events = inner.events.subscribe();
            // Matched ids for this feed lifetime; first match is Added,
            // anything later for the same id is Modified.
            let mut matched: HashSet<String> = HashSet::new();

            // Initial snapshot: documents already matching are Added, so a
            // restarted watcher picks unanswered requests back up.
            let snapshot: Vec<Request> = {
                let documents = inner.documents.read().await;
                documents.values().filter(|d| filter.matches(d)).cloned().collect()
            };
            for request in snapshot {
                matched.insert(request.id.clone());
                if send(&tx, &cancel, Ok(DocChange::Added(request))).await.is_err() {
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let item = match event {
                    Ok(request) => {
                        if matched.contains(&request.id) {
                            Ok(DocChange::Modified(request))
                        } else if filter.matches(&request) {
                            matched.insert(request.id.clone());
                            Ok(DocChange::Added(request))
                        } else {
                            continue;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => Err(StoreError::Unavailable(
                        format!("change feed lagged by {n} events"),
                    )),
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if send(&tx, &cancel, item).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn document(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Request, StoreError>> {
        let (tx, rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut events = inner.events.subscribe();

            let current = inner.documents.read().await.get(&id).cloned();
            if let Some(request) = current {
                if send(&tx, &cancel, Ok(request)).await.is_err() {
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let item = match event {
                    Ok(request) if request.id == id => Ok(request),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => Err(StoreError::Unavailable(
                        format!("document feed lagged by {n} events"),
                    )),
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if send(&tx, &cancel, item).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

async fn send<T>(
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    item: T,
) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = tx.send(item) => sent.map_err(|_| ()),
    }
}
