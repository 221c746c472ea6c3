//! HTTP document store backend.
//!
//! Talks to a PocketBase-style REST document API: collection records with
//! server-assigned ids, string filters, and PATCH field updates. The live
//! feeds are poll-based; the change classification required by the watcher
//! happens here by diffing against the last observed state.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::request::REQUESTS_COLLECTION;
use beamcast_protocol::Request;

use super::{DocChange, RequestFilter, RequestStore, StoreError};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PAGE_SIZE: usize = 200;

#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
}

#[derive(Deserialize)]
struct RecordPage {
    items: Vec<Request>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn records_url(&self) -> String {
        format!(
            "{}/api/collections/{}/records",
            self.base_url, REQUESTS_COLLECTION
        )
    }

    fn record_url(&self, id: &str) -> String {
        format!("{}/{}", self.records_url(), id)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn check(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
        id: Option<&str>,
    ) -> Result<reqwest::Response, StoreError> {
        let response = response.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(StoreError::AuthLost(response.status().to_string()))
            }
            StatusCode::NOT_FOUND => {
                Err(StoreError::NotFound(id.unwrap_or("<query>").to_string()))
            }
            status => Err(StoreError::Unavailable(format!(
                "unexpected status {status}"
            ))),
        }
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StoreError> {
        let filter_expr = format!(
            "kind='{}' && parent='{}' && offer!='' && answer='' && abort=false",
            filter.kind, filter.parent
        );
        let per_page = PAGE_SIZE.to_string();
        let response = self
            .request(self.client.get(self.records_url()))
            .query(&[
                ("filter", filter_expr.as_str()),
                ("perPage", per_page.as_str()),
            ])
            .send()
            .await;
        let page: RecordPage = self
            .check(response, None)?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(page.items)
    }

    async fn patch(&self, id: &str, body: serde_json::Value) -> Result<(), StoreError> {
        let response = self
            .request(self.client.patch(self.record_url(id)))
            .json(&body)
            .send()
            .await;
        self.check(response, Some(id))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RequestStore for HttpStore {
    async fn insert(&self, request: Request) -> Result<String, StoreError> {
        let response = self
            .request(self.client.post(self.records_url()))
            .json(&request)
            .send()
            .await;
        let created: Request = self
            .check(response, None)?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(created.id)
    }

    async fn get(&self, id: &str) -> Result<Request, StoreError> {
        let response = self.request(self.client.get(self.record_url(id))).send().await;
        self.check(response, Some(id))?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }

    async fn set_offer(&self, id: &str, offer: &str) -> Result<(), StoreError> {
        self.patch(id, json!({ "offer": offer })).await
    }

    async fn set_answer(&self, id: &str, answer: &str) -> Result<(), StoreError> {
        self.patch(id, json!({ "answer": answer })).await
    }

    async fn set_abort(&self, id: &str, abort: bool) -> Result<(), StoreError> {
        self.patch(id, json!({ "abort": abort })).await
    }

    fn changes(
        &self,
        filter: RequestFilter,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<DocChange, StoreError>> {
        let (tx, rx) = mpsc::channel(1);
        let store = self.clone();
        tokio::spawn(async move {
            let mut known: HashMap<String, Request> = HashMap::new();
            let mut ticker = tokio::time::interval(store.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let page = match store.list(&filter).await {
                    Ok(page) => page,
                    Err(err) => {
                        let fatal = err.is_fatal();
                        if forward(&tx, &cancel, Err(err)).await.is_err() || fatal {
                            return;
                        }
                        continue;
                    }
                };
                for request in page {
                    let change = match known.get(&request.id) {
                        None => DocChange::Added(request.clone()),
                        Some(previous) if previous.answer != request.answer
                            || previous.abort != request.abort
                            || previous.offer != request.offer =>
                        {
                            DocChange::Modified(request.clone())
                        }
                        Some(_) => continue,
                    };
                    known.insert(request.id.clone(), request);
                    if forward(&tx, &cancel, Ok(change)).await.is_err() {
                        return;
                    }
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
        let store = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut last: Option<Request> = None;
            let mut ticker = tokio::time::interval(store.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let item = match store.get(&id).await {
                    Ok(request) => {
                        let changed = last
                            .as_ref()
                            .map(|prev| {
                                prev.offer != request.offer
                                    || prev.answer != request.answer
                                    || prev.abort != request.abort
                            })
                            .unwrap_or(true);
                        if !changed {
                            continue;
                        }
                        last = Some(request.clone());
                        Ok(request)
                    }
                    // The document may not exist yet; keep polling.
                    Err(StoreError::NotFound(_)) => continue,
                    Err(err) => {
                        let fatal = err.is_fatal();
                        if forward(&tx, &cancel, Err(err)).await.is_err() || fatal {
                            return;
                        }
                        continue;
                    }
                };
                if forward(&tx, &cancel, item).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

async fn forward<T>(
    tx: &mpsc::Sender<T>,
    cancel: &CancellationToken,
    item: T,
) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        sent = tx.send(item) => sent.map_err(|_| ()),
    }
}
