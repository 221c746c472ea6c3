//! Exactly-once request watching and offer-wait on top of a store backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamcast_protocol::{decode_description, Request, SessionDescription};

use crate::error::{ErrorSink, SessionError};

use super::{DocChange, RequestFilter, RequestStore, StoreError};

/// Watches the store for requests matching `filter` and yields each
/// matching document exactly once per watcher lifetime: only `Added`
/// transitions pass through, and the backends emit `Added` at most once
/// per document per feed, so later mutations of an emitted document (an
/// answer written, an abort flagged) never re-emit it. The channel is
/// bounded at one element: a stalled consumer stalls the feed instead of
/// buffering.
///
/// The sequence ends on cancellation or on a fatal store error; transient
/// errors go to the error stream and the watch continues.
pub fn watch(
    store: Arc<dyn RequestStore>,
    filter: RequestFilter,
    errors: ErrorSink,
    cancel: CancellationToken,
) -> mpsc::Receiver<Request> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut feed = store.changes(filter, cancel.clone());
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = feed.recv() => item,
            };
            let Some(item) = item else { return };
            match item {
                Ok(DocChange::Added(request)) => {
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(request) => sent,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
                Ok(DocChange::Modified(_)) => {}
                Err(err) if err.is_fatal() => {
                    errors.report("watcher", None, false, err).await;
                    return;
                }
                Err(err) => errors.report("watcher", None, true, err).await,
            }
        }
    });
    rx
}

/// Observes one request document until its offer becomes non-empty, then
/// decodes the wire envelope. Decode failure is a hard error for the
/// session. Bounded by `timeout` in addition to scope cancellation.
pub async fn wait_for_offer(
    store: Arc<dyn RequestStore>,
    request_id: &str,
    timeout: Duration,
    errors: &ErrorSink,
    cancel: &CancellationToken,
) -> Result<SessionDescription, SessionError> {
    let mut feed = store.document(request_id, cancel.clone());
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = &mut deadline => return Err(SessionError::OfferTimeout(timeout)),
            item = feed.recv() => item,
        };
        let Some(item) = item else {
            return Err(SessionError::Store(StoreError::FeedClosed));
        };
        match item {
            Ok(request) if request.offer.is_empty() => continue,
            Ok(request) => return Ok(decode_description(&request.offer)?),
            Err(err) if err.is_fatal() => return Err(SessionError::Store(err)),
            Err(err) => errors.report("offer-wait", Some(request_id), true, err).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use beamcast_protocol::encode_description;

    fn harness() -> (Arc<dyn RequestStore>, MemoryStore, ErrorSink, CancellationToken) {
        let store = MemoryStore::new();
        let (errors, rx) = ErrorSink::channel(16);
        // Tests do not assert on the error stream here; keep it drained.
        drop(rx);
        (
            Arc::new(store.clone()) as Arc<dyn RequestStore>,
            store,
            errors,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn emits_each_matching_request_exactly_once() {
        let (store, raw, errors, cancel) = harness();
        let mut requests = watch(
            store.clone(),
            RequestFilter::broadcasters(),
            errors,
            cancel.clone(),
        );

        let id = raw
            .insert(Request::broadcaster("alice", "b64"))
            .await
            .unwrap();
        assert_eq!(requests.recv().await.unwrap().id, id);

        // Writing the answer mutates the document but must not re-emit it.
        raw.set_answer(&id, "b64-answer").await.unwrap();
        let second = raw
            .insert(Request::broadcaster("bob", "b64"))
            .await
            .unwrap();
        assert_eq!(requests.recv().await.unwrap().id, second);
        cancel.cancel();
    }

    #[tokio::test]
    async fn filters_by_kind_and_parent() {
        let (store, raw, errors, cancel) = harness();
        let mut participants = watch(
            store.clone(),
            RequestFilter::participants("b1"),
            errors,
            cancel.clone(),
        );

        raw.insert(Request::broadcaster("alice", "b64")).await.unwrap();
        raw.insert(Request::participant("other", "carol", "b64"))
            .await
            .unwrap();
        let id = raw
            .insert(Request::participant("b1", "dave", "b64"))
            .await
            .unwrap();

        assert_eq!(requests_next(&mut participants).await.id, id);
        cancel.cancel();
    }

    async fn requests_next(rx: &mut mpsc::Receiver<Request>) -> Request {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch emitted nothing")
            .expect("watch ended")
    }

    #[tokio::test]
    async fn wait_for_offer_resolves_once_offer_is_written() {
        let (store, raw, errors, cancel) = harness();
        let desc = SessionDescription::offer("v=0\r\n");

        // Insert without an offer; publish it shortly after.
        let id = raw
            .insert(Request::broadcaster("alice", ""))
            .await
            .unwrap();
        {
            let raw = raw.clone();
            let id = id.clone();
            let encoded = encode_description(&desc);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                raw.set_offer(&id, &encoded).await.unwrap();
            });
        }

        let offer = wait_for_offer(store, &id, Duration::from_secs(5), &errors, &cancel)
            .await
            .unwrap();
        assert_eq!(offer, desc);
    }

    #[tokio::test]
    async fn wait_for_offer_times_out() {
        let (store, raw, errors, cancel) = harness();
        let id = raw
            .insert(Request::broadcaster("alice", ""))
            .await
            .unwrap();
        let result =
            wait_for_offer(store, &id, Duration::from_millis(100), &errors, &cancel).await;
        assert!(matches!(result, Err(SessionError::OfferTimeout(_))));
    }

    #[tokio::test]
    async fn wait_for_offer_honors_cancellation() {
        let (store, raw, errors, cancel) = harness();
        let id = raw
            .insert(Request::broadcaster("alice", ""))
            .await
            .unwrap();
        cancel.cancel();
        let result =
            wait_for_offer(store, &id, Duration::from_secs(5), &errors, &cancel).await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn malformed_offer_is_a_hard_error() {
        let (store, raw, errors, cancel) = harness();
        let id = raw
            .insert(Request::broadcaster("alice", "not-base64!!!"))
            .await
            .unwrap();
        let result =
            wait_for_offer(store, &id, Duration::from_secs(5), &errors, &cancel).await;
        assert!(matches!(result, Err(SessionError::Signal(_))));
    }
}
