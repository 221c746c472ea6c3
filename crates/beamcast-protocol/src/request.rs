use serde::{Deserialize, Serialize};

/// Document store collection holding signaling requests.
pub const REQUESTS_COLLECTION: &str = "broadcast_requests";

/// Bus topic carrying ids of new broadcaster requests.
pub const BROADCASTS_TOPIC: &str = "broadcasts";

/// Bus subscription the broadcast workers pull from.
pub const BROADCASTS_SUBSCRIPTION: &str = "broadcasts-sub";

/// Role of the client that created a request document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Broadcaster,
    Participant,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Broadcaster => "broadcaster",
            RequestKind::Participant => "participant",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling record in the `broadcast_requests` collection.
///
/// A request is append-only until the server writes `answer`; after the
/// offer is set, only `answer` (server-side) and `abort` (client-side) may
/// change. `parent` is empty exactly when `kind` is `broadcaster`; for
/// participants it carries the owning broadcaster's request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Document identity, assigned by the store.
    #[serde(default)]
    pub id: String,
    pub kind: RequestKind,
    #[serde(default)]
    pub parent: String,
    /// Opaque client identity, informational only.
    #[serde(default)]
    pub requestor: String,
    /// Base64(JSON(SessionDescription)) written by the client.
    #[serde(default)]
    pub offer: String,
    /// Base64(JSON(SessionDescription)) written by the server.
    #[serde(default)]
    pub answer: String,
    /// Client-settable termination signal.
    #[serde(default)]
    pub abort: bool,
}

impl Request {
    /// New broadcaster request carrying an encoded offer.
    pub fn broadcaster(requestor: impl Into<String>, offer: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: RequestKind::Broadcaster,
            parent: String::new(),
            requestor: requestor.into(),
            offer: offer.into(),
            answer: String::new(),
            abort: false,
        }
    }

    /// New participant request under `parent`, carrying an encoded offer.
    pub fn participant(
        parent: impl Into<String>,
        requestor: impl Into<String>,
        offer: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            kind: RequestKind::Participant,
            parent: parent.into(),
            requestor: requestor.into(),
            offer: offer.into(),
            answer: String::new(),
            abort: false,
        }
    }

    /// Whether the server should pick this request up: the client has
    /// published an offer, nothing has answered it, and it is not aborted.
    pub fn is_ready(&self) -> bool {
        !self.offer.is_empty() && self.answer.is_empty() && !self.abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RequestKind::Broadcaster).unwrap(),
            "\"broadcaster\""
        );
        assert_eq!(
            serde_json::from_str::<RequestKind>("\"participant\"").unwrap(),
            RequestKind::Participant
        );
    }

    #[test]
    fn readiness_requires_offer_without_answer_or_abort() {
        let mut req = Request::broadcaster("alice", "");
        assert!(!req.is_ready());

        req.offer = "b64".into();
        assert!(req.is_ready());

        req.answer = "b64".into();
        assert!(!req.is_ready());

        req.answer.clear();
        req.abort = true;
        assert!(!req.is_ready());
    }

    #[test]
    fn missing_fields_default_when_deserializing() {
        let req: Request = serde_json::from_str(r#"{"kind":"broadcaster"}"#).unwrap();
        assert!(req.id.is_empty());
        assert!(req.offer.is_empty());
        assert!(!req.abort);
    }
}
