//! SDP envelope: `base64(utf8(json({"type": ..., "sdp": ...})))`.
//!
//! The JSON shape matches what a browser produces when serializing an
//! `RTCSessionDescription`, so clients can write `btoa(JSON.stringify(desc))`
//! verbatim into a request document.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid base64 envelope: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid session description JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A session description as carried through request documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn is_answer(&self) -> bool {
        self.kind == "answer"
    }
}

/// Encode a description into the wire envelope.
pub fn encode_description(desc: &SessionDescription) -> String {
    // A two-string struct always serializes.
    let json = serde_json::to_vec(desc).expect("session description serializes");
    BASE64.encode(json)
}

/// Decode the wire envelope back into a description.
pub fn decode_description(value: &str) -> Result<SessionDescription, SignalError> {
    let bytes = BASE64.decode(value.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_identity() {
        let desc = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n");
        let decoded = decode_description(&encode_description(&desc)).unwrap();
        assert_eq!(decoded, desc);
    }

    #[test]
    fn envelope_uses_browser_field_names() {
        let desc = SessionDescription::answer("v=0\r\n");
        let json: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(encode_description(&desc)).unwrap()).unwrap();
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0\r\n");
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            decode_description("not-base64!!!"),
            Err(SignalError::Base64(_))
        ));
    }

    #[test]
    fn rejects_invalid_json_payload() {
        let garbage = BASE64.encode(b"{\"type\":");
        assert!(matches!(
            decode_description(&garbage),
            Err(SignalError::Json(_))
        ));
    }
}
