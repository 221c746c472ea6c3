//! Shared signaling contract between beamcast roles and their clients.
//!
//! Everything clients and server agree on lives here: the request document
//! schema stored in the `broadcast_requests` collection, the names of the
//! store collection and bus topic, and the base64+JSON envelope used to
//! carry SDP through request documents.

pub mod request;
pub mod wire;

pub use request::{Request, RequestKind};
pub use wire::{decode_description, encode_description, SessionDescription, SignalError};
