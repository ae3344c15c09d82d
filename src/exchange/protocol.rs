//! Message schema and codec for the descriptor exchange.
//!
//! Requests and replies are a closed schema: an `IoSpec` enumeration with
//! typed payloads on the way in, a restricted `ResolveError` on the way
//! back. Neither side ever deserializes arbitrary structured data from a
//! peer.
//!
//! # Security
//! - Frame size limits prevent memory exhaustion; checked before parsing.
//! - The error payload is string-only, so a failure reply can always be
//!   encoded; a textual fallback path covers the residual case anyway.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound for an encoded frame, either direction.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Smallest frame limit the configuration accepts.
pub const MIN_FRAME_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Specification of the I/O resource a client wants opened on its behalf.
///
/// The business meaning belongs to the injected resolver; this enum only
/// fixes the set of shapes that may cross the wire. `Named` is the escape
/// hatch for resolver-defined resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IoSpec {
    /// A TCP listening socket bound to `addr`.
    #[serde(rename = "listen_tcp")]
    ListenTcp { addr: String },

    /// A UDP socket bound to `addr`.
    #[serde(rename = "bind_udp")]
    BindUdp { addr: String },

    /// An opened file.
    #[serde(rename = "open_file")]
    OpenFile { path: String, append: bool },

    /// A resolver-defined resource identified by name.
    #[serde(rename = "named")]
    Named { name: String },
}

impl IoSpec {
    /// Shorthand for a named resource specification.
    pub fn named(name: impl Into<String>) -> Self {
        IoSpec::Named { name: name.into() }
    }
}

/// Failure produced by a resolver; the one error kind that crosses the
/// wire. String payloads only, so every variant is encodable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail")]
pub enum ResolveError {
    #[error("unsupported specification: {0}")]
    #[serde(rename = "unsupported")]
    Unsupported(String),

    #[error("resource denied: {0}")]
    #[serde(rename = "denied")]
    Denied(String),

    #[error("i/o failure: {0}")]
    #[serde(rename = "io")]
    Io(String),

    #[error("malformed request: {0}")]
    #[serde(rename = "malformed")]
    Malformed(String),

    #[error("{0}")]
    #[serde(rename = "other")]
    Other(String),
}

impl ResolveError {
    /// Capture an `io::Error` as its textual description.
    pub fn io(err: &std::io::Error) -> Self {
        ResolveError::Io(err.to_string())
    }
}

/// Reply to a single request. A `Success` frame is always followed by the
/// out-of-band descriptor transfer on the same connection; a `Failure`
/// frame stands alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum ExchangeReply {
    #[serde(rename = "ok")]
    Success,

    #[serde(rename = "err")]
    Failure { error: ResolveError },
}

/// Encode a request with size limit enforcement.
pub fn encode_request(spec: &IoSpec, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(spec)?;
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// Decode a request. Size is checked before parsing.
pub fn decode_request(bytes: &[u8], max: usize) -> Result<IoSpec, ProtocolError> {
    check_size(bytes.len(), max)?;
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a reply with size limit enforcement.
///
/// If the reply itself cannot be encoded, a failure carrying the error's
/// textual description is encoded instead, so the peer always receives a
/// decodable frame.
pub fn encode_reply(reply: &ExchangeReply, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let bytes = match serde_json::to_vec(reply) {
        Ok(bytes) => bytes,
        Err(err) => {
            let fallback = ExchangeReply::Failure {
                error: ResolveError::Other(fallback_text(reply, &err)),
            };
            serde_json::to_vec(&fallback)?
        }
    };
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// Decode a reply. Size is checked before parsing.
pub fn decode_reply(bytes: &[u8], max: usize) -> Result<ExchangeReply, ProtocolError> {
    check_size(bytes.len(), max)?;
    Ok(serde_json::from_slice(bytes)?)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::FrameTooLarge { size, max });
    }
    Ok(())
}

fn fallback_text(reply: &ExchangeReply, err: &serde_json::Error) -> String {
    match reply {
        ExchangeReply::Failure { error } => error.to_string(),
        ExchangeReply::Success => format!("reply encoding failed: {err}"),
    }
}
