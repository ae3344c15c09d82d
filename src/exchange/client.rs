//! Synchronous client side of the descriptor exchange.
//!
//! Wraps one client-side connection half. Each `open_io` call writes a
//! single request and blocks the calling thread for exactly one reply;
//! requests never pipeline on a connection. There is no per-request
//! timeout; a caller wanting bounded latency applies its own around
//! `open_io`.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use thiserror::Error;

use super::protocol::{
    decode_reply, encode_request, ExchangeReply, IoSpec, ProtocolError, ResolveError,
    DEFAULT_MAX_FRAME_SIZE,
};
use super::wire::{self, WireError};

// Bound on flushing a request into the socket buffer; requests are tiny,
// so hitting this means the server side is gone or wedged.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("exchange failed: {0}")]
    Resolve(ResolveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Closed => ClientError::ConnectionClosed,
            WireError::Io(io) => ClientError::Io(io),
            other => ClientError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Issues synchronous resource requests over one connection half.
pub struct ExchangeClient {
    connection: Option<UnixStream>,
    max_frame_size: usize,
}

impl ExchangeClient {
    /// Wrap a client-side connection half obtained from
    /// `ExchangeServer::new_connection`.
    pub fn new(connection: UnixStream) -> Self {
        Self {
            connection: Some(connection),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Override the frame size bound; must match the server's setting.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Request that the resource described by `spec` be opened on our
    /// behalf, and block until the descriptor (or the resolver's error)
    /// comes back.
    pub fn open_io(&mut self, spec: &IoSpec) -> Result<OwnedFd, ClientError> {
        let conn = self
            .connection
            .as_ref()
            .ok_or(ClientError::ConnectionClosed)?;

        let request = encode_request(spec, self.max_frame_size)?;
        wire::send_frame(conn, &request, SEND_TIMEOUT)?;

        let reply_bytes = wire::recv_frame(conn, self.max_frame_size)?;
        match decode_reply(&reply_bytes, self.max_frame_size)? {
            ExchangeReply::Success => Ok(wire::recv_fd(conn)?),
            ExchangeReply::Failure { error } => Err(ClientError::Resolve(error)),
        }
    }

    /// Release the underlying connection half. Subsequent `open_io`
    /// calls fail with `ConnectionClosed` instead of hanging.
    pub fn close(&mut self) {
        self.connection = None;
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }
}
