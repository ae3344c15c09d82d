//! Descriptor exchange over local socket pairs.
//!
//! A long-lived server hands out connection halves, runs one background
//! dispatch loop over the halves it keeps, and answers each request by
//! either transferring a freshly resolved descriptor out-of-band or
//! replying with a serialized error. Connections are strictly local; who
//! may connect is decided by whoever distributes the client halves, not
//! by this protocol.

mod client;
mod connection;
mod health;
mod protocol;
mod resolver;
mod server;
mod wire;

pub use client::{ClientError, ExchangeClient};
pub use connection::{CloexecPolicy, ConnectionPair};
pub use health::{LoopHealth, LoopHealthReport, LoopState};
pub use protocol::{
    ExchangeReply, IoSpec, ProtocolError, ResolveError, DEFAULT_MAX_FRAME_SIZE, MIN_FRAME_SIZE,
};
pub use resolver::Resolver;
pub use server::{ExchangeServer, ExchangeServerConfig, ServerError, DEFAULT_POLL_INTERVAL};
pub use wire::WireError;
