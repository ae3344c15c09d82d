//! fd-exchange
//!
//! A descriptor-handoff service for cooperating local processes. A
//! privileged long-lived process runs an [`exchange::ExchangeServer`];
//! other processes hold client halves of socket pairs it created and use
//! an [`exchange::ExchangeClient`] to ask for OS-level I/O resources (a
//! bound listening socket, an opened file) to be created on their behalf.
//! The resulting open descriptor comes back over the same connection as
//! `SCM_RIGHTS` out-of-band data; failures come back as serialized,
//! typed errors.
//!
//! What a request actually opens is decided by the
//! [`exchange::Resolver`] capability injected at server construction.
//! Access control is a property of how connection halves are
//! distributed, not of this protocol; connections are strictly
//! process-to-process, never network-facing.

#[cfg(unix)]
pub mod config;
#[cfg(unix)]
pub mod exchange;
pub mod shutdown;
pub mod telemetry;

#[cfg(unix)]
pub use exchange::{
    ClientError, CloexecPolicy, ExchangeClient, ExchangeServer, ExchangeServerConfig, IoSpec,
    ResolveError, Resolver, ServerError,
};
pub use shutdown::ShutdownFlag;
