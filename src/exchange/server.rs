//! The exchange server and its dispatch loop.
//!
//! One background thread multiplexes every registered server-side
//! connection half with `poll(2)`, bounded by the configured interval so
//! shutdown latency stays tunable and an idle server costs nothing beyond
//! one wakeup per interval. Resolution runs serially on the loop thread;
//! a hanging resolver stalls all connections until it returns.
//!
//! Caller threads only ever append to the connection registry
//! (`new_connection`), the loop thread only ever removes; the narrow
//! mutex guards the append-while-iterate pattern between the two.

use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::counter;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use thiserror::Error;

use super::connection::{CloexecPolicy, ConnectionPair};
use super::health::{LoopHealth, LoopHealthReport};
use super::protocol::{
    decode_request, encode_reply, ExchangeReply, ResolveError, DEFAULT_MAX_FRAME_SIZE,
};
use super::resolver::Resolver;
use super::wire::{self, errno_to_io, WireError};
use crate::shutdown::ShutdownFlag;

/// Default bound on idle and readiness waits in the dispatch loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("dispatch loop already started")]
    AlreadyStarted,

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables fixed at server construction.
#[derive(Debug, Clone)]
pub struct ExchangeServerConfig {
    /// Upper bound on the loop's idle wait and readiness poll. Also
    /// bounds how long `stop()` takes to be observed.
    pub poll_interval: Duration,
    /// Maximum encoded frame size accepted or produced.
    pub max_frame_size: usize,
    /// Close-on-exec policy applied to every new connection pair.
    pub cloexec: CloexecPolicy,
}

impl Default for ExchangeServerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            cloexec: CloexecPolicy::default(),
        }
    }
}

struct Shared {
    config: ExchangeServerConfig,
    shutdown: ShutdownFlag,
    connections: Mutex<Vec<Arc<UnixStream>>>,
    resolver: Box<dyn Resolver>,
    health: LoopHealth,
}

/// Hands out connection pairs and services requests over them.
pub struct ExchangeServer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    started: bool,
}

impl ExchangeServer {
    /// Create a server with the given configuration and resolver
    /// capability. The loop does not run until `start()`.
    pub fn new(config: ExchangeServerConfig, resolver: impl Resolver + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                shutdown: ShutdownFlag::new(),
                connections: Mutex::new(Vec::new()),
                resolver: Box::new(resolver),
                health: LoopHealth::new(),
            }),
            thread: None,
            started: false,
        }
    }

    /// Spawn the background dispatch loop. Starting twice is a misuse
    /// and reported as `AlreadyStarted`; a second thread is never spawned.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("fd-exchange-dispatch".into())
            .spawn(move || dispatch_loop(shared))?;
        self.thread = Some(handle);
        self.started = true;
        Ok(())
    }

    /// Request the loop to stop. Returns immediately; the loop exits
    /// within one polling interval. Idempotent.
    pub fn stop(&self) {
        self.shared.shutdown.set();
    }

    /// `stop()`, then best-effort close every registered server-side
    /// half. Close failures are ignored; a peer blocked in `open_io`
    /// observes end-of-stream instead of hanging.
    pub fn shutdown(&self) {
        self.stop();
        let mut connections = self.shared.connections.lock();
        for conn in connections.iter() {
            let _ = conn.shutdown(Shutdown::Both);
        }
        connections.clear();
    }

    /// Block until the dispatch loop has exited. Idempotent; returns
    /// immediately once already joined or never started.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Create a fresh connection pair, register the server half, and
    /// return the client half. Safe to call while the loop is running;
    /// the loop observes the new half within one polling cycle.
    pub fn new_connection(&self) -> Result<UnixStream, ServerError> {
        if self.shared.shutdown.is_set() {
            return Err(ServerError::ShuttingDown);
        }
        let pair = ConnectionPair::create(self.shared.config.cloexec)?;
        self.shared.connections.lock().push(Arc::new(pair.server));
        Ok(pair.client)
    }

    /// Snapshot the loop's health counters.
    pub fn health(&self) -> LoopHealthReport {
        let alive = self
            .thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        let registered = self.shared.connections.lock().len();
        self.shared.health.report(alive, registered)
    }

    /// Number of server-side halves currently registered.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }
}

impl Drop for ExchangeServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    tracing::debug!("dispatch loop started");
    let interval = shared.config.poll_interval;

    while !shared.shutdown.is_set() {
        shared.health.record_iteration();

        let snapshot: Vec<Arc<UnixStream>> = shared.connections.lock().clone();
        if snapshot.is_empty() {
            shared.shutdown.wait(interval);
            continue;
        }

        let ready = match poll_ready(&snapshot, interval) {
            Ok(ready) => ready,
            Err(err) => {
                tracing::error!(error = %err, "readiness poll failed");
                shared.health.record_dispatch_error(&err.to_string());
                counter!("exchange_dispatch_errors_total").increment(1);
                shared.shutdown.wait(interval);
                continue;
            }
        };

        for index in ready {
            service_connection(&shared, &snapshot[index]);
        }
    }

    tracing::debug!("dispatch loop exited");
}

/// Wait up to `timeout` for any connection to become readable; returns
/// the indexes of the ready ones. Hangups and errors count as ready so
/// the read path can classify them.
fn poll_ready(
    connections: &[Arc<UnixStream>],
    timeout: Duration,
) -> std::io::Result<Vec<usize>> {
    let mut fds: Vec<PollFd<'_>> = connections
        .iter()
        .map(|conn| PollFd::new(conn.as_fd(), PollFlags::POLLIN))
        .collect();

    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    loop {
        match poll(&mut fds, millis) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(errno_to_io(err)),
        }
    }

    let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(fds
        .iter()
        .enumerate()
        .filter(|(_, fd)| {
            fd.revents()
                .is_some_and(|revents| revents.intersects(wanted))
        })
        .map(|(index, _)| index)
        .collect())
}

fn service_connection(shared: &Shared, conn: &Arc<UnixStream>) {
    let max = shared.config.max_frame_size;
    let drain = shared.config.poll_interval;

    match wire::try_recv_frame(conn, max, drain) {
        // Spurious readiness or would-block; retried on a later pass.
        Ok(None) => {}
        Ok(Some(bytes)) => handle_request(shared, conn, &bytes),
        Err(WireError::Closed) => {
            tracing::debug!("peer closed connection");
            remove_connection(shared, conn);
            shared.health.record_connection_closed();
            counter!("exchange_connections_closed_total").increment(1);
        }
        Err(err) => {
            // Unclassified read failure: contained at the loop boundary,
            // the offending connection is dropped.
            tracing::error!(error = %err, "failed reading request; dropping connection");
            shared.health.record_dispatch_error(&err.to_string());
            counter!("exchange_dispatch_errors_total").increment(1);
            remove_connection(shared, conn);
        }
    }
}

fn handle_request(shared: &Shared, conn: &Arc<UnixStream>, bytes: &[u8]) {
    let spec = match decode_request(bytes, shared.config.max_frame_size) {
        Ok(spec) => spec,
        Err(err) => {
            // Outside the closed schema. The loop survives, and the peer
            // gets a failure reply rather than being left waiting.
            tracing::error!(error = %err, "malformed request");
            shared.health.record_dispatch_error(&err.to_string());
            counter!("exchange_dispatch_errors_total").increment(1);
            let reply = ExchangeReply::Failure {
                error: ResolveError::Malformed(err.to_string()),
            };
            deliver_reply(shared, conn, &reply);
            return;
        }
    };

    tracing::debug!(spec = ?spec, "resolving request");
    match shared.resolver.resolve(&spec) {
        Ok(fd) => {
            if !deliver_reply(shared, conn, &ExchangeReply::Success) {
                return;
            }
            match wire::send_fd(conn, fd.as_fd(), shared.config.poll_interval) {
                Ok(()) => {
                    shared.health.record_request_served();
                    counter!("exchange_requests_served_total").increment(1);
                }
                Err(WireError::Closed) => {
                    tracing::debug!("peer vanished before descriptor transfer");
                    remove_connection(shared, conn);
                    shared.health.record_connection_closed();
                }
                Err(err) => {
                    tracing::error!(error = %err, "descriptor transfer failed");
                    shared.health.record_dispatch_error(&err.to_string());
                    counter!("exchange_dispatch_errors_total").increment(1);
                    remove_connection(shared, conn);
                }
            }
            // The server's copy of the descriptor closes here; the peer
            // holds its own duplicate.
        }
        Err(error) => {
            tracing::debug!(error = %error, "resolver rejected request");
            shared.health.record_resolver_failure();
            counter!("exchange_resolver_failures_total").increment(1);
            deliver_reply(shared, conn, &ExchangeReply::Failure { error });
        }
    }
}

/// Encode and send one reply frame. Returns `false` if the connection
/// had to be dropped.
fn deliver_reply(shared: &Shared, conn: &Arc<UnixStream>, reply: &ExchangeReply) -> bool {
    let encoded = match encode_reply(reply, shared.config.max_frame_size) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::error!(error = %err, "reply encoding failed");
            shared.health.record_dispatch_error(&err.to_string());
            counter!("exchange_dispatch_errors_total").increment(1);
            return false;
        }
    };

    match wire::send_frame(conn, &encoded, shared.config.poll_interval) {
        Ok(()) => true,
        Err(WireError::Closed) => {
            tracing::debug!("peer closed connection before reply");
            remove_connection(shared, conn);
            shared.health.record_connection_closed();
            counter!("exchange_connections_closed_total").increment(1);
            false
        }
        Err(err) => {
            tracing::error!(error = %err, "reply send failed; dropping connection");
            shared.health.record_dispatch_error(&err.to_string());
            counter!("exchange_dispatch_errors_total").increment(1);
            remove_connection(shared, conn);
            false
        }
    }
}

fn remove_connection(shared: &Shared, conn: &Arc<UnixStream>) {
    shared
        .connections
        .lock()
        .retain(|candidate| !Arc::ptr_eq(candidate, conn));
}
