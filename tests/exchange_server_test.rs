#![cfg(unix)]
//! End-to-end tests for the exchange server and client.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fd_exchange::exchange::{
    ClientError, ExchangeClient, ExchangeServer, ExchangeServerConfig, IoSpec, LoopState,
    ResolveError, Resolver, ServerError,
};

/// Resolver used across these tests: `echo` yields one half of a fresh
/// loopback pair (the other half is kept so the test can speak through
/// it); anything else is refused.
struct EchoResolver {
    peers: Arc<Mutex<Vec<UnixStream>>>,
}

impl Resolver for EchoResolver {
    fn resolve(&self, spec: &IoSpec) -> Result<OwnedFd, ResolveError> {
        match spec {
            IoSpec::Named { name } if name == "echo" => {
                let (give, keep) = UnixStream::pair().map_err(|e| ResolveError::io(&e))?;
                self.peers.lock().unwrap().push(keep);
                Ok(give.into())
            }
            IoSpec::Named { name } => Err(ResolveError::Unsupported(name.clone())),
            other => Err(ResolveError::Unsupported(format!("{other:?}"))),
        }
    }
}

fn test_config() -> ExchangeServerConfig {
    ExchangeServerConfig {
        poll_interval: Duration::from_millis(50),
        ..ExchangeServerConfig::default()
    }
}

fn echo_server() -> (ExchangeServer, Arc<Mutex<Vec<UnixStream>>>) {
    let peers = Arc::new(Mutex::new(Vec::new()));
    let server = ExchangeServer::new(
        test_config(),
        EchoResolver {
            peers: peers.clone(),
        },
    );
    (server, peers)
}

#[test]
fn test_echo_request_transfers_live_descriptor() {
    let (mut server, peers) = echo_server();
    server.start().unwrap();

    let half = server.new_connection().unwrap();
    let mut client = ExchangeClient::new(half);
    let fd = client.open_io(&IoSpec::named("echo")).unwrap();

    // A byte written on the server-held peer must be readable through
    // the transferred descriptor.
    let mut handle = UnixStream::from(fd);
    {
        let peers = peers.lock().unwrap();
        (&peers[0]).write_all(b"hello").unwrap();
    }
    let mut buf = [0u8; 5];
    handle.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    // And the other direction works too.
    handle.write_all(b"back").unwrap();
    let mut buf = [0u8; 4];
    {
        let peers = peers.lock().unwrap();
        (&peers[0]).read_exact(&mut buf).unwrap();
    }
    assert_eq!(&buf, b"back");
}

#[test]
fn test_bogus_request_surfaces_resolver_error() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let mut client = ExchangeClient::new(server.new_connection().unwrap());
    let err = client.open_io(&IoSpec::named("bogus")).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Resolve(ResolveError::Unsupported(ref name)) if name == "bogus"
    ));
}

#[test]
fn test_sequential_requests_alternate_on_one_connection() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let mut client = ExchangeClient::new(server.new_connection().unwrap());
    assert!(client.open_io(&IoSpec::named("echo")).is_ok());
    assert!(client.open_io(&IoSpec::named("nope")).is_err());
    assert!(client.open_io(&IoSpec::named("echo")).is_ok());
}

#[test]
fn test_stop_is_idempotent_and_join_is_prompt() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    server.stop();
    server.stop();
    server.stop();

    let start = Instant::now();
    server.join();
    // One polling interval plus scheduling slack.
    assert!(start.elapsed() < Duration::from_secs(1));

    // Joining again returns immediately.
    server.join();
}

#[test]
fn test_idle_server_iterates_at_most_once_per_interval() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    thread::sleep(Duration::from_millis(300));
    let report = server.health();
    assert_eq!(report.state, LoopState::Running);
    // 300ms of idling at a 50ms wait bound allows ~6 wakeups; anything
    // wildly above that means the loop is spinning.
    assert!(report.iterations <= 12, "loop spun: {}", report.iterations);
}

#[test]
fn test_concurrent_connections_are_all_serviced() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();
    let server = Arc::new(server);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            thread::spawn(move || {
                let half = server.new_connection().unwrap();
                let mut client = ExchangeClient::new(half);
                client.open_io(&IoSpec::named("echo")).unwrap()
            })
        })
        .collect();

    for worker in workers {
        let fd = worker.join().unwrap();
        // Each caller got its own functional descriptor.
        drop(UnixStream::from(fd));
    }
}

#[test]
fn test_shutdown_closes_halves_and_unblocks_clients() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let half_a = server.new_connection().unwrap();
    let half_b = server.new_connection().unwrap();

    server.shutdown();

    let start = Instant::now();
    server.join();
    assert!(start.elapsed() < Duration::from_secs(1));

    for half in [half_a, half_b] {
        let mut client = ExchangeClient::new(half);
        let err = client.open_io(&IoSpec::named("echo")).unwrap_err();
        assert!(
            matches!(err, ClientError::ConnectionClosed),
            "expected ConnectionClosed, got {err:?}"
        );
    }
}

#[test]
fn test_new_connection_refused_after_shutdown() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();
    server.shutdown();
    assert!(matches!(
        server.new_connection(),
        Err(ServerError::ShuttingDown)
    ));
}

#[test]
fn test_malformed_request_gets_failure_reply_and_loop_survives() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let half = server.new_connection().unwrap();

    // Hand-roll a frame whose payload is not part of the schema.
    write_raw_frame(&half, b"{\"type\":\"nonsense\"}");
    let reply: serde_json::Value = serde_json::from_slice(&read_raw_frame(&half)).unwrap();
    assert_eq!(reply["status"], "err");
    assert_eq!(reply["error"]["kind"], "malformed");

    // The loop is degraded but alive: a valid request on the same
    // connection still gets serviced.
    let mut client = ExchangeClient::new(half);
    assert!(client.open_io(&IoSpec::named("echo")).is_ok());

    let report = server.health();
    assert_eq!(report.state, LoopState::Degraded);
    assert!(report.dispatch_errors >= 1);
    assert!(report.last_error.is_some());
}

#[test]
fn test_health_counts_served_and_failed_requests() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let mut client = ExchangeClient::new(server.new_connection().unwrap());
    client.open_io(&IoSpec::named("echo")).unwrap();
    client.open_io(&IoSpec::named("bogus")).unwrap_err();

    let report = server.health();
    assert_eq!(report.state, LoopState::Running);
    assert_eq!(report.requests_served, 1);
    assert_eq!(report.resolver_failures, 1);
}

#[test]
fn test_dropped_client_half_is_deregistered() {
    let (mut server, _peers) = echo_server();
    server.start().unwrap();

    let half = server.new_connection().unwrap();
    assert_eq!(server.connection_count(), 1);
    drop(half);

    // The loop notices the EOF within a polling cycle or two.
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.connection_count() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(server.connection_count(), 0);
    assert!(server.health().connections_closed >= 1);
}

fn write_raw_frame(stream: &UnixStream, payload: &[u8]) {
    let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(payload);
    (&*stream).write_all(&buf).unwrap();
}

fn read_raw_frame(stream: &UnixStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    (&*stream).read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    (&*stream).read_exact(&mut payload).unwrap();
    payload
}
