//! Socket-pair creation and close-on-exec policy.
//!
//! Every exchange connection starts life as a `UnixStream` pair. The
//! server keeps one half (switched to non-blocking so the dispatch loop
//! never blocks on a single peer) and the other half is handed to the
//! requesting component. Which halves are marked close-on-exec is decided
//! once, at server construction, by a `CloexecPolicy`.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::str::FromStr;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use serde::{Deserialize, Serialize};

use super::wire::errno_to_io;

/// Which halves of a new connection pair are marked close-on-exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloexecPolicy {
    /// Neither half; both descriptors are inherited across exec.
    #[default]
    None,
    /// Only the half handed out to the requesting component.
    Client,
    /// Only the half retained by the server.
    Server,
    /// Both halves.
    Both,
}

impl CloexecPolicy {
    fn applies_to_server(self) -> bool {
        matches!(self, CloexecPolicy::Server | CloexecPolicy::Both)
    }

    fn applies_to_client(self) -> bool {
        matches!(self, CloexecPolicy::Client | CloexecPolicy::Both)
    }
}

impl FromStr for CloexecPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CloexecPolicy::None),
            "client" => Ok(CloexecPolicy::Client),
            "server" => Ok(CloexecPolicy::Server),
            "both" => Ok(CloexecPolicy::Both),
            other => Err(format!("unknown cloexec policy: {other}")),
        }
    }
}

/// A freshly created connection pair with the policy already applied.
#[derive(Debug)]
pub struct ConnectionPair {
    /// Non-blocking half retained by the server's registry.
    pub server: UnixStream,
    /// Blocking half handed to the requesting component.
    pub client: UnixStream,
}

impl ConnectionPair {
    /// Create a pair and apply `policy` to both halves.
    ///
    /// The flag is set or cleared explicitly on each half, so the result
    /// does not depend on what the platform's socketpair defaults to.
    pub fn create(policy: CloexecPolicy) -> std::io::Result<Self> {
        let (server, client) = UnixStream::pair()?;
        server.set_nonblocking(true)?;
        set_cloexec(server.as_fd(), policy.applies_to_server())?;
        set_cloexec(client.as_fd(), policy.applies_to_client())?;
        Ok(Self { server, client })
    }
}

fn set_cloexec(fd: BorrowedFd<'_>, enable: bool) -> std::io::Result<()> {
    let current = fcntl(fd, FcntlArg::F_GETFD).map_err(errno_to_io)?;
    let mut flags = FdFlag::from_bits_retain(current);
    flags.set(FdFlag::FD_CLOEXEC, enable);
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(errno_to_io)?;
    Ok(())
}
