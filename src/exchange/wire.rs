//! Frame and descriptor transport over a Unix stream socket.
//!
//! Payload frames are a `u32` big-endian length followed by the encoded
//! message. A resolved descriptor travels as `SCM_RIGHTS` ancillary data
//! attached to a single marker byte, outside the ordinary frame stream.
//!
//! Server-side halves run non-blocking; `try_recv_frame` distinguishes a
//! not-ready socket (retry later) from a closed one. Client halves stay
//! blocking and use `recv_frame`.

use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

/// Byte carried alongside the `SCM_RIGHTS` control message.
const TRANSFER_MARKER: u8 = 0xF5;

const FRAME_HEADER_LEN: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("timed out mid-frame; peer stalled")]
    Stalled,

    #[error("descriptor transfer carried no descriptor")]
    MissingDescriptor,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn errno_to_io(err: Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}

/// Block until `fd` reports `flags` or `timeout` elapses.
///
/// Returns `true` if the descriptor became ready.
fn wait_for(fd: BorrowedFd<'_>, flags: PollFlags, timeout: Duration) -> Result<bool, WireError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, flags)];
        match poll(&mut fds, millis) {
            Ok(0) => {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(errno_to_io(err).into()),
        }
    }
}

/// Write one length-prefixed frame, waiting out short writes on a
/// non-blocking socket up to `timeout`.
pub fn send_frame(
    stream: &UnixStream,
    payload: &[u8],
    timeout: Duration,
) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    write_all_bounded(stream, &buf, timeout)
}

fn write_all_bounded(
    stream: &UnixStream,
    mut buf: &[u8],
    timeout: Duration,
) -> Result<(), WireError> {
    let deadline = Instant::now() + timeout;
    while !buf.is_empty() {
        match (&*stream).write(buf) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || !wait_for(stream.as_fd(), PollFlags::POLLOUT, remaining)?
                {
                    return Err(WireError::Stalled);
                }
            }
            Err(err) if is_disconnect(&err) => return Err(WireError::Closed),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Read one frame from a blocking stream.
pub fn recv_frame(stream: &UnixStream, max: usize) -> Result<Vec<u8>, WireError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    read_exact_or_closed(stream, &mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(WireError::FrameTooLarge { size: len, max });
    }
    let mut payload = vec![0u8; len];
    read_exact_or_closed(stream, &mut payload)?;
    Ok(payload)
}

fn read_exact_or_closed(stream: &UnixStream, buf: &mut [u8]) -> Result<(), WireError> {
    match (&*stream).read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Closed),
        Err(err) if is_disconnect(&err) => Err(WireError::Closed),
        Err(err) => Err(err.into()),
    }
}

/// Attempt to read one frame from a non-blocking stream.
///
/// Returns `Ok(None)` when nothing is pending (transient, retry on a later
/// pass) and `Err(WireError::Closed)` on end-of-stream. Once the first
/// byte of a frame has arrived, the remainder is drained with bounded
/// waits up to `drain_timeout`; a peer that stalls mid-frame is treated as
/// broken.
pub fn try_recv_frame(
    stream: &UnixStream,
    max: usize,
    drain_timeout: Duration,
) -> Result<Option<Vec<u8>>, WireError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let first = match (&*stream).read(&mut header) {
        Ok(0) => return Err(WireError::Closed),
        Ok(n) => n,
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::Interrupted =>
        {
            return Ok(None);
        }
        Err(err) if is_disconnect(&err) => return Err(WireError::Closed),
        Err(err) => return Err(err.into()),
    };

    let deadline = Instant::now() + drain_timeout;
    if first < FRAME_HEADER_LEN {
        read_exact_bounded(stream, &mut header[first..], deadline)?;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(WireError::FrameTooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len];
    read_exact_bounded(stream, &mut payload, deadline)?;
    Ok(Some(payload))
}

fn read_exact_bounded(
    stream: &UnixStream,
    mut buf: &mut [u8],
    deadline: Instant,
) -> Result<(), WireError> {
    while !buf.is_empty() {
        match (&*stream).read(buf) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => buf = &mut buf[n..],
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || !wait_for(stream.as_fd(), PollFlags::POLLIN, remaining)?
                {
                    return Err(WireError::Stalled);
                }
            }
            Err(err) if is_disconnect(&err) => return Err(WireError::Closed),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Transfer an open descriptor out-of-band, attached to a single marker
/// byte.
pub fn send_fd(
    stream: &UnixStream,
    fd: BorrowedFd<'_>,
    timeout: Duration,
) -> Result<(), WireError> {
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let marker = [TRANSFER_MARKER];
    let iov = [IoSlice::new(&marker)];
    let deadline = Instant::now() + timeout;
    loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, SEND_FLAGS, None) {
            Ok(0) => return Err(WireError::Closed),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || !wait_for(stream.as_fd(), PollFlags::POLLOUT, remaining)?
                {
                    return Err(WireError::Stalled);
                }
            }
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(WireError::Closed),
            Err(err) => return Err(errno_to_io(err).into()),
        }
    }
}

/// Receive an out-of-band descriptor from a blocking stream.
///
/// Any extra descriptors smuggled into the same control message are
/// closed rather than surfaced.
pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, WireError> {
    let mut space = nix::cmsg_space!([RawFd; 2]);
    let mut marker = [0u8; 1];
    loop {
        let mut iov = [IoSliceMut::new(&mut marker)];
        let msg = match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::empty(),
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET) => return Err(WireError::Closed),
            Err(err) => return Err(errno_to_io(err).into()),
        };

        if msg.bytes == 0 {
            return Err(WireError::Closed);
        }

        let mut received: Option<OwnedFd> = None;
        for cmsg in msg.cmsgs().map_err(errno_to_io)? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // Safety: SCM_RIGHTS hands this process ownership of a
                    // freshly duplicated descriptor.
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    if received.is_none() {
                        received = Some(fd);
                    }
                }
            }
        }
        return received.ok_or(WireError::MissingDescriptor);
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
