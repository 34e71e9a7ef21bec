//! Shared fixtures for the integration suites: real fds standing in for
//! the data/control pipes a host process would otherwise create, set
//! non-blocking exactly as the host is expected to hand them over
//! (spec.md §5, §6 -- client fd I/O is always non-blocking).

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe;

use pcm_multi::client::{ClientEndpoint, Role};

fn set_nonblocking(fd: RawFd) {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).expect("fcntl O_NONBLOCK");
}

/// A one-way, non-blocking pipe (the data channel's shape).
pub fn nonblocking_pipe() -> (RawFd, RawFd) {
    let (r, w) = pipe().unwrap();
    set_nonblocking(r);
    set_nonblocking(w);
    (r, w)
}

/// A bidirectional, non-blocking socketpair (the control channel's
/// shape -- a client both sends commands and reads replies over it).
pub fn nonblocking_socketpair() -> (RawFd, RawFd) {
    let (a, b) =
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).unwrap();
    set_nonblocking(a);
    set_nonblocking(b);
    (a, b)
}

pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(300);

/// Build a fully initialized client endpoint plus the test-side ends of
/// its data and control fds.
pub fn endpoint(
    role: Role,
    frame_size: usize,
    channels: u8,
    period_bytes: usize,
    client_threshold_periods: usize,
) -> (ClientEndpoint, RawFd, RawFd) {
    let (data_r, data_w) = nonblocking_pipe();
    let (ctrl_ours, ctrl_theirs) = nonblocking_socketpair();
    let fd = if role == Role::Playback { data_r } else { data_w };
    let mut client = ClientEndpoint::new(1, role, fd, ctrl_ours);
    client.init(frame_size, channels, period_bytes, client_threshold_periods);
    let data_other_end = if role == Role::Playback { data_w } else { data_r };
    (client, data_other_end, ctrl_theirs)
}
