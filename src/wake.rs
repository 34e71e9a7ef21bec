//! The coordinator's wake/stop signal.
//!
//! An eventfd the transport thread (or the coordinator itself, on
//! teardown) writes to in order to wake the worker parked in the
//! multiplexer. A write of `1` means "work available"; a write whose
//! high bytes equal [`STOP_MAGIC`] means "terminate" (spec §4.4, §6),
//! modeled directly on the original's
//! `eventfd_write(multi->event_fd, 0xDEAD0000)`.

use std::io;
use std::io::Result as IoResult;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{read, write};

/// High 32 bits of a counter value that mean "stop the worker" rather
/// than "work is available". Chosen so it can never be reached by
/// ordinary accumulation of `1`s between worker wakeups.
pub const STOP_MAGIC: u64 = 0xDEAD_0000_0000_0000;

pub struct WakeEvent {
    fd: RawFd,
}

impl WakeEvent {
    pub fn new() -> IoResult<Self> {
        let fd = eventfd(0, EfdFlags::EFD_NONBLOCK).map_err(io::Error::from)?;
        Ok(WakeEvent { fd })
    }

    /// Signal that a mix batch (or fan-out pass) is ready to be picked
    /// up by the worker.
    pub fn notify(&self) -> IoResult<()> {
        self.write_u64(1)
    }

    /// Ask the worker to terminate on its next wakeup.
    pub fn stop(&self) -> IoResult<()> {
        self.write_u64(STOP_MAGIC)
    }

    /// Drain the counter, returning the accumulated value. Returns `Ok(0)`
    /// if nothing was pending (`EAGAIN` on a non-blocking eventfd).
    pub fn drain(&self) -> IoResult<u64> {
        let mut buf = [0u8; 8];
        match read(self.fd, &mut buf) {
            Ok(_) => Ok(u64::from_ne_bytes(buf)),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// True if the drained counter value is the stop sentinel.
    pub fn is_stop(value: u64) -> bool {
        value >= STOP_MAGIC
    }

    fn write_u64(&self, value: u64) -> IoResult<()> {
        let buf = value.to_ne_bytes();
        match write(self.fd, &buf) {
            Ok(_) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl AsRawFd for WakeEvent {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for WakeEvent {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

impl Evented for WakeEvent {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> IoResult<()> {
        EventedFd(&self.fd).register(poll, token, interest, opts)
    }

    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> IoResult<()> {
        EventedFd(&self.fd).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> IoResult<()> {
        EventedFd(&self.fd).deregister(poll)
    }
}
