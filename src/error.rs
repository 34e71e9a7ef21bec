//! Error taxonomy for the mixing engine (spec §7).

use std::io;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    /// Client cap reached, or an allocation failed. `add_client` returns
    /// `Ok(false)`/this error without disturbing already-connected
    /// clients.
    #[fail(display = "resource exhausted: {}", reason)]
    ResourceExhausted { reason: String },

    /// The multiplexer itself, or the worker thread spawn, failed. The
    /// coordinator moves to FINISHED; the transport observes `EIO` on
    /// `read` or a short/zero `write`.
    #[fail(display = "fatal mixing engine error: {}", inner)]
    Fatal { inner: io::Error },

    /// An unsupported sample format or channel count was requested at
    /// `RingMixBuffer::init`.
    #[fail(display = "unsupported PCM format/channel configuration")]
    UnsupportedFormat,
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Fatal { inner }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(inner: nix::errno::Errno) -> Self {
        Error::Fatal {
            inner: io::Error::from_raw_os_error(inner as i32),
        }
    }
}
