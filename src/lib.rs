//! A multi-client PCM mixing engine.
//!
//! Multiplexes several independent local clients onto a single
//! Bluetooth transport by mixing their playback streams sample-
//! accurately, and fans a single captured stream out to several
//! clients without blocking the transport thread.
//!
//! The four cooperating pieces are [`mixbuffer::RingMixBuffer`] (the
//! shared accumulator), [`client::ClientEndpoint`] (per-client state
//! machine), [`coordinator::Coordinator`] (the per-transport owner),
//! and [`worker`] (the mix/snoop event loops that drive both).

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod mixbuffer;
pub mod transport;
pub mod wake;
pub mod worker;

pub use config::{MixThreshold, MultiConfig};
pub use coordinator::{Coordinator, CoordinatorState};
pub use error::{Error, Result};
pub use format::SampleFormat;
pub use transport::{PcmMode, Transport};
