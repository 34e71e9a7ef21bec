//! Tunables for a `Coordinator`.
//!
//! Holds the same handful of constants a bluez-alsa build would carry as
//! preprocessor `#define`s, but as a configuration record passed at
//! construction time rather than compile-time macros (see DESIGN.md,
//! "global tunables via macros").

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// Number of periods of pre-mix fill required before a playback
/// coordinator declares itself RUNNING. The source carries two values
/// side by side across revisions; both are preserved here as a choice
/// rather than picked for the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MixThreshold {
    /// Two periods of pre-mix fill.
    Low,
    /// Four periods of pre-mix fill (the default; matches the currently
    /// shipping revision of the original header).
    High,
}

impl MixThreshold {
    pub fn periods(self) -> usize {
        match self {
            MixThreshold::Low => 2,
            MixThreshold::High => 4,
        }
    }
}

impl Default for MixThreshold {
    fn default() -> Self {
        MixThreshold::High
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MultiConfig {
    /// Maximum number of clients a coordinator will admit.
    pub max_clients: usize,
    /// Capacity of the ring-mix buffer, expressed in periods.
    pub buffer_periods: usize,
    /// Pre-mix fill threshold before the coordinator starts serving the
    /// transport.
    pub mix_threshold: MixThreshold,
    /// Per-client staging target, in periods, before a playback client
    /// transitions IDLE -> RUNNING.
    pub client_threshold: usize,
    /// How long a draining client waits, after its contribution has
    /// drained from the mix, before the coordinator reports `OK`.
    pub drain_timeout: Duration,
}

impl MultiConfig {
    pub const MAX_CLIENTS: usize = 32;
    pub const BUFFER_PERIODS: usize = 16;
    pub const CLIENT_THRESHOLD: usize = 2;
    pub const DRAIN_NS: u64 = 300_000_000;
}

impl Default for MultiConfig {
    fn default() -> Self {
        MultiConfig {
            max_clients: Self::MAX_CLIENTS,
            buffer_periods: Self::BUFFER_PERIODS,
            mix_threshold: MixThreshold::default(),
            client_threshold: Self::CLIENT_THRESHOLD,
            drain_timeout: Duration::from_nanos(Self::DRAIN_NS),
        }
    }
}
