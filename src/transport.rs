//! The external collaborator the core consumes but never owns: the
//! opaque Bluetooth transport PCM (`ba_transport_pcm` in the original).
//!
//! D-Bus, HCI, and ALSA playback are explicitly out of scope; this
//! trait is the seam the core calls through instead of depending on
//! any of them directly.

use std::os::unix::io::RawFd;

use crate::format::SampleFormat;

/// Direction of data flow relative to the Bluetooth device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PcmMode {
    /// Local clients -> Bluetooth device.
    Playback,
    /// Bluetooth device -> local clients.
    Capture,
}

/// Whether `Coordinator::read` should apply the transport's soft-volume
/// scale array, or treat volume as a hardware mute gate (spec §4.3,
/// spec.md §2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeMode {
    /// Apply the per-channel floating-point scale continuously.
    Soft,
    /// Scale is either 1.0 (unmuted) or 0.0 (muted); no intermediate
    /// gain is ever applied by the core.
    Hardware,
}

/// The opaque Bluetooth transport PCM the core drives. Implemented
/// elsewhere (D-Bus/HCI/ALSA glue); the core only ever calls through
/// this trait.
pub trait Transport {
    fn mode(&self) -> PcmMode;
    fn format(&self) -> SampleFormat;
    fn channels(&self) -> u8;
    fn rate(&self) -> u32;
    fn volume_mode(&self) -> VolumeMode;
    /// Per-channel soft-volume scale, `channels()` entries long.
    fn soft_volume_scale(&self) -> Vec<f64>;
    /// True if the hardware mute gate for `channel` is closed.
    fn hardware_muted(&self, channel: usize) -> bool;

    /// The eventfd the core writes `1` to in order to announce a fresh
    /// mix batch (playback) or that capture fan-out completed.
    fn wake_fd(&self) -> RawFd;
    /// Clear the transport's own readiness eventfd; called at the top
    /// of `Coordinator::read`.
    fn clear_wake(&self);

    /// Called once `client_count` reaches zero.
    fn stop_if_no_clients(&self);
    /// Request the transport drop its current period (used by the
    /// single-remaining-client drop shortcut).
    fn pcm_drop(&self);
    /// Resume a paused transport PCM (snoop worker, PAUSED->RUNNING).
    fn pcm_resume(&self);
    /// Release the transport PCM entirely (coordinator teardown).
    fn pcm_release(&self);
    /// Signal the transport to close.
    fn signal_close(&self);
}
