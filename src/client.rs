//! The Client Endpoint state machine (spec §3, §4.2).
//!
//! One instance per attached client; owned exclusively by a
//! [`crate::coordinator::Coordinator`] and never outliving it (the
//! back-reference the original keeps from client to coordinator is
//! dropped per spec.md §9 -- callers pass the coordinator's mix
//! buffer/config in explicitly instead).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::EventedFd;
use mio::{Evented, Poll, PollOpt, Ready, Token};
use nix::errno::Errno;
use nix::unistd;
use strum_macros::EnumString;

use crate::mixbuffer::RingMixBuffer;

/// Direction of data flow for a single client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Playback,
    Capture,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Init,
    Idle,
    Running,
    Paused,
    Draining1,
    Draining2,
    Finished,
}

/// The multiplexer event kinds a worker dispatches to a client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Data,
    Control,
    Drain,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString)]
#[strum(serialize_all = "PascalCase")]
enum ControlCommand {
    Drain,
    Drop,
    Pause,
    Resume,
}

/// What a worker should do in reaction to a client state change. The
/// worker aggregates these into the coordinator's `active_count`
/// rather than the endpoint mutating shared state directly (spec §5:
/// "`active_count` is incremented/decremented only by the worker").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    None,
    BecameActive,
    BecameInactive,
    /// Drop latched with exactly this client remaining is handled by
    /// the worker (spec.md §2's `client_count == 1 && drop` path).
    DropLatched,
    /// The client hung up or errored out. Carries whether it was
    /// RUNNING or DRAINING1 at the time, so the worker can decrement
    /// `active_count` for a client that never reached DRAINING2 or
    /// PAUSED -- the only other transitions that already account for it
    /// (original `bluealsa_pcm_client_set_state`'s FINISHED case).
    Finished(bool),
}

const DRAIN_CHUNK: usize = 32 * 1024;

/// Drains a non-blocking fd into `/dev/null`-equivalent up to
/// `DRAIN_CHUNK` bytes, mirroring the original's bounded, best-effort
/// `splice(..., SPLICE_F_NONBLOCK)` drop drain.
fn drain_into_sink(fd: RawFd) {
    let mut scratch = [0u8; DRAIN_CHUNK];
    loop {
        match unistd::read(fd, &mut scratch) {
            Ok(0) => break,
            Ok(n) if n < scratch.len() => break,
            Ok(_) => continue,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
            Err(_) => break,
        }
    }
}

pub struct ClientEndpoint {
    /// Surfaced only in log messages (spec.md §2's debug numbering).
    id: u64,
    role: Role,
    data_fd: RawFd,
    control_fd: RawFd,
    drain_fd: Option<RawFd>,
    state: ClientState,
    staging: Vec<u8>,
    in_offset: usize,
    out_offset: i64,
    /// Watermark for DRAINING1 completion: the mix delay observed at
    /// the end of the previous `deliver` call. DRAINING1 completes once
    /// the delay hits zero or grows past this value -- the latter
    /// catches `mix_offset` stepping past `out_offset` in one jump
    /// (e.g. another client's period-sized reads) without ever landing
    /// on it exactly. Reset to `usize::MAX` on entry to IDLE.
    drain_avail: usize,
    drop_requested: bool,
    watch: bool,
    frame_size: usize,
    channels: u8,
    client_threshold_bytes: usize,
    /// A freshly armed drain timerfd, not yet registered with the
    /// coordinator's multiplexer. Taken (and registered) by the
    /// worker in the same pass that observes DRAINING1->DRAINING2.
    pending_drain_fd: Option<RawFd>,
}

impl ClientEndpoint {
    pub fn new(id: u64, role: Role, data_fd: RawFd, control_fd: RawFd) -> Self {
        ClientEndpoint {
            id,
            role,
            data_fd,
            control_fd,
            drain_fd: None,
            state: ClientState::Init,
            staging: Vec::new(),
            in_offset: 0,
            out_offset: 0,
            drain_avail: usize::MAX,
            drop_requested: false,
            watch: false,
            frame_size: 0,
            channels: 0,
            client_threshold_bytes: 0,
            pending_drain_fd: None,
        }
    }

    /// Takes the drain timerfd armed by the last `deliver()` call, if
    /// any, so the worker can register it with the multiplexer at this
    /// client's drain token.
    pub fn take_pending_drain_fd(&mut self) -> Option<RawFd> {
        self.pending_drain_fd.take()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn drop_requested(&self) -> bool {
        self.drop_requested
    }

    pub fn data_fd(&self) -> RawFd {
        self.data_fd
    }

    pub fn control_fd(&self) -> RawFd {
        self.control_fd
    }

    pub fn drain_fd(&self) -> Option<RawFd> {
        self.drain_fd
    }

    /// Lazy initialization once the coordinator knows the transport's
    /// period size (spec §4.2 "Lifecycle"). The drain timer itself is
    /// created on demand, when DRAINING1 completes (see
    /// [`Self::arm_drain_timer`]), not here.
    pub fn init(
        &mut self,
        frame_size: usize,
        channels: u8,
        period_bytes: usize,
        client_threshold_periods: usize,
    ) {
        self.frame_size = frame_size;
        self.channels = channels;
        self.client_threshold_bytes = client_threshold_periods * period_bytes;
        self.staging = Vec::with_capacity(self.client_threshold_bytes + period_bytes);
        self.watch = true;
        self.state = match self.role {
            Role::Playback => ClientState::Idle,
            Role::Capture => ClientState::Running,
        };
    }

    /// Playback only: stage newly readable bytes, admit whole frames
    /// into the mix, and drive the IDLE->RUNNING and DRAINING1->
    /// DRAINING2 transitions.
    pub fn deliver(
        &mut self,
        mix: &mut RingMixBuffer,
        mix_threshold_periods: usize,
        drain_timeout: Duration,
    ) -> Transition {
        debug_assert_eq!(self.role, Role::Playback);
        if self.state == ClientState::Finished || self.state == ClientState::Paused {
            return Transition::None;
        }

        self.pull_staged_bytes();

        let mut transition = Transition::None;

        if self.state == ClientState::Idle {
            if self.in_offset > self.client_threshold_bytes {
                let period = mix.period();
                let samples_staged = self.in_offset * self.channels as usize / self.frame_size;
                self.out_offset = -((mix_threshold_periods * period) as i64 - samples_staged as i64);
                self.state = ClientState::Running;
                transition = Transition::BecameActive;
            }
            return transition;
        }

        if self.state != ClientState::Running && self.state != ClientState::Draining1 {
            return transition;
        }

        let frames = self.in_offset / self.frame_size;
        let whole_bytes = frames * self.frame_size;
        if whole_bytes > 0 {
            let consumed = mix.add(&mut self.out_offset, &self.staging[..whole_bytes], whole_bytes);
            if consumed > 0 {
                self.staging.drain(0..consumed);
                self.in_offset -= consumed;
            }
        }

        if self.state == ClientState::Draining1 && self.in_offset == 0 {
            let mix_avail = mix.delay(self.out_offset_as_absolute(mix));
            if mix_avail == 0 || mix_avail > self.drain_avail {
                self.state = ClientState::Draining2;
                self.pending_drain_fd = self.arm_drain_timer(drain_timeout);
                transition = Transition::BecameInactive;
            } else {
                self.drain_avail = mix_avail;
            }
        }

        transition
    }

    /// Arms a one-shot, non-blocking timerfd for the drain-phase-2
    /// tail timeout (spec §4.2, 300 ms). Mirrors the original's
    /// `timerfd_settime` call; `libc` is used directly here the same
    /// way raw syscalls are used elsewhere in this crate, since `nix`
    /// does not wrap `timerfd_create` uniformly across versions.
    fn arm_drain_timer(&mut self, timeout: Duration) -> Option<RawFd> {
        unsafe {
            let fd = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK);
            if fd < 0 {
                warn!("client {} failed to create drain timer", self.id);
                return None;
            }
            let spec = libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: libc::timespec {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_nsec: timeout.subsec_nanos() as libc::c_long,
                },
            };
            if libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) != 0 {
                libc::close(fd);
                warn!("client {} failed to arm drain timer", self.id);
                return None;
            }
            self.drain_fd = Some(fd);
            Some(fd)
        }
    }

    fn out_offset_as_absolute(&self, mix: &RingMixBuffer) -> usize {
        mix.resolve_offset(self.out_offset)
    }

    /// How many samples ahead of `mix_offset` this client's next write
    /// will land -- the forward phase distance `Pause`/`Resume` must
    /// preserve (spec.md §4.2 scenario 5).
    pub fn forward_delay(&self, mix: &RingMixBuffer) -> usize {
        mix.delay(self.out_offset_as_absolute(mix))
    }

    fn pull_staged_bytes(&mut self) {
        let mut scratch = [0u8; 4096];
        loop {
            match unistd::read(self.data_fd, &mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    self.staging.extend_from_slice(&scratch[..n]);
                    self.in_offset += n;
                    if n < scratch.len() {
                        break;
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.close_and_finish();
                    break;
                }
            }
        }
    }

    /// Capture only: best-effort fan-out write; never blocks the
    /// transport thread (spec §4.2, P7).
    pub fn write(&mut self, data: &[u8]) -> Transition {
        debug_assert_eq!(self.role, Role::Capture);
        if self.state != ClientState::Running {
            return Transition::None;
        }
        let mut off = 0;
        while off < data.len() {
            match unistd::write(self.data_fd, &data[off..]) {
                Ok(n) => off += n,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    warn!("client {} overrun: dropping capture frame", self.id);
                    return Transition::None;
                }
                Err(e) => {
                    warn!("client {} write failed: {}", self.id, e);
                    return self.close_and_finish();
                }
            }
        }
        Transition::None
    }

    pub fn handle_event(&mut self, kind: EventKind, mix: Option<&RingMixBuffer>) -> Transition {
        match kind {
            EventKind::Data => Transition::None,
            EventKind::Control => self.handle_control(mix),
            EventKind::Drain => self.handle_drain_timer(),
        }
    }

    pub fn handle_close_event(&mut self) -> Transition {
        self.close_and_finish()
    }

    fn handle_control(&mut self, mix: Option<&RingMixBuffer>) -> Transition {
        let mut buf = [0u8; 6];
        let n = match unistd::read(self.control_fd, &mut buf) {
            Ok(0) => return self.close_and_finish(),
            Ok(n) => n,
            Err(Errno::EAGAIN) => return Transition::None,
            Err(_) => return self.close_and_finish(),
        };
        let token = std::str::from_utf8(&buf[..n]).unwrap_or("").trim();
        let transition = match token.parse::<ControlCommand>() {
            Ok(ControlCommand::Drain) => self.begin_drain(),
            Ok(ControlCommand::Drop) => self.drop_staged(),
            Ok(ControlCommand::Pause) => self.pause(mix),
            Ok(ControlCommand::Resume) => self.resume(),
            Err(_) => {
                warn!("client {} sent invalid control token {:?}", self.id, token);
                self.reply(b"Invalid");
                Transition::None
            }
        };
        transition
    }

    fn begin_drain(&mut self) -> Transition {
        if self.role == Role::Playback && self.state == ClientState::Running {
            self.watch = false;
            self.state = ClientState::Draining1;
        }
        Transition::None
    }

    fn drop_staged(&mut self) -> Transition {
        self.staging.clear();
        self.in_offset = 0;
        drain_into_sink(self.data_fd);
        self.drop_requested = true;
        self.state = ClientState::Idle;
        self.drain_avail = usize::MAX;
        self.reply(b"OK");
        Transition::None
    }

    fn pause(&mut self, mix: Option<&RingMixBuffer>) -> Transition {
        if self.state == ClientState::Running {
            self.watch = false;
            if let Some(mix) = mix {
                let abs = self.out_offset_as_absolute(mix);
                self.out_offset = -(mix.delay(abs) as i64);
            }
            self.state = ClientState::Paused;
        }
        self.reply(b"OK");
        Transition::None
    }

    fn resume(&mut self) -> Transition {
        match self.state {
            ClientState::Paused => {
                self.watch = true;
                self.state = ClientState::Running;
            }
            ClientState::Idle => {
                self.watch = true;
                self.drop_requested = false;
            }
            _ => {}
        }
        self.reply(b"OK");
        Transition::None
    }

    fn handle_drain_timer(&mut self) -> Transition {
        if self.state == ClientState::Draining2 {
            if let Some(fd) = self.drain_fd.take() {
                let mut expirations = [0u8; 8];
                let _ = unistd::read(fd, &mut expirations);
                let _ = unistd::close(fd);
            }
            self.state = ClientState::Idle;
            self.watch = true;
            self.staging.clear();
            self.in_offset = 0;
            self.drain_avail = usize::MAX;
            self.reply(b"OK");
        }
        Transition::None
    }

    fn reply(&self, msg: &[u8]) {
        match unistd::write(self.control_fd, msg) {
            Ok(n) if n == msg.len() => {}
            Ok(_) | Err(_) => warn!("client {} control response failed", self.id),
        }
    }

    fn close_and_finish(&mut self) -> Transition {
        let _ = unistd::close(self.data_fd);
        let _ = unistd::close(self.control_fd);
        if let Some(fd) = self.drain_fd.take() {
            let _ = unistd::close(fd);
        }
        let was_active = matches!(
            self.state,
            ClientState::Running | ClientState::Draining1
        );
        self.state = ClientState::Finished;
        Transition::Finished(was_active)
    }
}

impl AsRawFd for ClientEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.data_fd
    }
}

/// A thin `Evented` view over one of a client's three fds, used by the
/// worker to register/reregister/deregister with the coordinator's
/// multiplexer -- the same `EventedFd` delegation pattern as
/// [`crate::wake::WakeEvent`].
pub struct ClientFd<'a>(pub &'a RawFd);

impl<'a> Evented for ClientFd<'a> {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(self.0).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        EventedFd(self.0).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        EventedFd(self.0).deregister(poll)
    }
}
