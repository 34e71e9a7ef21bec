//! The Multi Coordinator: the per-transport owner of the ring-mix
//! buffer, the client set, and the worker thread (spec §3, §4.3).

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use mio::{Poll, PollOpt, Ready, Token};

use crate::client::{ClientEndpoint, ClientFd, Role, Transition};
use crate::config::MultiConfig;
use crate::error::{Error, Result};
use crate::mixbuffer::RingMixBuffer;
use crate::transport::{PcmMode, Transport, VolumeMode};
use crate::wake::WakeEvent;

/// Coordinator-level lifecycle state (spec §3's `state` attribute).
/// Stored as a plain `u8` behind an `AtomicU8` per spec.md §4 --
/// release on every worker store, acquire on every transport-thread
/// load.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoordinatorState {
    Init,
    Running,
    Paused,
    Finished,
}

impl CoordinatorState {
    fn encode(self) -> u8 {
        match self {
            CoordinatorState::Init => 0,
            CoordinatorState::Running => 1,
            CoordinatorState::Paused => 2,
            CoordinatorState::Finished => 3,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            1 => CoordinatorState::Running,
            2 => CoordinatorState::Paused,
            3 => CoordinatorState::Finished,
            _ => CoordinatorState::Init,
        }
    }
}

/// Result of a transport-thread `read` call (spec §4.3).
#[derive(Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    Samples(usize),
    WouldBlock,
    Finished,
}

/// The playback-only ring-mix buffer paired with the `buffer_ready`
/// flag the condition variable guards (spec §5's `buffer_mutex`).
/// Wrapped in `Option` so a capture-mode coordinator (which never
/// allocates a mix buffer) and a not-yet-`init`ed playback coordinator
/// share the same field instead of an `unsafe` late-init cell.
struct BufferState {
    mix: RingMixBuffer,
    ready: bool,
}

/// Multiplexer tokens. `WAKE` is the coordinator's own wake-event;
/// client tokens are `CLIENT_BASE + (client slot index * 3) +
/// {0=data,1=control,2=drain}`, matching the 1-eventfd-plus-per-client
/// token layout the worker dispatches against.
pub(crate) const TOKEN_WAKE: usize = 0;
pub(crate) const CLIENT_BASE: usize = 1;

pub struct Coordinator<T: Transport> {
    transport: T,
    config: MultiConfig,
    mode: PcmMode,

    state: AtomicU8,
    active_count: AtomicUsize,
    period_frames: AtomicUsize,
    period_bytes: AtomicUsize,
    next_client_id: AtomicUsize,

    /// Slab-style: a freed slot becomes `None` and is reused by the
    /// next `add_client`, so a client's multiplexer token (derived
    /// from its slot index) stays stable for its whole lifetime even
    /// as siblings are reaped.
    clients: Mutex<Vec<Option<ClientEndpoint>>>,
    buffer: Mutex<Option<BufferState>>,
    buffer_ready_cond: Condvar,

    poll: Poll,
    wake: WakeEvent,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + Send + Sync + 'static> Coordinator<T> {
    /// `enabled(transport)` (spec §4.3): true iff the transport's
    /// format is one of the four this engine mixes at all -- the
    /// three-byte-packed S24 variant the original excludes has no
    /// representation in [`crate::format::SampleFormat`] to begin
    /// with, so that exclusion is structural rather than a runtime
    /// check here.
    pub fn enabled(transport: &T) -> bool {
        transport.format().is_multi_capable() && (1..=8).contains(&transport.channels())
    }

    /// `create(pcm)`: allocate the multiplexer and wake-event handles.
    pub fn create(transport: T, config: MultiConfig) -> Result<Arc<Self>> {
        let mode = transport.mode();
        let poll = Poll::new().map_err(Error::from)?;
        let wake = WakeEvent::new().map_err(Error::from)?;
        poll.register(&wake, Token(TOKEN_WAKE), Ready::readable(), PollOpt::edge())
            .map_err(Error::from)?;

        Ok(Arc::new(Coordinator {
            transport,
            config,
            mode,
            state: AtomicU8::new(CoordinatorState::Init.encode()),
            active_count: AtomicUsize::new(0),
            period_frames: AtomicUsize::new(0),
            period_bytes: AtomicUsize::new(0),
            next_client_id: AtomicUsize::new(0),
            clients: Mutex::new(Vec::new()),
            buffer: Mutex::new(None),
            buffer_ready_cond: Condvar::new(),
            poll,
            wake,
            worker: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::decode(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.store(state.encode(), Ordering::Release);
    }

    pub fn mode(&self) -> PcmMode {
        self.mode
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .lock()
            .expect("client_mutex poisoned")
            .iter()
            .filter(|c| c.is_some())
            .count()
    }

    /// `multi->delay`-equivalent nominal playback latency estimate, in
    /// hundredths of a millisecond, the same units the original
    /// computes (spec.md §2).
    pub fn nominal_delay_ms(&self) -> u64 {
        let period_frames = self.period_frames.load(Ordering::Acquire) as u64;
        let rate = self.transport.rate() as u64;
        if rate == 0 {
            return 0;
        }
        let periods = (self.config.mix_threshold.periods() + self.config.client_threshold) as u64;
        period_frames * periods * 10_000 / rate
    }

    /// `init(pcm, transfer_samples)`.
    pub fn init(self: &Arc<Self>, transfer_samples: usize) -> Result<()> {
        let channels = self.transport.channels() as usize;
        let period_frames = transfer_samples / channels;
        let period_bytes = period_frames * channels * self.transport.format().wire_bytes();
        self.period_frames.store(period_frames, Ordering::Release);
        self.period_bytes.store(period_bytes, Ordering::Release);

        if self.mode == PcmMode::Playback {
            let mix = RingMixBuffer::init(
                self.transport.format(),
                self.transport.channels(),
                self.config.buffer_periods * period_frames,
                period_frames,
                self.config.mix_threshold.periods(),
            )?;
            *self.buffer.lock().expect("buffer_mutex poisoned") =
                Some(BufferState { mix, ready: false });
            self.active_count.store(0, Ordering::Release);
        } else if self.client_count() > 0 {
            self.start_worker();
        }
        Ok(())
    }

    /// `add_client(data_fd, control_fd)`.
    pub fn add_client(self: &Arc<Self>, data_fd: RawFd, control_fd: RawFd) -> Result<()> {
        let mut clients = self.clients.lock().expect("client_mutex poisoned");
        let live = clients.iter().filter(|c| c.is_some()).count();
        if live >= self.config.max_clients {
            return Err(Error::ResourceExhausted {
                reason: format!("client cap of {} reached", self.config.max_clients),
            });
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) as u64;
        let role = match self.mode {
            PcmMode::Playback => Role::Playback,
            PcmMode::Capture => Role::Capture,
        };
        let mut client = ClientEndpoint::new(id, role, data_fd, control_fd);

        let period_bytes = self.period_bytes.load(Ordering::Acquire);
        if period_bytes > 0 {
            let frame_size = self.transport.format().frame_size(self.transport.channels());
            client.init(
                frame_size,
                self.transport.channels(),
                period_bytes,
                self.config.client_threshold,
            );
        }

        let slot = clients.iter().position(|c| c.is_none()).unwrap_or(clients.len());
        self.register_client(&client, slot)?;
        if slot == clients.len() {
            clients.push(Some(client));
        } else {
            clients[slot] = Some(client);
        }
        drop(clients);

        self.start_worker();
        Ok(())
    }

    fn register_client(&self, client: &ClientEndpoint, slot: usize) -> Result<()> {
        let base = CLIENT_BASE + slot * 3;
        self.poll
            .register(
                &ClientFd(&client.data_fd()),
                Token(base),
                Ready::readable(),
                PollOpt::edge(),
            )
            .map_err(Error::from)?;
        self.poll
            .register(
                &ClientFd(&client.control_fd()),
                Token(base + 1),
                Ready::readable(),
                PollOpt::edge(),
            )
            .map_err(Error::from)?;
        Ok(())
    }

    fn start_worker(self: &Arc<Self>) {
        let mut guard = self.worker.lock().expect("worker mutex poisoned");
        if guard.is_some() || self.state() == CoordinatorState::Finished {
            return;
        }
        let coord = Arc::clone(self);
        let handle = match self.mode {
            PcmMode::Playback => std::thread::spawn(move || crate::worker::run_mix_worker(coord)),
            PcmMode::Capture => std::thread::spawn(move || crate::worker::run_snoop_worker(coord)),
        };
        *guard = Some(handle);
    }

    /// `write(buffer, samples)`: capture fan-out under `client_mutex`.
    pub fn write(&self, data: &[u8]) -> usize {
        debug_assert_eq!(self.mode, PcmMode::Capture);
        let mut clients = self.clients.lock().expect("client_mutex poisoned");
        for slot in clients.iter_mut() {
            let finished = match slot {
                Some(client) => matches!(client.write(data), Transition::Finished(_)),
                None => false,
            };
            if finished {
                *slot = None;
            }
        }
        data.len()
    }

    /// `read(buffer, samples)`: playback fan-in for the transport
    /// thread. Clears the transport's own wake, signals the mix
    /// worker, and waits for a completed batch.
    pub fn read(&self, dst: &mut [u8], samples: usize) -> Result<ReadOutcome> {
        debug_assert_eq!(self.mode, PcmMode::Playback);
        self.transport.clear_wake();
        let _ = self.wake.notify();

        let mut guard = self.buffer.lock().expect("buffer_mutex poisoned");
        while self.state() == CoordinatorState::Running && !Self::ready(&guard) {
            guard = self
                .buffer_ready_cond
                .wait(guard)
                .expect("buffer_mutex poisoned");
        }

        if self.state() == CoordinatorState::Finished {
            return Ok(ReadOutcome::Finished);
        }
        let buffer = guard.as_mut().expect("read() called before init()");
        if buffer.mix.empty() {
            return Ok(ReadOutcome::WouldBlock);
        }

        let scale = self.resolve_scale();
        let produced = buffer.mix.read(dst, samples, &scale);
        buffer.ready = false;
        Ok(ReadOutcome::Samples(produced))
    }

    fn ready(guard: &MutexGuard<Option<BufferState>>) -> bool {
        guard.as_ref().map(|b| b.ready).unwrap_or(false)
    }

    fn resolve_scale(&self) -> Vec<f64> {
        match self.transport.volume_mode() {
            VolumeMode::Soft => self.transport.soft_volume_scale(),
            VolumeMode::Hardware => (0..self.transport.channels() as usize)
                .map(|ch| if self.transport.hardware_muted(ch) { 0.0 } else { 1.0 })
                .collect(),
        }
    }

    /// `reset()`: stop worker, release buffer, reap all clients.
    pub fn reset(&self) {
        let _ = self.wake.stop();
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
        if let Some(buffer) = self.buffer.lock().expect("buffer_mutex poisoned").as_mut() {
            buffer.mix.clear();
        }
        self.clients.lock().expect("client_mutex poisoned").clear();
        self.active_count.store(0, Ordering::Release);
        self.set_state(CoordinatorState::Init);
    }

    /// `free()`: full teardown.
    pub fn free(&self) {
        self.reset();
        self.transport.signal_close();
    }

    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }

    pub(crate) fn poll(&self) -> &Poll {
        &self.poll
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn wake(&self) -> &WakeEvent {
        &self.wake
    }

    pub(crate) fn clients_mutex(&self) -> &Mutex<Vec<Option<ClientEndpoint>>> {
        &self.clients
    }

    /// Remove a client by slot index (worker-only, called after a
    /// client reaches FINISHED). Closes no fds itself -- the endpoint
    /// already closed its own fds in `close_and_finish`.
    pub(crate) fn reap_slot(&self, slot: usize) {
        let mut clients = self.clients.lock().expect("client_mutex poisoned");
        if let Some(client) = clients.get_mut(slot) {
            if let Some(endpoint) = client.take() {
                let _ = self.poll.deregister(&ClientFd(&endpoint.data_fd()));
                let _ = self.poll.deregister(&ClientFd(&endpoint.control_fd()));
            }
        }
    }

    pub(crate) fn with_mix<R>(&self, f: impl FnOnce(&mut RingMixBuffer) -> R) -> Option<R> {
        let mut guard = self.buffer.lock().expect("buffer_mutex poisoned");
        guard.as_mut().map(|b| f(&mut b.mix))
    }

    pub(crate) fn mark_ready_and_signal(&self) {
        let mut guard = self.buffer.lock().expect("buffer_mutex poisoned");
        if let Some(buffer) = guard.as_mut() {
            buffer.ready = true;
            self.buffer_ready_cond.notify_all();
        }
    }

    pub(crate) fn clear_buffer(&self) {
        if let Some(buffer) = self.buffer.lock().expect("buffer_mutex poisoned").as_mut() {
            buffer.mix.clear();
        }
    }

    pub(crate) fn mix_empty(&self) -> bool {
        self.buffer
            .lock()
            .expect("buffer_mutex poisoned")
            .as_ref()
            .map(|b| b.mix.empty())
            .unwrap_or(true)
    }

    pub(crate) fn mix_at_threshold(&self) -> bool {
        self.buffer
            .lock()
            .expect("buffer_mutex poisoned")
            .as_ref()
            .map(|b| b.mix.at_threshold())
            .unwrap_or(false)
    }

    pub(crate) fn set_coordinator_state(&self, state: CoordinatorState) {
        self.set_state(state);
    }

    pub(crate) fn client_threshold(&self) -> usize {
        self.config.client_threshold
    }

    pub(crate) fn mix_threshold_periods(&self) -> usize {
        self.config.mix_threshold.periods()
    }

    pub(crate) fn drain_timeout(&self) -> std::time::Duration {
        self.config.drain_timeout
    }

    /// Registers a freshly armed drain timerfd at slot `slot`'s drain
    /// token (`CLIENT_BASE + slot*3 + 2`).
    pub(crate) fn register_drain_fd(&self, slot: usize, fd: RawFd) {
        let token = CLIENT_BASE + slot * 3 + 2;
        let _ = self
            .poll
            .register(&ClientFd(&fd), Token(token), Ready::readable(), PollOpt::edge());
    }

    pub(crate) fn active_count_atomic(&self) -> &AtomicUsize {
        &self.active_count
    }
}
