//! The mix worker and snoop worker event loops (spec §4.4).
//!
//! A single OS thread per coordinator, parked in `mio::Poll::poll`
//! (the multiplexer) and otherwise strictly non-blocking, per spec §5.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use mio::Events;

use crate::client::{EventKind, Role, Transition};
use crate::coordinator::{Coordinator, CoordinatorState, CLIENT_BASE, TOKEN_WAKE};
use crate::transport::Transport;
use crate::wake::WakeEvent;

/// A multiplexer token decodes to either the coordinator's own
/// wake-event or a `(slot, kind)` pair for a client fd.
enum Decoded {
    Wake,
    Client(usize, EventKind),
}

fn decode_token(token: usize) -> Decoded {
    if token == TOKEN_WAKE {
        return Decoded::Wake;
    }
    let rel = token - CLIENT_BASE;
    let slot = rel / 3;
    let kind = match rel % 3 {
        0 => EventKind::Data,
        1 => EventKind::Control,
        _ => EventKind::Drain,
    };
    Decoded::Client(slot, kind)
}

/// **Mix worker** (playback): drains ready client pipes into the
/// ring-mix buffer and signals the transport thread on every batch.
pub fn run_mix_worker<T: Transport + Send + Sync + 'static>(coord: Arc<Coordinator<T>>) {
    let mut events = Events::with_capacity(64);
    loop {
        if coord.poll().poll(&mut events, None).is_err() {
            coord.set_coordinator_state(CoordinatorState::Finished);
            coord.transport().stop_if_no_clients();
            return;
        }

        let mut stop = false;
        for event in events.iter() {
            match decode_token(event.token().0) {
                Decoded::Wake => {
                    if let Ok(value) = coord.wake().drain() {
                        if WakeEvent::is_stop(value) {
                            stop = true;
                            break;
                        }
                        deliver_all(&coord);
                        coord.mark_ready_and_signal();
                    }
                }
                Decoded::Client(slot, kind) => {
                    if event.readiness().is_error() || event.readiness().is_hup() {
                        handle_close(&coord, slot);
                        continue;
                    }
                    handle_client_event(&coord, slot, kind);
                }
            }
        }

        if stop {
            return;
        }

        post_batch_playback(&coord);
    }
}

/// Delivers every playback client's staged bytes into the mix. Locks
/// `buffer_mutex` once for the whole batch, then `client_mutex` inside
/// it, matching spec §5's lock order.
fn deliver_all<T: Transport + Send + Sync + 'static>(coord: &Arc<Coordinator<T>>) {
    let mix_threshold = coord.mix_threshold_periods();
    let drain_timeout = coord.drain_timeout();
    let active = coord.active_count_atomic();
    let mut armed = Vec::new();
    coord.with_mix(|mix| {
        let mut clients = coord.clients_mutex().lock().expect("client_mutex poisoned");
        for (slot, entry) in clients.iter_mut().enumerate() {
            if let Some(client) = entry {
                if client.role() != Role::Playback {
                    continue;
                }
                let transition = client.deliver(mix, mix_threshold, drain_timeout);
                apply_active_delta(active, transition);
                if let Some(fd) = client.take_pending_drain_fd() {
                    armed.push((slot, fd));
                }
            }
        }
    });
    for (slot, fd) in armed {
        coord.register_drain_fd(slot, fd);
    }
}

fn apply_active_delta(active: &std::sync::atomic::AtomicUsize, transition: Transition) {
    match transition {
        Transition::BecameActive => {
            active.fetch_add(1, Ordering::AcqRel);
        }
        Transition::BecameInactive => {
            active.fetch_sub(1, Ordering::AcqRel);
        }
        Transition::Finished(true) => {
            active.fetch_sub(1, Ordering::AcqRel);
        }
        _ => {}
    }
}

/// Dispatches one client event. Lock order follows spec §5:
/// `buffer_mutex` (via [`Coordinator::with_mix`]) is acquired before
/// `client_mutex`, never the reverse -- a `Control` event's `Pause`
/// handler needs a read-only borrow of the mix to compute its phase
/// delay, everything else ignores the closure's `mix` argument.
fn handle_client_event<T: Transport + Send + Sync + 'static>(
    coord: &Arc<Coordinator<T>>,
    slot: usize,
    kind: EventKind,
) {
    let run = |mix: Option<&crate::mixbuffer::RingMixBuffer>| {
        let mut clients = coord.clients_mutex().lock().expect("client_mutex poisoned");
        match clients.get_mut(slot) {
            Some(Some(client)) => Some(client.handle_event(kind, mix)),
            _ => None,
        }
    };

    let transition = match coord.with_mix(|mix| run(Some(&*mix))) {
        Some(t) => t,
        None => run(None),
    };

    if let Some(transition) = transition {
        apply_active_delta(coord.active_count_atomic(), transition);
        if matches!(transition, Transition::Finished(_)) {
            coord.reap_slot(slot);
        }
    }
}

fn handle_close<T: Transport + Send + Sync + 'static>(coord: &Arc<Coordinator<T>>, slot: usize) {
    let mut clients = coord.clients_mutex().lock().expect("client_mutex poisoned");
    if let Some(Some(client)) = clients.get_mut(slot) {
        let transition = client.handle_close_event();
        apply_active_delta(coord.active_count_atomic(), transition);
    }
    drop(clients);
    coord.reap_slot(slot);
}

fn post_batch_playback<T: Transport + Send + Sync + 'static>(coord: &Arc<Coordinator<T>>) {
    let client_count = coord.client_count();
    if client_count == 0 {
        coord.set_coordinator_state(CoordinatorState::Finished);
        coord.clear_buffer();
        coord.transport().stop_if_no_clients();
        return;
    }

    if client_count == 1 {
        let mut clients = coord.clients_mutex().lock().expect("client_mutex poisoned");
        let lone_drop = clients
            .iter_mut()
            .flatten()
            .next()
            .map(|c| c.drop_requested())
            .unwrap_or(false);
        drop(clients);
        if lone_drop {
            coord.clear_buffer();
            coord.transport().pcm_drop();
        }
    }

    match coord.state() {
        CoordinatorState::Init => {
            if coord.active_count() > 0 {
                deliver_all(coord);
                if coord.mix_at_threshold() {
                    coord.set_coordinator_state(CoordinatorState::Running);
                    let _ = coord.wake().notify();
                }
            }
        }
        CoordinatorState::Running => {
            if coord.mix_empty() {
                coord.set_coordinator_state(CoordinatorState::Init);
            } else {
                let _ = coord.wake().notify();
            }
        }
        _ => {}
    }
}

/// **Snoop worker** (capture): watches for client hang-up directly and
/// resumes the transport once a paused stream gains an active client.
pub fn run_snoop_worker<T: Transport + Send + Sync + 'static>(coord: Arc<Coordinator<T>>) {
    let mut events = Events::with_capacity(64);
    loop {
        if coord.poll().poll(&mut events, None).is_err() {
            coord.set_coordinator_state(CoordinatorState::Finished);
            coord.transport().stop_if_no_clients();
            return;
        }

        let mut stop = false;
        for event in events.iter() {
            match decode_token(event.token().0) {
                Decoded::Wake => {
                    if let Ok(value) = coord.wake().drain() {
                        if WakeEvent::is_stop(value) {
                            stop = true;
                            break;
                        }
                    }
                }
                Decoded::Client(slot, kind) => {
                    if event.readiness().is_error() || event.readiness().is_hup() {
                        handle_close(&coord, slot);
                        if coord.client_count() == 0 {
                            coord.set_coordinator_state(CoordinatorState::Finished);
                            coord.transport().stop_if_no_clients();
                        }
                        continue;
                    }
                    handle_client_event(&coord, slot, kind);
                }
            }
        }

        if stop {
            return;
        }

        if coord.state() == CoordinatorState::Paused && coord.active_count() > 0 {
            coord.set_coordinator_state(CoordinatorState::Running);
            coord.transport().pcm_resume();
        }
    }
}
