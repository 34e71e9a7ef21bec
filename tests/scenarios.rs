//! End-to-end scenarios against the Client Endpoint and Ring-Mix
//! Buffer, driven over real fds the way a host transport would drive
//! them, numbered to match the scenarios they exercise.

mod common;

use std::time::Duration;

use nix::unistd;

use common::{endpoint, DRAIN_TIMEOUT};
use pcm_multi::client::{ClientEndpoint, ClientState, EventKind, Role};
use pcm_multi::format::SampleFormat;
use pcm_multi::mixbuffer::RingMixBuffer;

const CHANNELS: u8 = 2;
const PERIOD_FRAMES: usize = 240;
const FRAME_SIZE: usize = 4; // S16LE stereo
const PERIOD_BYTES: usize = PERIOD_FRAMES * FRAME_SIZE;
const MIX_THRESHOLD: usize = 4;
const CLIENT_THRESHOLD: usize = 2;

fn mix() -> RingMixBuffer {
    RingMixBuffer::init(
        SampleFormat::S16LE,
        CHANNELS,
        16 * PERIOD_FRAMES,
        PERIOD_FRAMES,
        MIX_THRESHOLD,
    )
    .unwrap()
}

fn sine_frames(periods: usize, amplitude: i16, phase_deg: f64) -> Vec<u8> {
    let total_frames = periods * PERIOD_FRAMES;
    let mut out = Vec::with_capacity(total_frames * FRAME_SIZE);
    for n in 0..total_frames {
        let theta = phase_deg.to_radians() + 2.0 * std::f64::consts::PI * (n as f64) / 48.0;
        let sample = (theta.sin() * amplitude as f64).round() as i16;
        out.extend_from_slice(&sample.to_le_bytes());
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Alternately admits staged bytes into `mix` and drains `mix` into
/// `out`, the way the worker and transport threads take turns, until
/// `out` holds `want_bytes` or the iteration budget runs out.
fn pump(client: &mut ClientEndpoint, mix: &mut RingMixBuffer, want_bytes: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut scratch = vec![0u8; mix.period() * 2];
    for _ in 0..64 {
        client.deliver(mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
        loop {
            let produced = mix.read(&mut scratch, mix.period(), &[1.0, 1.0]);
            if produced == 0 {
                break;
            }
            let bytes = produced * 2; // S16LE: 2 bytes/sample
            out.extend_from_slice(&scratch[..bytes]);
        }
        if out.len() >= want_bytes {
            break;
        }
    }
    out
}

#[test]
fn scenario_1_single_client_sine_is_bit_exact() {
    let (mut client, data_w, _ctrl) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);
    let input = sine_frames(10, 10_000, 0.0);
    unistd::write(data_w, &input).unwrap();

    let mut mix = mix();
    let out = pump(&mut client, &mut mix, input.len());

    assert_eq!(out.len(), input.len());
    assert_eq!(out, input, "unity-gain single client must reproduce input bit-exactly");
}

#[test]
fn scenario_2_two_clients_sum_without_clipping() {
    let (mut a, data_a, _c_a) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);
    let (mut b, data_b, _c_b) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);

    let frame_a = [10_000i16.to_le_bytes(), 10_000i16.to_le_bytes()].concat();
    let frame_b = [(-5_000i16).to_le_bytes(), (-5_000i16).to_le_bytes()].concat();
    let mut payload_a = Vec::new();
    let mut payload_b = Vec::new();
    for _ in 0..6 * PERIOD_FRAMES {
        payload_a.extend_from_slice(&frame_a);
        payload_b.extend_from_slice(&frame_b);
    }
    unistd::write(data_a, &payload_a).unwrap();
    unistd::write(data_b, &payload_b).unwrap();

    let mut mix = mix();
    let mut out = Vec::new();
    let mut scratch = vec![0u8; mix.period() * 2];
    for _ in 0..64 {
        a.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
        b.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
        loop {
            let produced = mix.read(&mut scratch, mix.period(), &[1.0, 1.0]);
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&scratch[..produced * 2]);
        }
        if out.len() >= payload_a.len() {
            break;
        }
    }

    assert!(!out.is_empty());
    for chunk in out.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        assert_eq!(sample, 5_000);
    }
}

#[test]
fn scenario_3_three_clients_clip_at_int16_max() {
    let mut clients = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..3 {
        let (c, w, _ctrl) =
            endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);
        clients.push(c);
        writers.push(w);
    }

    let frame = [20_000i16.to_le_bytes(), 20_000i16.to_le_bytes()].concat();
    let mut payload = Vec::new();
    for _ in 0..6 * PERIOD_FRAMES {
        payload.extend_from_slice(&frame);
    }
    for w in &writers {
        unistd::write(*w, &payload).unwrap();
    }

    let mut mix = mix();
    let mut out = Vec::new();
    let mut scratch = vec![0u8; mix.period() * 2];
    for _ in 0..64 {
        for c in clients.iter_mut() {
            c.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
        }
        loop {
            let produced = mix.read(&mut scratch, mix.period(), &[1.0, 1.0]);
            if produced == 0 {
                break;
            }
            out.extend_from_slice(&scratch[..produced * 2]);
        }
        if out.len() >= payload.len() {
            break;
        }
    }

    assert!(!out.is_empty());
    for chunk in out.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        assert_eq!(sample, i16::MAX, "60000 must clip to INT16_MAX, not wrap or average");
    }
}

#[test]
fn scenario_4_drain_round_trip_replies_ok_within_timeout() {
    let (mut client, data_w, ctrl_w) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);

    let frame = [0u8; FRAME_SIZE];
    let mut payload = Vec::new();
    for _ in 0..3 * PERIOD_FRAMES {
        payload.extend_from_slice(&frame);
    }
    unistd::write(data_w, &payload).unwrap();

    let mut mix = mix();
    client.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    assert_eq!(client.state(), ClientState::Running);

    unistd::write(ctrl_w, b"Drain").unwrap();
    client.handle_event(EventKind::Control, Some(&mix));
    assert_eq!(client.state(), ClientState::Draining1);

    // admit the staged periods, then let the mix drain them, then
    // observe DRAINING1's completion condition -- the same three-step
    // dance the worker and transport threads perform independently.
    client.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    let mut scratch = vec![0u8; mix.period() * 2];
    while mix.read(&mut scratch, mix.period(), &[1.0, 1.0]) > 0 {}
    client.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    assert_eq!(client.state(), ClientState::Draining2);

    // "within 300ms + one period time": sleep past the drain timeout,
    // then fire the timer event exactly once.
    std::thread::sleep(DRAIN_TIMEOUT + Duration::from_millis(20));
    client.handle_event(EventKind::Drain, None);
    assert_eq!(client.state(), ClientState::Idle);

    let mut reply = [0u8; 2];
    let n = unistd::read(ctrl_w, &mut reply).expect("control pipe must carry the OK reply");
    assert_eq!(&reply[..n], b"OK");
}

#[test]
fn scenario_5_pause_resume_preserves_forward_phase() {
    let (mut paused, data_p, ctrl_p) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);
    let (mut advancing, data_adv, _ctrl_adv) =
        endpoint(Role::Playback, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);

    let frame = [1_000i16.to_le_bytes(), 1_000i16.to_le_bytes()].concat();
    let mut payload = Vec::new();
    for _ in 0..8 * PERIOD_FRAMES {
        payload.extend_from_slice(&frame);
    }
    unistd::write(data_p, &payload).unwrap();
    unistd::write(data_adv, &payload).unwrap();

    let mut mix = mix();
    // bring both clients to RUNNING and admit one period's worth.
    paused.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    advancing.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    paused.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    advancing.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
    assert_eq!(paused.state(), ClientState::Running);

    unistd::write(ctrl_p, b"Pause").unwrap();
    paused.handle_event(EventKind::Control, Some(&mix));
    assert_eq!(paused.state(), ClientState::Paused);
    let delay_before = paused.forward_delay(&mix);

    // two periods pass; only the advancing client keeps admitting and
    // the mix keeps being read, so mix_offset moves without the paused
    // client's involvement.
    let mut scratch = vec![0u8; mix.period() * 2];
    for _ in 0..2 {
        advancing.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT);
        mix.read(&mut scratch, mix.period(), &[1.0, 1.0]);
        paused.deliver(&mut mix, MIX_THRESHOLD, DRAIN_TIMEOUT); // no-op while PAUSED
    }

    unistd::write(ctrl_p, b"Resume").unwrap();
    paused.handle_event(EventKind::Control, Some(&mix));
    assert_eq!(paused.state(), ClientState::Running);

    // before any further admission happens, the position a subsequent
    // `add` would resolve to must sit the same forward distance ahead
    // of the (now advanced) mix_offset as it was before the pause.
    let delay_after = paused.forward_delay(&mix);
    assert_eq!(delay_before, delay_after, "pause/resume must preserve forward phase");
}

#[test]
fn scenario_6_capture_fanout_isolates_a_slow_client() {
    let (mut prompt, data_prompt, _c1) =
        endpoint(Role::Capture, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);
    let (mut slow, data_slow, _c2) =
        endpoint(Role::Capture, FRAME_SIZE, CHANNELS, PERIOD_BYTES, CLIENT_THRESHOLD);

    let frame = [4_000i16.to_le_bytes(), 4_000i16.to_le_bytes()].concat();

    // `slow`'s test-side read end (`data_slow`) is never drained, so
    // after enough fan-out writes its pipe fills and `write()` starts
    // observing EAGAIN internally -- exactly the overrun `write()` must
    // survive without blocking or tearing the client down.
    for _ in 0..20_000 {
        slow.write(&frame);
    }
    assert_eq!(slow.state(), ClientState::Running, "an overrun drops frames, it does not finish the client");
    let _ = data_slow; // intentionally never read from, simulating the slow consumer

    // the prompt client keeps its pipe drained and must receive every
    // frame fanned out to it afterward, unaffected by the other
    // client's backpressure.
    for _ in 0..10 {
        let transition = prompt.write(&frame);
        assert_eq!(transition, pcm_multi::client::Transition::None);
        let mut got = [0u8; FRAME_SIZE];
        let n = unistd::read(data_prompt, &mut got).expect("prompt client must not be starved");
        assert_eq!(n, FRAME_SIZE);
        assert_eq!(&got[..], &frame[..]);
    }

    assert_eq!(prompt.state(), ClientState::Running, "prompt client must never be torn down");
}
