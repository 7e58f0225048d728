mod common;

use common::{Harness, LIB};
use fixwire::{ConnState, DisconnectReason, EngineConfig};
use fixwire_timing::Nanos;

fn now(ms: u64) -> Nanos {
    Nanos::from_millis(ms)
}

fn config(max_bytes: usize, timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        max_bytes_in_buffer: max_bytes,
        slow_consumer_timeout: Nanos::from_millis(timeout_ms),
        ..EngineConfig::default()
    }
}

/// Queued message frames carry a fixed header and meta-length word around
/// the body.
const FRAME_OVERHEAD: usize = 16;

#[test]
fn backlog_overflow_disconnects_on_the_byte_after_the_limit() {
    let mut h = Harness::new(&config(100, 5_000));
    h.chan.stall(true);

    // exactly at the limit: still alive
    let body = vec![b'x'; 100 - FRAME_OVERHEAD];
    let state = h.sender.on_outbound_message(LIB, 1, &body, b"", now(1), &mut h.bus);
    assert_eq!(state, ConnState::Alive);
    assert!(h.sender.requires_retry());
    assert_eq!(h.counters.bytes_in_buffer.get(), 100);

    // one more frame tips it over
    let state = h.sender.on_outbound_message(LIB, 2, b"y", b"", now(2), &mut h.bus);
    assert_eq!(state, ConnState::Disconnected(DisconnectReason::SlowConsumer));

    // nothing reaches the socket afterwards
    h.chan.stall(false);
    assert_eq!(h.sender.on_outbound_message(LIB, 3, b"z", b"", now(3), &mut h.bus), ConnState::Alive);
    assert_eq!(h.sender.poll(now(4), &mut h.bus), ConnState::Alive);
    assert!(h.chan.written().is_empty());
}

#[test]
fn stalled_backlog_trips_the_timeout() {
    let mut h = Harness::new(&config(10_000, 5_000));
    h.chan.stall(true);

    assert_eq!(h.sender.on_outbound_message(LIB, 1, b"hello", b"", now(0), &mut h.bus), ConnState::Alive);
    assert!(h.sender.is_slow_consumer());

    assert_eq!(h.sender.poll(now(4_999), &mut h.bus), ConnState::Alive);
    assert_eq!(
        h.sender.poll(now(5_001), &mut h.bus),
        ConnState::Disconnected(DisconnectReason::SlowConsumer)
    );
}

#[test]
fn any_accepted_byte_rearms_the_timeout() {
    let mut h = Harness::new(&config(10_000, 5_000));
    h.chan.stall(true);

    assert_eq!(
        h.sender.on_outbound_message(LIB, 1, b"0123456789", b"", now(0), &mut h.bus),
        ConnState::Alive
    );

    // a single byte of progress at t=1s pushes the deadline to t=6s
    h.chan.accept_next([1]);
    assert_eq!(h.sender.poll(now(1_000), &mut h.bus), ConnState::Alive);
    assert!(h.sender.is_slow_consumer());

    assert_eq!(h.sender.poll(now(5_500), &mut h.bus), ConnState::Alive);
    assert_eq!(
        h.sender.poll(now(6_001), &mut h.bus),
        ConnState::Disconnected(DisconnectReason::SlowConsumer)
    );
}

#[test]
fn draining_fully_clears_the_slow_state() {
    let mut h = Harness::new(&config(10_000, 5_000));
    h.chan.stall(true);

    assert_eq!(h.sender.on_outbound_message(LIB, 1, b"hello", b"", now(0), &mut h.bus), ConnState::Alive);
    assert!(h.sender.is_slow_consumer());

    h.chan.stall(false);
    assert_eq!(h.sender.poll(now(4_000), &mut h.bus), ConnState::Alive);
    assert!(!h.sender.is_slow_consumer());

    // well past the original deadline: no longer slow, no disconnect
    assert_eq!(h.sender.poll(now(60_000), &mut h.bus), ConnState::Alive);
    assert_eq!(h.bus.slow_events, vec![true, false]);
}
