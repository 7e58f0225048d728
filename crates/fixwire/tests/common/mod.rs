#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    rc::Rc,
    sync::{Arc, Mutex},
};

use fixwire::{
    ConnectionId, DisconnectReason, EngineConfig, EngineError, ErrorSink, FixSenderEndpoint,
    LibraryId,
    bus::{Action, InboundPublisher, MessageTimingSink},
    channel::Channel,
    counters::SenderCounters,
};
use fixwire_timing::Nanos;

pub const CONN: ConnectionId = 11;
pub const LIB: LibraryId = 7;

#[derive(Default)]
pub struct ChannelState {
    /// Per-call acceptance budgets. When exhausted, `stalled` decides.
    pub accepts: VecDeque<usize>,
    /// With no scripted budget: accept nothing (true) or everything (false).
    pub stalled: bool,
    pub fail_next: Option<io::ErrorKind>,
    pub written: Vec<u8>,
    /// One `(seq, replay, accepted)` record per write call.
    pub writes: Vec<(u32, bool, usize)>,
    pub burst_notices: Vec<u64>,
    pub closed: bool,
}

/// In-memory channel with a scriptable kernel.
#[derive(Clone, Default)]
pub struct ScriptedChannel(pub Rc<RefCell<ChannelState>>);

impl ScriptedChannel {
    pub fn accept_next(&self, budgets: impl IntoIterator<Item = usize>) {
        self.0.borrow_mut().accepts.extend(budgets);
    }

    pub fn stall(&self, stalled: bool) {
        self.0.borrow_mut().stalled = stalled;
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    pub fn burst_notices(&self) -> Vec<u64> {
        self.0.borrow().burst_notices.clone()
    }
}

impl Channel for ScriptedChannel {
    fn write(&mut self, buf: &[u8], seq: u32, replay: bool) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        if let Some(kind) = state.fail_next.take() {
            return Err(kind.into());
        }
        let n = match state.accepts.pop_front() {
            Some(budget) => budget.min(buf.len()),
            None if state.stalled => 0,
            None => buf.len(),
        };
        state.written.extend_from_slice(&buf[..n]);
        state.writes.push((seq, replay, n));
        Ok(n)
    }

    fn on_replay_complete(&mut self, correlation_id: u64) {
        self.0.borrow_mut().burst_notices.push(correlation_id);
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed = true;
    }
}

/// Bus recording everything it is offered; replay-complete offers consume a
/// scripted action queue (empty queue continues).
#[derive(Default)]
pub struct RecordingBus {
    pub replay_actions: VecDeque<Action>,
    pub replay_attempts: usize,
    /// Offers that went through.
    pub replay_completes: Vec<(ConnectionId, u64)>,
    pub slow_events: Vec<bool>,
    pub disconnects: Vec<(LibraryId, ConnectionId, DisconnectReason)>,
    pub messages: Vec<Vec<u8>>,
}

impl InboundPublisher for RecordingBus {
    fn try_replay_complete(&mut self, connection_id: ConnectionId, correlation_id: u64) -> Action {
        self.replay_attempts += 1;
        let action = self.replay_actions.pop_front().unwrap_or(Action::Continue);
        if action == Action::Continue {
            self.replay_completes.push((connection_id, correlation_id));
        }
        action
    }

    fn on_slow_status(&mut self, _library_id: LibraryId, _connection_id: ConnectionId, slow: bool) {
        self.slow_events.push(slow);
    }

    fn on_message(&mut self, _connection_id: ConnectionId, frame: &[u8]) {
        self.messages.push(frame.to_vec());
    }

    fn on_disconnect(
        &mut self,
        library_id: LibraryId,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    ) {
        self.disconnects.push((library_id, connection_id, reason));
    }
}

/// Shared-handle timing sink.
#[derive(Clone, Default)]
pub struct TimingLog(pub Rc<RefCell<Vec<(u32, ConnectionId, Vec<u8>)>>>);

impl TimingLog {
    pub fn seqs(&self) -> Vec<u32> {
        self.0.borrow().iter().map(|(seq, _, _)| *seq).collect()
    }
}

impl MessageTimingSink for TimingLog {
    fn on_message(&mut self, seq: u32, connection_id: ConnectionId, meta: &[u8]) {
        self.0.borrow_mut().push((seq, connection_id, meta.to_vec()));
    }
}

/// Error sink capturing rendered errors.
#[derive(Default)]
pub struct CollectingSink(pub Mutex<Vec<String>>);

impl ErrorSink for CollectingSink {
    fn on_error(&self, _connection_id: ConnectionId, error: &EngineError) {
        self.0.lock().unwrap().push(error.to_string());
    }
}

/// Well-formed FIX message from `|`-delimited body fields.
pub fn fix_msg(body: &str) -> Vec<u8> {
    let body = body.replace('|', "\x01");
    let mut msg = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
    let checksum = msg.iter().fold(0_u8, |acc, b| acc.wrapping_add(*b));
    msg.extend_from_slice(format!("10={checksum:03}\x01").as_bytes());
    msg
}

/// A FIX sender endpoint wired to scriptable fakes, created at t=0.
pub struct Harness {
    pub chan: ScriptedChannel,
    pub timing: TimingLog,
    pub counters: Arc<SenderCounters>,
    pub errors: Arc<CollectingSink>,
    pub bus: RecordingBus,
    pub sender: FixSenderEndpoint<ScriptedChannel>,
}

impl Harness {
    pub fn new(config: &EngineConfig) -> Self {
        let chan = ScriptedChannel::default();
        let timing = TimingLog::default();
        let counters = SenderCounters::new_shared();
        let errors = Arc::new(CollectingSink::default());
        let sender = FixSenderEndpoint::new(
            CONN,
            LIB,
            chan.clone(),
            config,
            counters.clone(),
            errors.clone(),
            Some(Box::new(timing.clone())),
            Nanos::ZERO,
        );
        Self { chan, timing, counters, errors, bus: RecordingBus::default(), sender }
    }
}
