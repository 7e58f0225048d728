use std::sync::Arc;

use fixwire_timing::Nanos;
use tracing::{debug, info, warn};

use crate::{
    ConnectionId, LibraryId, SessionId,
    buffer::{
        FrameTag, MARKER_LEN, MSG_BODY_LEN_OFFSET, MSG_BODY_OFFSET, MSG_SEQ_OFFSET, ReattemptBuffer,
        TAG_LEN, message_frame_len,
    },
    bus::{Action, InboundPublisher, MessageTimingSink},
    channel::Channel,
    config::EngineConfig,
    counters::SenderCounters,
    error::{ConnState, DisconnectReason, EngineError, ErrorSink},
    sender::{NOT_LAST_REPLAY_MSG, SenderCore},
    throttle::{SessionKey, ThrottleRejectBuilder},
};

const DEFAULT_THROTTLE_WINDOW: Nanos = Nanos::from_secs(1);
const DEFAULT_THROTTLE_LIMIT: usize = 100;

/// FIX sender endpoint: multiplexes the live stream and the replay stream
/// onto one non-blocking socket.
///
/// A frame is written straight to the socket only when it belongs to the
/// active stream and nothing is pending anywhere; everything else is queued
/// on its stream's retry buffer and drained FIFO by `poll`. The two streams
/// only alternate at replay burst boundaries.
pub struct FixSenderEndpoint<C: Channel> {
    core: SenderCore<C>,
    /// Queued live traffic.
    normal: ReattemptBuffer,
    /// Queued replay traffic, including burst start/complete markers.
    replay: ReattemptBuffer,
    /// True while the replay stream is the active one.
    replaying: bool,
    replay_correlation_id: u64,
    /// True iff either retry buffer holds bytes.
    requires_retry: bool,
    /// Bytes of the head-of-queue frame already accepted by the kernel in
    /// earlier attempts. Only meaningful while a frame sits at offset 0 of
    /// the active stream's buffer (or is being written directly).
    reattempt_bytes_written: usize,
    closed: bool,
    session_id: Option<SessionId>,
    session_key: Option<SessionKey>,
    throttle: Option<ThrottleRejectBuilder>,
    throttle_window: Nanos,
    throttle_limit: usize,
    timing: Option<Box<dyn MessageTimingSink>>,
}

impl<C: Channel> FixSenderEndpoint<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: ConnectionId,
        library_id: LibraryId,
        channel: C,
        config: &EngineConfig,
        counters: Arc<SenderCounters>,
        errors: Arc<dyn ErrorSink>,
        timing: Option<Box<dyn MessageTimingSink>>,
        now: Nanos,
    ) -> Self {
        Self {
            core: SenderCore::new(
                connection_id,
                library_id,
                channel,
                config,
                counters,
                errors,
                now,
            ),
            normal: ReattemptBuffer::new(),
            replay: ReattemptBuffer::new(),
            replaying: false,
            replay_correlation_id: 0,
            requires_retry: false,
            reattempt_bytes_written: 0,
            closed: false,
            session_id: None,
            session_key: None,
            throttle: None,
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            timing,
        }
    }

    /// A live message from the owning library.
    pub fn on_outbound_message(
        &mut self,
        library_id: LibraryId,
        seq: u32,
        body: &[u8],
        meta: &[u8],
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed || !self.gate(library_id) {
            return ConnState::Alive;
        }
        self.attempt_message(seq, body, meta, false, now, bus)
    }

    /// A frame from the archive reader. Every frame of a burst carries
    /// [`NOT_LAST_REPLAY_MSG`] except the terminal one, which carries its
    /// real sequence number.
    pub fn on_replay_message(
        &mut self,
        seq: u32,
        body: &[u8],
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed {
            return ConnState::Alive;
        }
        self.attempt_message(seq, body, &[], true, now, bus)
    }

    /// A replay burst is about to begin.
    pub fn on_start_replay(
        &mut self,
        correlation_id: u64,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed {
            return ConnState::Alive;
        }
        if self.replaying || self.requires_retry {
            self.replay.append_marker(FrameTag::StartReplay, correlation_id);
            let usage = self.replay.usage();
            self.after_append(true, usage, bus)
        } else {
            debug!(correlation_id, "replay burst started");
            self.replaying = true;
            self.replay_correlation_id = correlation_id;
            ConnState::Alive
        }
    }

    /// Terminal sentinel of a replay burst from the archive reader.
    pub fn on_replay_complete(
        &mut self,
        correlation_id: u64,
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed {
            return ConnState::Alive;
        }
        // A completion for a burst that is still queued behind the current
        // backlog: park it in order, it is finalized when drained.
        if !self.replaying && self.replay_correlation_id != correlation_id {
            self.replay.append_marker(FrameTag::ReplayComplete, correlation_id);
            let usage = self.replay.usage();
            return self.after_append(true, usage, bus);
        }
        match self.process_reattempt_buffer(true, now, bus) {
            Ok(true) => {
                // The drain may have adopted a queued follow-up burst; only
                // leave the replay stream if this burst is still the one.
                if self.replay_correlation_id == correlation_id {
                    self.replaying = false;
                }
                self.core.channel_mut().on_replay_complete(correlation_id);
                let active_usage =
                    if self.replaying { self.replay.usage() } else { self.normal.usage() };
                self.core.publish_bytes_in_buffer(active_usage);
                if self.requires_retry && self.normal.is_empty() && self.replay.is_empty() {
                    self.requires_retry = false;
                    self.core.send_slow_status(false, bus);
                }
                ConnState::Alive
            }
            Ok(false) => {
                self.replay.append_marker(FrameTag::ReplayComplete, correlation_id);
                let usage = self.replay.usage();
                self.after_append(true, usage, bus)
            }
            Err(reason) => ConnState::Disconnected(reason),
        }
    }

    /// Builds a Business Message Reject for a throttled message and sends it
    /// through the live stream. Encoding problems drop the reject, never the
    /// connection.
    #[allow(clippy::too_many_arguments)]
    pub fn on_throttle_reject(
        &mut self,
        library_id: LibraryId,
        ref_msg_type: &[u8],
        ref_seq_num: u32,
        seq: u32,
        reject_ref_id: &[u8],
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed || !self.gate(library_id) {
            return ConnState::Alive;
        }
        let mut builder = match self.throttle.take() {
            Some(builder) => builder,
            None => {
                let Some(key) = self.session_key.clone() else {
                    self.core.report(&EngineError::RejectNotConfigured);
                    return ConnState::Alive;
                };
                ThrottleRejectBuilder::new(key, self.throttle_window, self.throttle_limit)
            }
        };
        let state = match builder.encode(seq, ref_msg_type, ref_seq_num, reject_ref_id, now) {
            Ok(frame) => self.attempt_message(seq, frame, &[], false, now, bus),
            Err(err) => {
                warn!(%err, "skipping throttle reject");
                ConnState::Alive
            }
        };
        self.throttle = Some(builder);
        state
    }

    /// Observational only; the resend controller drives the actual replay.
    pub fn on_valid_resend_request(&mut self, correlation_id: u64) {
        info!(
            connection_id = self.core.connection_id(),
            correlation_id, "valid resend request received"
        );
    }

    pub fn configure_throttle(&mut self, window: Nanos, limit: usize) {
        self.throttle_window = window;
        self.throttle_limit = limit;
        if let Some(builder) = &mut self.throttle {
            builder.configure(window, limit);
        }
    }

    /// Session identity, set once at logon.
    pub fn on_logon(&mut self, session_id: SessionId, key: SessionKey) {
        debug!(connection_id = self.core.connection_id(), session_id, "session established");
        self.session_id = Some(session_id);
        self.session_key = Some(key);
    }

    /// Drains retry buffers and runs the slow-consumer watchdog.
    pub fn poll(&mut self, now: Nanos, bus: &mut dyn InboundPublisher) -> ConnState {
        if self.closed {
            return ConnState::Alive;
        }
        if self.requires_retry {
            if let Err(reason) = self.reattempt(now, bus) {
                return ConnState::Disconnected(reason);
            }
        }
        if self.core.is_slow_consumer() && self.core.timed_out(now) {
            warn!(
                connection_id = self.core.connection_id(),
                "no forward progress within the slow-consumer timeout, disconnecting"
            );
            self.closed = true;
            return ConnState::Disconnected(DisconnectReason::SlowConsumer);
        }
        ConnState::Alive
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.core.close();
    }

    #[inline]
    pub fn is_slow_consumer(&self) -> bool {
        self.core.is_slow_consumer()
    }

    #[inline]
    pub fn library_id(&self) -> LibraryId {
        self.core.library_id()
    }

    #[inline]
    pub fn bind_library(&mut self, library_id: LibraryId) {
        self.core.bind_library(library_id);
    }

    #[inline]
    pub fn channel_mut(&mut self) -> &mut C {
        self.core.channel_mut()
    }

    #[inline]
    pub fn replaying(&self) -> bool {
        self.replaying
    }

    #[inline]
    pub fn requires_retry(&self) -> bool {
        self.requires_retry
    }

    #[inline]
    pub fn reattempt_bytes_written(&self) -> usize {
        self.reattempt_bytes_written
    }

    fn gate(&self, library_id: LibraryId) -> bool {
        if library_id == self.core.library_id() {
            return true;
        }
        self.core.counters().invalid_library_attempts.increment();
        debug!(
            got = library_id,
            bound = self.core.library_id(),
            "dropping submission from stale library"
        );
        false
    }

    /// Write-or-enqueue for one frame of either stream.
    fn attempt_message(
        &mut self,
        seq: u32,
        body: &[u8],
        meta: &[u8],
        replay: bool,
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if replay != self.replaying || self.requires_retry {
            return self.enqueue_message(seq, body, meta, replay, bus);
        }
        if self.check_last_replayed_message(seq, replay, bus) {
            // bus back-pressured the completion signal; park the frame with
            // its real seq so the handshake reruns on retry
            return self.enqueue_message(seq, body, meta, replay, bus);
        }
        match self.core.write(body, seq, replay, now) {
            Ok(written) => {
                let total = self.reattempt_bytes_written + written;
                if total < body.len() {
                    debug!(written = total, body_len = body.len(), "partial write, queueing frame");
                    self.reattempt_bytes_written = total;
                    let enq_seq = if replay { NOT_LAST_REPLAY_MSG } else { seq };
                    self.enqueue_message(enq_seq, body, meta, replay, bus)
                } else {
                    self.reattempt_bytes_written = 0;
                    if !replay && let Some(timing) = self.timing.as_mut() {
                        timing.on_message(seq, self.core.connection_id(), meta);
                    }
                    ConnState::Alive
                }
            }
            Err(err) => {
                self.core.report(&err.into());
                self.closed = true;
                ConnState::Disconnected(DisconnectReason::Exception)
            }
        }
    }

    fn enqueue_message(
        &mut self,
        seq: u32,
        body: &[u8],
        meta: &[u8],
        replay: bool,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        let buffer = if replay { &mut self.replay } else { &mut self.normal };
        buffer.append_message(seq, body, meta);
        let usage = buffer.usage();
        self.after_append(replay, usage, bus)
    }

    /// Bookkeeping common to every append: retry flag, counter, slow status,
    /// overflow policy.
    fn after_append(
        &mut self,
        replay: bool,
        usage: usize,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        self.requires_retry = true;
        if replay == self.replaying {
            self.core.publish_bytes_in_buffer(usage);
            self.core.send_slow_status(true, bus);
        }
        if usage > self.core.max_bytes_in_buffer() {
            warn!(
                connection_id = self.core.connection_id(),
                usage,
                max = self.core.max_bytes_in_buffer(),
                "send backlog overflow, disconnecting slow consumer"
            );
            self.closed = true;
            return ConnState::Disconnected(DisconnectReason::SlowConsumer);
        }
        ConnState::Alive
    }

    /// The replay-complete handshake for a candidate frame. True means the
    /// inbound bus back-pressured the signal and the caller must queue the
    /// frame and retry later.
    fn check_last_replayed_message(
        &mut self,
        seq: u32,
        replay: bool,
        bus: &mut dyn InboundPublisher,
    ) -> bool {
        if replay && seq != NOT_LAST_REPLAY_MSG {
            let action =
                bus.try_replay_complete(self.core.connection_id(), self.replay_correlation_id);
            return action == Action::Abort;
        }
        false
    }

    /// One retry round: drain the active stream, then either hand focus to
    /// the other stream or clear the retry state. Returns whether the active
    /// stream is caught up.
    fn reattempt(
        &mut self,
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> Result<bool, DisconnectReason> {
        let active = self.replaying;
        let caught_up = self.process_reattempt_buffer(active, now, bus)?;
        if caught_up && self.requires_retry {
            let other_usage = if active { self.normal.usage() } else { self.replay.usage() };
            if other_usage == 0 {
                self.requires_retry = false;
                self.core.publish_bytes_in_buffer(0);
                self.core.send_slow_status(false, bus);
            } else {
                self.replaying = !active;
                self.core.publish_bytes_in_buffer(other_usage);
            }
        }
        Ok(caught_up)
    }

    /// Walks one stream's buffer from offset 0, writing frames in order, and
    /// compacts off everything fully flushed. Returns caught-up iff the
    /// buffer is empty afterwards.
    fn process_reattempt_buffer(
        &mut self,
        replay: bool,
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> Result<bool, DisconnectReason> {
        let Self {
            core,
            normal,
            replay: replay_stream,
            replaying,
            replay_correlation_id,
            reattempt_bytes_written,
            closed,
            timing,
            ..
        } = self;
        let buffer = if replay { &mut *replay_stream } else { &mut *normal };
        let mut offset = 0;

        loop {
            if offset >= buffer.usage() {
                break;
            }
            let raw_tag = buffer.read_u32(offset);
            match FrameTag::from_raw(raw_tag) {
                Some(FrameTag::Message) => {
                    let seq = buffer.read_u32(offset + MSG_SEQ_OFFSET);
                    if replay && seq != NOT_LAST_REPLAY_MSG {
                        // terminal frame of the burst: the completion
                        // handshake runs before its bytes go out
                        let action =
                            bus.try_replay_complete(core.connection_id(), *replay_correlation_id);
                        if action == Action::Abort {
                            *reattempt_bytes_written = 0;
                            break;
                        }
                        // a retry of this frame must not signal again
                        buffer.write_u32_at(offset + MSG_SEQ_OFFSET, NOT_LAST_REPLAY_MSG);
                    }
                    let body_len = buffer.read_u32(offset + MSG_BODY_LEN_OFFSET) as usize;
                    let body_off = offset + MSG_BODY_OFFSET;
                    let meta_len = buffer.read_u32(body_off + body_len) as usize;
                    let already = *reattempt_bytes_written;
                    let written = match core.write(
                        &buffer.bytes()[body_off + already..body_off + body_len],
                        seq,
                        replay,
                        now,
                    ) {
                        Ok(n) => n,
                        Err(err) => {
                            core.report(&err.into());
                            *closed = true;
                            return Err(DisconnectReason::Exception);
                        }
                    };
                    let total = already + written;
                    if total < body_len {
                        debug!(written = total, body_len, "partial write during retry drain");
                        *reattempt_bytes_written = total;
                        break;
                    }
                    *reattempt_bytes_written = 0;
                    if !replay && let Some(timing) = timing.as_mut() {
                        let meta_off = body_off + body_len + 4;
                        timing.on_message(
                            seq,
                            core.connection_id(),
                            &buffer.bytes()[meta_off..meta_off + meta_len],
                        );
                    }
                    offset += message_frame_len(body_len, meta_len);
                }
                Some(FrameTag::ReplayComplete) => {
                    *reattempt_bytes_written = 0;
                    let correlation_id = buffer.read_u64(offset + TAG_LEN);
                    core.channel_mut().on_replay_complete(correlation_id);
                    offset += MARKER_LEN;
                    // an immediately following start marker chains straight
                    // into the next burst without surfacing the live stream
                    let chains = offset < buffer.usage() &&
                        FrameTag::from_raw(buffer.read_u32(offset)) == Some(FrameTag::StartReplay);
                    if !chains {
                        *replaying = false;
                        *replay_correlation_id = correlation_id;
                        break;
                    }
                }
                Some(FrameTag::StartReplay) => {
                    // adopt the queued burst so its terminal frame signals
                    // the right correlation id
                    *reattempt_bytes_written = 0;
                    *replaying = true;
                    *replay_correlation_id = buffer.read_u64(offset + TAG_LEN);
                    offset += MARKER_LEN;
                }
                None => {
                    core.report(&EngineError::CorruptRetryBuffer { tag: raw_tag, offset });
                    *closed = true;
                    return Err(DisconnectReason::Exception);
                }
            }
        }

        let usage = buffer.shuffle(offset);
        let active_usage = if *replaying { replay_stream.usage() } else { normal.usage() };
        core.publish_bytes_in_buffer(active_usage);
        Ok(usage == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io, rc::Rc};

    use super::*;

    #[derive(Default)]
    struct PipeState {
        written: Vec<u8>,
        burst_notices: Vec<u64>,
    }

    /// Channel accepting everything, recording bytes per stream boundary.
    #[derive(Clone, Default)]
    struct Pipe(Rc<RefCell<PipeState>>);

    impl Channel for Pipe {
        fn write(&mut self, buf: &[u8], _seq: u32, _replay: bool) -> io::Result<usize> {
            self.0.borrow_mut().written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn on_replay_complete(&mut self, correlation_id: u64) {
            self.0.borrow_mut().burst_notices.push(correlation_id);
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct NullBus;

    impl InboundPublisher for NullBus {
        fn try_replay_complete(&mut self, _: ConnectionId, _: u64) -> Action {
            Action::Continue
        }
        fn on_slow_status(&mut self, _: LibraryId, _: ConnectionId, _: bool) {}
        fn on_message(&mut self, _: ConnectionId, _: &[u8]) {}
        fn on_disconnect(&mut self, _: LibraryId, _: ConnectionId, _: DisconnectReason) {}
    }

    fn endpoint(pipe: Pipe) -> FixSenderEndpoint<Pipe> {
        FixSenderEndpoint::new(
            1,
            7,
            pipe,
            &EngineConfig::default(),
            SenderCounters::new_shared(),
            crate::error::log_error_sink(),
            None,
            Nanos::ZERO,
        )
    }

    #[test]
    fn corrupt_queued_frame_disconnects() {
        let pipe = Pipe::default();
        let mut sender = endpoint(pipe);
        let mut bus = NullBus;

        sender.replay.reserve_append(4).copy_from_slice(&99_u32.to_le_bytes());
        sender.requires_retry = true;
        sender.replaying = true;

        let state = sender.poll(Nanos::from_millis(1), &mut bus);
        assert_eq!(state, ConnState::Disconnected(DisconnectReason::Exception));

        // a dead endpoint swallows further submissions
        let state = sender.on_outbound_message(7, 2, b"x", &[], Nanos::from_millis(2), &mut bus);
        assert_eq!(state, ConnState::Alive);
    }

    #[test]
    fn queued_burst_adopts_marker_correlation_id() {
        let pipe = Pipe::default();
        let mut sender = endpoint(pipe.clone());
        let mut bus = NullBus;
        let now = Nanos::from_millis(1);

        // queue a full burst behind a live message so nothing flushes direct
        sender.normal.append_message(5, b"live", &[]);
        sender.requires_retry = true;
        assert_eq!(sender.on_start_replay(42, &mut bus), ConnState::Alive);
        assert_eq!(sender.on_replay_message(NOT_LAST_REPLAY_MSG, b"r1", now, &mut bus), ConnState::Alive);
        assert_eq!(sender.on_replay_message(9, b"r2", now, &mut bus), ConnState::Alive);
        assert_eq!(sender.on_replay_complete(42, now, &mut bus), ConnState::Alive);

        // live stream first, then the queued burst
        assert_eq!(sender.poll(now, &mut bus), ConnState::Alive);
        assert_eq!(sender.poll(now, &mut bus), ConnState::Alive);

        let state = pipe.0.borrow();
        assert_eq!(state.written, b"liver1r2");
        assert_eq!(state.burst_notices, vec![42]);
        drop(state);
        assert!(!sender.replaying());
        assert!(!sender.requires_retry());
        assert_eq!(sender.replay_correlation_id, 42);
    }
}
