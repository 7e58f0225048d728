use std::sync::Arc;

use fixwire_timing::Nanos;
use tracing::{debug, warn};

use crate::{
    ConnectionId, LibraryId,
    buffer::{
        FrameTag, MSG_BODY_LEN_OFFSET, MSG_BODY_OFFSET, ReattemptBuffer, message_frame_len,
    },
    bus::InboundPublisher,
    channel::Channel,
    config::EngineConfig,
    counters::SenderCounters,
    error::{ConnState, DisconnectReason, EngineError, ErrorSink},
    sender::SenderCore,
};

/// Sender for binary FIXP sessions. One outbound stream, no replay
/// interleaving; partial-write retry and the slow-consumer policy are the
/// same as for FIX.
pub struct FixpSenderEndpoint<C: Channel> {
    core: SenderCore<C>,
    retry: ReattemptBuffer,
    requires_retry: bool,
    reattempt_bytes_written: usize,
    closed: bool,
}

impl<C: Channel> FixpSenderEndpoint<C> {
    pub fn new(
        connection_id: ConnectionId,
        library_id: LibraryId,
        channel: C,
        config: &EngineConfig,
        counters: Arc<SenderCounters>,
        errors: Arc<dyn ErrorSink>,
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
            retry: ReattemptBuffer::new(),
            requires_retry: false,
            reattempt_bytes_written: 0,
            closed: false,
        }
    }

    pub fn on_message(
        &mut self,
        library_id: LibraryId,
        body: &[u8],
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        if self.closed {
            return ConnState::Alive;
        }
        if library_id != self.core.library_id() {
            self.core.counters().invalid_library_attempts.increment();
            debug!(
                got = library_id,
                bound = self.core.library_id(),
                "dropping submission from stale library"
            );
            return ConnState::Alive;
        }
        if self.requires_retry {
            return self.enqueue(body, bus);
        }
        match self.core.write(body, 0, false, now) {
            Ok(written) if written < body.len() => {
                debug!(written, body_len = body.len(), "partial write, queueing frame");
                self.reattempt_bytes_written = written;
                self.enqueue(body, bus)
            }
            Ok(_) => {
                self.reattempt_bytes_written = 0;
                ConnState::Alive
            }
            Err(err) => {
                self.core.report(&err.into());
                self.closed = true;
                ConnState::Disconnected(DisconnectReason::Exception)
            }
        }
    }

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

    fn enqueue(&mut self, body: &[u8], bus: &mut dyn InboundPublisher) -> ConnState {
        self.retry.append_message(0, body, &[]);
        self.requires_retry = true;
        let usage = self.retry.usage();
        self.core.publish_bytes_in_buffer(usage);
        self.core.send_slow_status(true, bus);
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

    fn reattempt(
        &mut self,
        now: Nanos,
        bus: &mut dyn InboundPublisher,
    ) -> Result<bool, DisconnectReason> {
        let Self { core, retry, reattempt_bytes_written, closed, .. } = self;
        let mut offset = 0;

        loop {
            if offset >= retry.usage() {
                break;
            }
            let raw_tag = retry.read_u32(offset);
            if FrameTag::from_raw(raw_tag) != Some(FrameTag::Message) {
                core.report(&EngineError::CorruptRetryBuffer { tag: raw_tag, offset });
                *closed = true;
                return Err(DisconnectReason::Exception);
            }
            let body_len = retry.read_u32(offset + MSG_BODY_LEN_OFFSET) as usize;
            let body_off = offset + MSG_BODY_OFFSET;
            let already = *reattempt_bytes_written;
            let written =
                match core.write(&retry.bytes()[body_off + already..body_off + body_len], 0, false, now)
                {
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
            offset += message_frame_len(body_len, 0);
        }

        let usage = retry.shuffle(offset);
        core.publish_bytes_in_buffer(usage);
        if usage == 0 {
            self.requires_retry = false;
            self.core.send_slow_status(false, bus);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
