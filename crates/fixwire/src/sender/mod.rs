mod fix;
mod fixp;

use std::{io, sync::Arc};

pub use fix::FixSenderEndpoint;
use fixwire_timing::Nanos;
pub use fixp::FixpSenderEndpoint;

use crate::{
    ConnectionId, LibraryId,
    bus::InboundPublisher,
    channel::Channel,
    config::EngineConfig,
    counters::SenderCounters,
    error::{ConnState, EngineError, ErrorSink},
};

/// Sequence value carried by every replay frame except the terminal one of a
/// burst. Real FIX sequence numbers start at 1, so 0 is free.
pub const NOT_LAST_REPLAY_MSG: u32 = 0;

/// State shared by all sender endpoint variants: the socket, the exported
/// counters, and the slow-consumer watchdog.
pub struct SenderCore<C: Channel> {
    connection_id: ConnectionId,
    library_id: LibraryId,
    channel: C,
    counters: Arc<SenderCounters>,
    errors: Arc<dyn ErrorSink>,
    max_bytes_in_buffer: usize,
    slow_consumer_timeout: Nanos,
    /// Pushed forward by every accepted byte; crossing it while backlogged
    /// disconnects the peer.
    sending_timeout_deadline: Nanos,
    /// Last published slow flag, so transitions publish exactly once.
    slow_status: bool,
}

impl<C: Channel> SenderCore<C> {
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
            connection_id,
            library_id,
            channel,
            counters,
            errors,
            max_bytes_in_buffer: config.max_bytes_in_buffer,
            slow_consumer_timeout: config.slow_consumer_timeout,
            sending_timeout_deadline: now + config.slow_consumer_timeout,
            slow_status: false,
        }
    }

    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[inline]
    pub fn library_id(&self) -> LibraryId {
        self.library_id
    }

    #[inline]
    pub fn bind_library(&mut self, library_id: LibraryId) {
        self.library_id = library_id;
    }

    #[inline]
    pub fn counters(&self) -> &SenderCounters {
        &self.counters
    }

    #[inline]
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    #[inline]
    pub fn max_bytes_in_buffer(&self) -> usize {
        self.max_bytes_in_buffer
    }

    /// Socket write; any accepted byte is forward progress and re-arms the
    /// slow-consumer deadline.
    #[inline]
    pub fn write(&mut self, buf: &[u8], seq: u32, replay: bool, now: Nanos) -> io::Result<usize> {
        let written = self.channel.write(buf, seq, replay)?;
        if written > 0 {
            self.sending_timeout_deadline = now + self.slow_consumer_timeout;
        }
        Ok(written)
    }

    /// Weakly observed: reads back the published counter.
    #[inline]
    pub fn is_slow_consumer(&self) -> bool {
        self.counters.bytes_in_buffer.get() > 0
    }

    #[inline]
    pub fn timed_out(&self, now: Nanos) -> bool {
        now > self.sending_timeout_deadline
    }

    #[inline]
    pub fn publish_bytes_in_buffer(&self, usage: usize) {
        self.counters.bytes_in_buffer.set(usage as u64);
    }

    /// Publishes the slow/not-slow event, transitions only.
    pub fn send_slow_status(&mut self, slow: bool, bus: &mut dyn InboundPublisher) {
        if self.slow_status != slow {
            self.slow_status = slow;
            bus.on_slow_status(self.library_id, self.connection_id, slow);
        }
    }

    #[inline]
    pub fn report(&self, error: &EngineError) {
        self.errors.on_error(self.connection_id, error);
    }

    pub fn close(&mut self) {
        self.counters.bytes_in_buffer.set(0);
        self.channel.close();
    }
}

/// A per-connection sender, one of the supported session protocols.
///
/// The FIX variant multiplexes live and replay traffic; the FIXP variant has
/// a single stream but shares the partial-write and slow-consumer handling.
pub enum SenderEndpoint<C: Channel> {
    Fix(FixSenderEndpoint<C>),
    Fixp(FixpSenderEndpoint<C>),
}

impl<C: Channel> SenderEndpoint<C> {
    /// Retries buffered frames and runs the slow-consumer watchdog. Called
    /// every framer tick.
    pub fn poll(&mut self, now: Nanos, bus: &mut dyn InboundPublisher) -> ConnState {
        match self {
            SenderEndpoint::Fix(e) => e.poll(now, bus),
            SenderEndpoint::Fixp(e) => e.poll(now, bus),
        }
    }

    pub fn close(&mut self) {
        match self {
            SenderEndpoint::Fix(e) => e.close(),
            SenderEndpoint::Fixp(e) => e.close(),
        }
    }

    pub fn is_slow_consumer(&self) -> bool {
        match self {
            SenderEndpoint::Fix(e) => e.is_slow_consumer(),
            SenderEndpoint::Fixp(e) => e.is_slow_consumer(),
        }
    }

    pub fn library_id(&self) -> LibraryId {
        match self {
            SenderEndpoint::Fix(e) => e.library_id(),
            SenderEndpoint::Fixp(e) => e.library_id(),
        }
    }

    pub fn bind_library(&mut self, library_id: LibraryId) {
        match self {
            SenderEndpoint::Fix(e) => e.bind_library(library_id),
            SenderEndpoint::Fixp(e) => e.bind_library(library_id),
        }
    }

    pub fn on_valid_resend_request(&mut self, correlation_id: u64) {
        match self {
            SenderEndpoint::Fix(e) => e.on_valid_resend_request(correlation_id),
            SenderEndpoint::Fixp(_) => {}
        }
    }

    pub fn channel_mut(&mut self) -> &mut C {
        match self {
            SenderEndpoint::Fix(e) => e.channel_mut(),
            SenderEndpoint::Fixp(e) => e.channel_mut(),
        }
    }

    pub fn as_fix_mut(&mut self) -> Option<&mut FixSenderEndpoint<C>> {
        match self {
            SenderEndpoint::Fix(e) => Some(e),
            SenderEndpoint::Fixp(_) => None,
        }
    }
}
