use crate::{ConnectionId, DisconnectReason, LibraryId};

/// Outcome of an offer onto the shared message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// The bus is back-pressured; the caller must retry later.
    Abort,
}

/// Publisher side of the shared inbound message bus.
///
/// The bus transport itself is outside this crate; library-side session
/// logic subscribes to these events.
pub trait InboundPublisher {
    /// Signals that the replay burst `correlation_id` has been fully written
    /// to the peer. [`Action::Abort`] means the offer did not go through and
    /// must be retried.
    fn try_replay_complete(&mut self, connection_id: ConnectionId, correlation_id: u64) -> Action;

    /// Slow-consumer transition for a connection. Only fired on changes.
    fn on_slow_status(&mut self, library_id: LibraryId, connection_id: ConnectionId, slow: bool);

    /// A complete inbound FIX message.
    fn on_message(&mut self, connection_id: ConnectionId, frame: &[u8]);

    /// The connection is gone.
    fn on_disconnect(
        &mut self,
        library_id: LibraryId,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    );
}

/// Optional per-message callback, fired exactly once when the body of a live
/// (non-replay) message has been fully handed to the kernel.
pub trait MessageTimingSink {
    fn on_message(&mut self, seq: u32, connection_id: ConnectionId, meta: &[u8]);
}
