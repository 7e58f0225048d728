use std::{io, sync::Arc};

use thiserror::Error;

use crate::ConnectionId;

/// Why a connection was (or is being) torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The peer drained slower than we produced for too long, or its backlog
    /// overflowed.
    SlowConsumer,
    /// An I/O or invariant failure on this endpoint.
    Exception,
    /// The peer closed the socket.
    RemoteDisconnect,
    /// The host asked for the connection to be closed.
    AdminClose,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("socket write failed")]
    Io(#[from] io::Error),
    #[error("corrupt retry buffer: unknown frame tag {tag} at offset {offset}")]
    CorruptRetryBuffer { tag: u32, offset: usize },
    #[error("inbound frame of {got} bytes exceeds limit of {limit}")]
    InboundFrameTooLarge { got: usize, limit: usize },
    #[error("reject builder is missing the session context (no logon yet)")]
    RejectNotConfigured,
    #[error("reject field {field} is empty")]
    RejectFieldEmpty { field: &'static str },
}

/// Whether a connection is still usable after an endpoint call.
///
/// `Disconnected` carries the reason; the framer routes it through
/// `complete_disconnect` and drops the endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected(DisconnectReason),
}

impl ConnState {
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnState::Disconnected(_))
    }
}

/// Synchronous sink for endpoint errors.
///
/// Endpoint methods never return `Err` to the framer; failures are reported
/// here and surface as a [`ConnState::Disconnected`] where fatal.
pub trait ErrorSink: Send + Sync {
    fn on_error(&self, connection_id: ConnectionId, error: &EngineError);
}

/// Default sink: structured log line per error.
#[derive(Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn on_error(&self, connection_id: ConnectionId, error: &EngineError) {
        tracing::error!(connection_id, %error, "endpoint error");
    }
}

pub fn log_error_sink() -> Arc<dyn ErrorSink> {
    Arc::new(LogErrorSink)
}
