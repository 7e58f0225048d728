//! FIX gateway sender engine.
//!
//! Per-connection sender endpoints multiplex live and replay traffic onto
//! non-blocking sockets under partial-write back-pressure; a single-threaded
//! framer loop owns every endpoint and drives the whole engine one
//! cooperative tick at a time.

pub mod buffer;
pub mod bus;
pub mod channel;
mod config;
pub mod counters;
mod error;
mod framer;
mod receiver;
pub mod sender;
mod throttle;

pub use config::EngineConfig;
pub use error::{ConnState, DisconnectReason, EngineError, ErrorSink, LogErrorSink, log_error_sink};
pub use framer::{Framer, SessionProtocol, TimingFactory};
pub use receiver::ReceiverEndpoint;
pub use sender::{FixSenderEndpoint, FixpSenderEndpoint, NOT_LAST_REPLAY_MSG, SenderEndpoint};
pub use throttle::{SessionKey, ThrottleRejectBuilder};

/// Stable identity of one TCP connection, assigned by the framer.
pub type ConnectionId = u64;
/// Identifies the client library owning a connection's session logic.
pub type LibraryId = i32;
/// Identity of a logged-on FIX session.
pub type SessionId = u64;

/// Library id connections carry between accept and library takeover.
pub const ENGINE_LIBRARY_ID: LibraryId = -1;
