use fixwire_timing::Nanos;
use serde::{Deserialize, Serialize};

/// Engine-wide knobs; one copy per framer, shared by its endpoints.
///
/// Durations deserialize from humantime strings ("5s", "250ms") or raw
/// nanosecond integers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backlog bytes after which an endpoint is disconnected as a slow
    /// consumer.
    pub max_bytes_in_buffer: usize,
    /// How long an endpoint may sit with backlog and no accepted bytes
    /// before it is disconnected as a slow consumer.
    pub slow_consumer_timeout: Nanos,
    /// Hard cap on a single inbound FIX message.
    pub max_inbound_frame: usize,
    /// Optional kernel SO_SNDBUF/SO_RCVBUF override for accepted and
    /// initiated sockets.
    pub socket_buf_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bytes_in_buffer: 4 * 1024 * 1024,
            slow_consumer_timeout: Nanos::from_secs(10),
            max_inbound_frame: 64 * 1024,
            socket_buf_size: None,
        }
    }
}
