use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Single integer published by the framer thread and read by observers on
/// other threads.
///
/// Stores use release ordering and loads acquire, so an observer that sees a
/// value also sees every buffer mutation that preceded its publication.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }
}

/// Counters exported per sender endpoint.
#[derive(Debug, Default)]
pub struct SenderCounters {
    /// Backlog of the currently active stream, in bytes.
    pub bytes_in_buffer: Counter,
    /// Submissions dropped because they carried a stale library id.
    pub invalid_library_attempts: Counter,
}

impl SenderCounters {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
