//! Byte arena for frames queued behind a back-pressured socket.
//!
//! Frames are laid out back to back from offset 0; `usage` counts the valid
//! bytes. Flushed prefixes are compacted away with [`ReattemptBuffer::shuffle`]
//! rather than freed, so a buffer grows to its high-water mark once and stays
//! there until the endpoint closes.

/// Tag of a queued frame, leading little-endian u32 of every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameTag {
    /// An outbound message: `tag | seq | body_len | body | meta_len | meta`.
    Message = 1,
    /// End of a replay burst: `tag | correlation_id`.
    ReplayComplete = 2,
    /// Start of a replay burst: `tag | correlation_id`.
    StartReplay = 3,
}

impl FrameTag {
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(FrameTag::Message),
            2 => Some(FrameTag::ReplayComplete),
            3 => Some(FrameTag::StartReplay),
            _ => None,
        }
    }
}

pub(crate) const TAG_LEN: usize = 4;
pub(crate) const MSG_SEQ_OFFSET: usize = 4;
pub(crate) const MSG_BODY_LEN_OFFSET: usize = 8;
pub(crate) const MSG_BODY_OFFSET: usize = 12;
/// Fixed length of the replay start/complete marker frames.
pub(crate) const MARKER_LEN: usize = TAG_LEN + 8;

/// Full in-buffer length of a message frame with the given body and meta.
#[inline]
pub(crate) fn message_frame_len(body_len: usize, meta_len: usize) -> usize {
    MSG_BODY_OFFSET + body_len + 4 + meta_len
}

#[derive(Debug, Default)]
pub struct ReattemptBuffer {
    data: Vec<u8>,
    usage: usize,
}

impl ReattemptBuffer {
    /// Does not allocate; the backing arena is grown on first append.
    pub fn new() -> Self {
        Self { data: Vec::new(), usage: 0 }
    }

    #[inline]
    pub fn usage(&self) -> usize {
        self.usage
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.usage == 0
    }

    /// Valid bytes, a concatenation of well-formed frames.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.usage]
    }

    /// Claims `n` bytes at the end of the used region, growing the arena if
    /// needed, and returns the claimed slice for the caller to fill.
    #[inline]
    pub fn reserve_append(&mut self, n: usize) -> &mut [u8] {
        let start = self.usage;
        self.usage += n;
        if self.data.len() < self.usage {
            self.data.resize(self.usage, 0);
        }
        &mut self.data[start..start + n]
    }

    /// Compacts `written` flushed bytes off the front. No-op for 0.
    pub fn shuffle(&mut self, written: usize) -> usize {
        debug_assert!(written <= self.usage);
        if written > 0 {
            self.data.copy_within(written..self.usage, 0);
            self.usage -= written;
        }
        self.usage
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap())
    }

    #[inline]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.data[offset..offset + 8].try_into().unwrap())
    }

    #[inline]
    pub fn write_u32_at(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Appends a message frame, returns its full in-buffer length.
    pub fn append_message(&mut self, seq: u32, body: &[u8], meta: &[u8]) -> usize {
        let frame_len = message_frame_len(body.len(), meta.len());
        let dst = self.reserve_append(frame_len);
        dst[..4].copy_from_slice(&(FrameTag::Message as u32).to_le_bytes());
        dst[4..8].copy_from_slice(&seq.to_le_bytes());
        dst[8..12].copy_from_slice(&(body.len() as u32).to_le_bytes());
        dst[12..12 + body.len()].copy_from_slice(body);
        let meta_at = 12 + body.len();
        dst[meta_at..meta_at + 4].copy_from_slice(&(meta.len() as u32).to_le_bytes());
        dst[meta_at + 4..].copy_from_slice(meta);
        frame_len
    }

    /// Appends a start-replay or replay-complete marker.
    pub fn append_marker(&mut self, tag: FrameTag, correlation_id: u64) -> usize {
        debug_assert!(tag != FrameTag::Message);
        let dst = self.reserve_append(MARKER_LEN);
        dst[..4].copy_from_slice(&(tag as u32).to_le_bytes());
        dst[4..].copy_from_slice(&correlation_id.to_le_bytes());
        MARKER_LEN
    }
}
