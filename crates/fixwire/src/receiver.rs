//! Inbound byte reassembly: turns a non-blocking read stream back into
//! framed FIX messages for the bus.

use std::{io, sync::Arc};

use tracing::{debug, warn};

use crate::{
    ConnectionId,
    bus::InboundPublisher,
    error::{ConnState, DisconnectReason, EngineError, ErrorSink},
};

const SOH: u8 = 0x01;
/// `10=xxx<SOH>`
const TRAILER_LEN: usize = 7;
const RX_BUF_SIZE: usize = 16 * 1024;

enum Scan {
    /// Not enough bytes yet.
    Partial,
    /// A full message of this many bytes starts at the scan offset.
    Complete(usize),
    /// Skip this many bytes and rescan.
    Garbage(usize),
}

/// Receiving half of a connection. Owns no socket; the framer feeds it the
/// sender channel's stream on readable events.
pub struct ReceiverEndpoint {
    connection_id: ConnectionId,
    errors: Arc<dyn ErrorSink>,
    buf: Vec<u8>,
    have: usize,
    max_frame: usize,
}

impl ReceiverEndpoint {
    pub fn new(connection_id: ConnectionId, max_frame: usize, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            connection_id,
            errors,
            buf: vec![0; RX_BUF_SIZE.min(max_frame.max(64))],
            have: 0,
            max_frame,
        }
    }

    #[inline]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Drains the stream until it would block, forwarding every complete
    /// message to the bus.
    pub fn poll_read(
        &mut self,
        stream: &mut impl io::Read,
        bus: &mut dyn InboundPublisher,
    ) -> ConnState {
        loop {
            if self.have == self.buf.len() {
                let grown = (self.buf.len() * 2).min(self.max_frame + TRAILER_LEN);
                self.buf.resize(grown, 0);
            }
            match stream.read(&mut self.buf[self.have..]) {
                Ok(0) => return ConnState::Disconnected(DisconnectReason::RemoteDisconnect),
                Ok(n) => {
                    self.have += n;
                    if let Err(reason) = self.dispatch_frames(bus) {
                        return ConnState::Disconnected(reason);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.errors.on_error(self.connection_id, &err.into());
                    return ConnState::Disconnected(DisconnectReason::Exception);
                }
            }
        }
    }

    fn dispatch_frames(
        &mut self,
        bus: &mut dyn InboundPublisher,
    ) -> Result<(), DisconnectReason> {
        let mut start = 0;
        loop {
            match scan_frame(&self.buf[start..self.have], self.max_frame) {
                Scan::Complete(len) => {
                    bus.on_message(self.connection_id, &self.buf[start..start + len]);
                    start += len;
                }
                Scan::Garbage(skip) => {
                    debug!(
                        connection_id = self.connection_id,
                        skip, "skipping unframed inbound bytes"
                    );
                    start += skip;
                }
                Scan::Partial => break,
            }
        }
        self.buf.copy_within(start..self.have, 0);
        self.have -= start;

        if self.have > self.max_frame {
            let err = EngineError::InboundFrameTooLarge { got: self.have, limit: self.max_frame };
            self.errors.on_error(self.connection_id, &err);
            return Err(DisconnectReason::Exception);
        }
        Ok(())
    }
}

/// Finds one `8=FIX...9=len...10=cks<SOH>` message at the start of `data`.
fn scan_frame(data: &[u8], max_frame: usize) -> Scan {
    if data.len() < 2 {
        return Scan::Partial;
    }
    if !data.starts_with(b"8=") {
        // resync on the next plausible message start
        return match find(data, b"8=FIX", 1) {
            Some(at) => Scan::Garbage(at),
            None => {
                if data.len() > 4 {
                    Scan::Garbage(data.len() - 4)
                } else {
                    Scan::Partial
                }
            }
        };
    }
    let Some(begin_end) = data.iter().position(|b| *b == SOH) else {
        return Scan::Partial;
    };
    let rest = &data[begin_end + 1..];
    if rest.len() < 2 {
        return Scan::Partial;
    }
    if !rest.starts_with(b"9=") {
        warn!("message start without a BodyLength field");
        return Scan::Garbage(1);
    }
    let mut body_len = 0_usize;
    let mut at = 2;
    loop {
        match rest.get(at) {
            None => return Scan::Partial,
            Some(&SOH) => break,
            Some(b) if b.is_ascii_digit() => {
                body_len = body_len * 10 + (b - b'0') as usize;
                at += 1;
            }
            Some(_) => {
                warn!("malformed BodyLength field");
                return Scan::Garbage(1);
            }
        }
    }
    let header_len = begin_end + 1 + at + 1;
    let total = header_len + body_len + TRAILER_LEN;
    if total > max_frame + TRAILER_LEN {
        // let the caller's size check fire once enough bytes pile up
        return Scan::Partial;
    }
    if data.len() < total {
        return Scan::Partial;
    }
    let trailer = &data[header_len + body_len..total];
    if !trailer.starts_with(b"10=") || trailer[TRAILER_LEN - 1] != SOH {
        warn!("message with a misplaced checksum trailer");
        return Scan::Garbage(1);
    }
    Scan::Complete(total)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..].windows(needle.len()).position(|w| w == needle).map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::{
        LibraryId,
        bus::{Action, InboundPublisher},
    };

    /// Reader handing out scripted chunks, then WouldBlock.
    struct ChunkReader(VecDeque<Vec<u8>>);

    impl io::Read for ChunkReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        let rest = chunk.split_off(n);
                        self.0.push_front(rest);
                    }
                    Ok(n)
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[derive(Default)]
    struct CollectingBus(Vec<Vec<u8>>);

    impl InboundPublisher for CollectingBus {
        fn try_replay_complete(&mut self, _: ConnectionId, _: u64) -> Action {
            Action::Continue
        }
        fn on_slow_status(&mut self, _: LibraryId, _: ConnectionId, _: bool) {}
        fn on_message(&mut self, _: ConnectionId, frame: &[u8]) {
            self.0.push(frame.to_vec());
        }
        fn on_disconnect(&mut self, _: LibraryId, _: ConnectionId, _: DisconnectReason) {}
    }

    fn fix_msg(body: &str) -> Vec<u8> {
        let body = body.replace('|', "\x01");
        let mut msg = format!("8=FIX.4.4\x019={}\x01{}", body.len(), body).into_bytes();
        let checksum = msg.iter().fold(0_u8, |acc, b| acc.wrapping_add(*b));
        msg.extend_from_slice(format!("10={checksum:03}\x01").as_bytes());
        msg
    }

    fn receiver() -> ReceiverEndpoint {
        ReceiverEndpoint::new(9, 1024, crate::error::log_error_sink())
    }

    #[test]
    fn reassembles_whole_and_split_messages() {
        let first = fix_msg("35=A|34=1|");
        let second = fix_msg("35=D|34=2|55=EURUSD|");
        let mut chunks = VecDeque::new();
        chunks.push_back(first.clone());
        chunks.push_back(second[..7].to_vec());
        chunks.push_back(second[7..].to_vec());
        let mut reader = ChunkReader(chunks);

        let mut bus = CollectingBus::default();
        let mut rx = receiver();
        assert_eq!(rx.poll_read(&mut reader, &mut bus), ConnState::Alive);
        assert_eq!(bus.0, vec![first, second]);
    }

    #[test]
    fn two_messages_in_one_read() {
        let first = fix_msg("35=0|");
        let second = fix_msg("35=1|112=ping|");
        let mut joined = first.clone();
        joined.extend_from_slice(&second);
        let mut reader = ChunkReader(VecDeque::from([joined]));

        let mut bus = CollectingBus::default();
        let mut rx = receiver();
        assert_eq!(rx.poll_read(&mut reader, &mut bus), ConnState::Alive);
        assert_eq!(bus.0, vec![first, second]);
    }

    #[test]
    fn skips_leading_garbage() {
        let msg = fix_msg("35=A|");
        let mut dirty = b"\r\nnoise".to_vec();
        dirty.extend_from_slice(&msg);
        let mut reader = ChunkReader(VecDeque::from([dirty]));

        let mut bus = CollectingBus::default();
        let mut rx = receiver();
        assert_eq!(rx.poll_read(&mut reader, &mut bus), ConnState::Alive);
        assert_eq!(bus.0, vec![msg]);
    }

    #[test]
    fn peer_close_disconnects() {
        struct Closed;
        impl io::Read for Closed {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
        }
        let mut bus = CollectingBus::default();
        let mut rx = receiver();
        assert_eq!(
            rx.poll_read(&mut Closed, &mut bus),
            ConnState::Disconnected(DisconnectReason::RemoteDisconnect)
        );
    }

    #[test]
    fn oversized_frame_disconnects() {
        let huge = fix_msg(&format!("35=D|58={}|", "x".repeat(4096)));
        let mut reader = ChunkReader(VecDeque::from([huge]));
        let mut bus = CollectingBus::default();
        let mut rx = ReceiverEndpoint::new(9, 256, crate::error::log_error_sink());
        assert_eq!(
            rx.poll_read(&mut reader, &mut bus),
            ConnState::Disconnected(DisconnectReason::Exception)
        );
        assert!(bus.0.is_empty());
    }
}
