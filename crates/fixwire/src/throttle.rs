//! Synthetic Business Message Reject construction for throttled sessions.

use std::io::Write;

use fixwire_timing::Nanos;

use crate::error::EngineError;

/// FIX field delimiter.
pub const SOH: u8 = 0x01;

const MSG_TYPE_BUSINESS_REJECT: &[u8] = b"j";
/// BusinessRejectReason(380) value emitted for throttled messages; the
/// throttle rule itself lives outside this crate.
const REJECT_REASON_THROTTLED: &[u8] = b"99";

/// Session identity fields, fixed at logon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    /// BeginString(8), e.g. "FIX.4.4".
    pub begin_string: String,
    /// Our SenderCompID(49) on this session.
    pub sender_comp_id: String,
    /// TargetCompID(56), the counterparty.
    pub target_comp_id: String,
}

/// Encodes Business Message Rejects for messages dropped by the throttle.
///
/// Created lazily on first use: the session key only exists after logon.
pub struct ThrottleRejectBuilder {
    key: SessionKey,
    text: String,
    body: Vec<u8>,
    frame: Vec<u8>,
}

impl ThrottleRejectBuilder {
    pub fn new(key: SessionKey, window: Nanos, limit: usize) -> Self {
        let mut builder = Self { key, text: String::new(), body: Vec::new(), frame: Vec::new() };
        builder.configure(window, limit);
        builder
    }

    pub fn configure(&mut self, window: Nanos, limit: usize) {
        self.text =
            format!("Throttle limit exceeded ({limit} msgs / {}ms)", window.as_millis_u64());
    }

    /// Builds the full tag=value message, BodyLength and CheckSum included.
    /// The returned slice is valid until the next `encode` call.
    pub fn encode(
        &mut self,
        seq: u32,
        ref_msg_type: &[u8],
        ref_seq_num: u32,
        reject_ref_id: &[u8],
        sending_time: Nanos,
    ) -> Result<&[u8], EngineError> {
        if ref_msg_type.is_empty() {
            return Err(EngineError::RejectFieldEmpty { field: "RefMsgType" });
        }
        if reject_ref_id.is_empty() {
            return Err(EngineError::RejectFieldEmpty { field: "BusinessRejectRefID" });
        }

        self.body.clear();
        let body = &mut self.body;
        put_field(body, 35, MSG_TYPE_BUSINESS_REJECT);
        put_field(body, 49, self.key.sender_comp_id.as_bytes());
        put_field(body, 56, self.key.target_comp_id.as_bytes());
        put_uint_field(body, 34, seq as u64);
        put_field(body, 52, sending_time.with_fmt_utc("%Y%m%d-%H:%M:%S%.3f").as_bytes());
        put_uint_field(body, 45, ref_seq_num as u64);
        put_field(body, 372, ref_msg_type);
        put_field(body, 379, reject_ref_id);
        put_field(body, 380, REJECT_REASON_THROTTLED);
        put_field(body, 58, self.text.as_bytes());

        self.frame.clear();
        let frame = &mut self.frame;
        put_field(frame, 8, self.key.begin_string.as_bytes());
        put_uint_field(frame, 9, self.body.len() as u64);
        frame.extend_from_slice(&self.body);
        let checksum = frame.iter().fold(0_u8, |acc, b| acc.wrapping_add(*b));
        let _ = write!(frame, "10={checksum:03}");
        frame.push(SOH);

        Ok(&self.frame)
    }
}

fn put_field(buf: &mut Vec<u8>, tag: u32, value: &[u8]) {
    let _ = write!(buf, "{tag}=");
    buf.extend_from_slice(value);
    buf.push(SOH);
}

fn put_uint_field(buf: &mut Vec<u8>, tag: u32, value: u64) {
    let _ = write!(buf, "{tag}={value}");
    buf.push(SOH);
}
