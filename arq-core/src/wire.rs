//! Wire format: protocol constants, segment codec, sequence arithmetic.
//!
//! Every field is little-endian on the wire regardless of host order, and
//! the 24-byte header layout is bit-compatible with the original C KCP so
//! existing peers interoperate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol constants shared with every KCP-compatible peer.
pub mod consts {
    /// No-delay minimum retransmission timeout (ms).
    pub const RTO_NDL: u32 = 30;
    /// Normal minimum retransmission timeout (ms).
    pub const RTO_MIN: u32 = 100;
    /// Initial retransmission timeout (ms).
    pub const RTO_DEF: u32 = 200;
    /// Retransmission timeout ceiling (ms).
    pub const RTO_MAX: u32 = 60000;

    /// Probe flag: a WASK needs to go out.
    pub const ASK_SEND: u32 = 1;
    /// Probe flag: a WINS needs to go out.
    pub const ASK_TELL: u32 = 2;

    /// Default send window (segments).
    pub const WND_SND: u32 = 32;
    /// Default (and minimum) receive window (segments).
    pub const WND_RCV: u32 = 128;

    /// Default maximum transmission unit.
    pub const MTU_DEF: u32 = 1400;
    /// Duplicate-ACK threshold used by the `fast` tuning presets.
    pub const ACK_FAST: u32 = 3;
    /// Default flush cadence (ms).
    pub const INTERVAL: u32 = 100;
    /// Segment header size in bytes.
    pub const OVERHEAD: u32 = 24;
    /// Transmissions of a single segment before the link is declared dead.
    pub const DEADLINK: u32 = 20;
    /// Initial slow-start threshold (segments).
    pub const THRESH_INIT: u32 = 2;
    /// Slow-start threshold floor (segments).
    pub const THRESH_MIN: u32 = 2;
    /// First zero-window probe delay (ms).
    pub const PROBE_INIT: u32 = 7000;
    /// Zero-window probe delay ceiling (ms).
    pub const PROBE_LIMIT: u32 = 120000;
    /// Default cap on fast retransmissions of one segment.
    pub const FASTACK_LIMIT: u32 = 5;
}

/// Diagnostic-trace categories, combined into [`EngineConfig::log_mask`].
///
/// Events are emitted through `tracing` only when the matching bit is set,
/// so a fully silent engine pays a single branch per site.
///
/// [`EngineConfig::log_mask`]: crate::config::EngineConfig
pub mod log {
    pub const OUTPUT: u32 = 0x1;
    pub const INPUT: u32 = 0x2;
    pub const SEND: u32 = 0x4;
    pub const RECV: u32 = 0x8;
    pub const IN_DATA: u32 = 0x10;
    pub const IN_ACK: u32 = 0x20;
    pub const IN_PROBE: u32 = 0x40;
    pub const IN_WINS: u32 = 0x80;
    pub const OUT_DATA: u32 = 0x100;
    pub const OUT_ACK: u32 = 0x200;
    pub const OUT_PROBE: u32 = 0x400;
    pub const OUT_WINS: u32 = 0x800;
}

/// Segment command, the `cmd` byte of the wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// Data segment.
    Push = 81,
    /// Acknowledgement of one sequence number.
    Ack = 82,
    /// Window probe: "tell me your receive window".
    WndAsk = 83,
    /// Window advertisement, the answer to [`Cmd::WndAsk`].
    WndTell = 84,
}

impl Cmd {
    /// Parse a command byte; anything outside 81..=84 is a protocol error.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            81 => Ok(Cmd::Push),
            82 => Ok(Cmd::Ack),
            83 => Ok(Cmd::WndAsk),
            84 => Ok(Cmd::WndTell),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// Signed 32-bit difference of two wrapping counters (`a - b`).
///
/// Sequence numbers and millisecond timestamps both live in wrapping u32
/// space; all ordering comparisons must go through this, never through a
/// wider integer type.
#[inline]
pub fn wrapping_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// True when `a` is strictly before `b` in wrapping sequence space.
#[inline]
pub fn seq_before(a: u32, b: u32) -> bool {
    wrapping_diff(a, b) < 0
}

/// Read the conversation id off the front of a raw datagram without
/// building a control block, for demultiplexing inbound traffic.
pub fn peek_conv(datagram: &[u8]) -> Option<u32> {
    let head: [u8; 4] = datagram.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}

/// One unit of wire transfer: a 24-byte header plus an owned payload.
///
/// The retransmission bookkeeping fields are host-side state and never
/// appear on the wire.
#[derive(Debug, Clone)]
pub struct Segment {
    pub conv: u32,
    pub cmd: Cmd,
    /// Remaining fragments of this message; 0 marks the last one.
    pub frg: u8,
    /// Sender's free receive window, in segments.
    pub wnd: u16,
    /// Send timestamp (ms), echoed back in the matching ACK.
    pub ts: u32,
    pub sn: u32,
    /// Sender's cumulative acknowledgement: smallest unacked sn.
    pub una: u32,
    pub data: Bytes,

    pub(crate) resend_ts: u32,
    pub(crate) rto: u32,
    pub(crate) fastack: u32,
    pub(crate) xmit: u32,
}

impl Segment {
    /// Empty segment with the given command; remaining fields zeroed.
    pub fn new(conv: u32, cmd: Cmd) -> Self {
        Self::with_payload(conv, cmd, Bytes::new())
    }

    /// Segment carrying `data`.
    pub fn with_payload(conv: u32, cmd: Cmd, data: Bytes) -> Self {
        Self {
            conv,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            data,
            resend_ts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }

    /// Bytes this segment occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        consts::OVERHEAD as usize + self.data.len()
    }

    /// Append header and payload to `buf`, little-endian.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.extend_from_slice(&self.data);
    }

    /// Decode one segment off the front of `buf`, slicing the payload
    /// zero-copy out of the datagram.
    ///
    /// Checks run in the same order as the reference implementation:
    /// header length, conversation id, payload length, command byte.
    pub fn decode(buf: &mut Bytes, expected_conv: u32) -> Result<Self> {
        if buf.len() < consts::OVERHEAD as usize {
            return Err(Error::ShortDatagram(buf.len()));
        }
        let conv = buf.get_u32_le();
        if conv != expected_conv {
            return Err(Error::ConvMismatch {
                expected: expected_conv,
                got: conv,
            });
        }
        let cmd_byte = buf.get_u8();
        let frg = buf.get_u8();
        let wnd = buf.get_u16_le();
        let ts = buf.get_u32_le();
        let sn = buf.get_u32_le();
        let una = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(Error::TruncatedPayload {
                declared: len,
                available: buf.remaining(),
            });
        }
        let cmd = Cmd::from_byte(cmd_byte)?;
        let data = buf.split_to(len);
        Ok(Self {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            data,
            resend_ts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut seg = Segment::with_payload(0xDEAD_BEEF, Cmd::Push, Bytes::from_static(b"payload"));
        seg.frg = 3;
        seg.wnd = 96;
        seg.ts = 123_456;
        seg.sn = 42;
        seg.una = 40;

        let mut buf = BytesMut::new();
        seg.encode_into(&mut buf);
        assert_eq!(buf.len(), consts::OVERHEAD as usize + 7);

        let mut wire = buf.freeze();
        let back = Segment::decode(&mut wire, 0xDEAD_BEEF).unwrap();
        assert_eq!(back.cmd, Cmd::Push);
        assert_eq!(back.frg, 3);
        assert_eq!(back.wnd, 96);
        assert_eq!(back.ts, 123_456);
        assert_eq!(back.sn, 42);
        assert_eq!(back.una, 40);
        assert_eq!(&back.data[..], b"payload");
        assert!(wire.is_empty());
    }

    #[test]
    fn decode_rejects_foreign_conv() {
        let mut buf = BytesMut::new();
        Segment::new(7, Cmd::Ack).encode_into(&mut buf);
        let mut wire = buf.freeze();
        assert!(matches!(
            Segment::decode(&mut wire, 8),
            Err(Error::ConvMismatch { expected: 8, got: 7 })
        ));
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut seg = Segment::with_payload(1, Cmd::Push, Bytes::from_static(b"abc"));
        seg.sn = 1;
        let mut buf = BytesMut::new();
        seg.encode_into(&mut buf);
        buf.truncate(buf.len() - 2);
        let mut wire = buf.freeze();
        assert!(matches!(
            Segment::decode(&mut wire, 1),
            Err(Error::TruncatedPayload { declared: 3, available: 1 })
        ));
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut buf = BytesMut::new();
        Segment::new(1, Cmd::Ack).encode_into(&mut buf);
        buf[4] = 99;
        let mut wire = buf.freeze();
        assert!(matches!(
            Segment::decode(&mut wire, 1),
            Err(Error::UnknownCommand(99))
        ));
    }

    #[test]
    fn wrapping_diff_handles_rollover() {
        assert_eq!(wrapping_diff(5, 3), 2);
        assert_eq!(wrapping_diff(3, 5), -2);
        assert_eq!(wrapping_diff(1, u32::MAX), 2);
        assert!(seq_before(u32::MAX, 1));
        assert!(!seq_before(1, u32::MAX));
    }

    #[test]
    fn peek_conv_reads_little_endian() {
        assert_eq!(peek_conv(&[0x78, 0x56, 0x34, 0x12, 0xFF]), Some(0x1234_5678));
        assert_eq!(peek_conv(&[1, 2, 3]), None);
    }
}
