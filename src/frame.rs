//! RFC 6455 frame parsing and serialization
//!
//! The parser works incrementally over a growing receive buffer: it returns
//! a complete frame, or `None` when more bytes are needed, or a protocol
//! error. Nothing is consumed from the buffer until a whole frame is
//! present, so partial reads need no parser-side state.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_PAYLOAD_THRESHOLD, SMALL_PAYLOAD_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control opcode (Close, Ping, Pong)
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data opcode (Continuation, Text, Binary)
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// Decoded frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Per-message compression flag, valid on the first frame of a message
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (required on peer-to-server frames)
    pub masked: bool,
    /// Masking key when masked
    pub mask: Option<[u8; 4]>,
    /// Payload length
    pub payload_len: u64,
}

/// A complete decoded frame with its (unmasked) payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload bytes, already unmasked
    pub payload: Bytes,
}

/// Incremental frame parser
///
/// One parser per connection. `require_masked` enforces the server-side
/// rule that every peer frame carries a mask; compression support gates
/// the RSV1 bit.
pub struct FrameParser {
    max_frame_size: usize,
    require_masked: bool,
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a new parser
    pub fn new(max_frame_size: usize, require_masked: bool) -> Self {
        Self {
            max_frame_size,
            require_masked,
            allow_rsv1: false,
        }
    }

    /// Enable or disable the RSV1 (compression) bit
    pub fn set_compression(&mut self, enabled: bool) {
        self.allow_rsv1 = enabled;
    }

    /// Parse one frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` and consumes its bytes, `Ok(None)` when
    /// the buffer does not yet hold a complete frame, or an error on a
    /// protocol violation. Violations are detected as soon as the header
    /// bytes allow, before the payload has arrived.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        if b0 & 0x30 != 0 {
            return Err(Error::Protocol("RSV2 and RSV3 must be zero"));
        }
        if rsv1 && !self.allow_rsv1 {
            return Err(Error::IncorrectData(
                "RSV1 set without negotiated compression",
            ));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("unsupported opcode"))?;

        let masked = b1 & 0x80 != 0;
        if self.require_masked && !masked {
            return Err(Error::Protocol("unmasked frame from peer"));
        }

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("fragmented control frame"));
            }
            if rsv1 {
                return Err(Error::Protocol("compressed control frame"));
            }
        }

        // 7-bit length, or 2/8 extension bytes
        let (payload_len, len_ext) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let n = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if n < 126 {
                    return Err(Error::Protocol("non-minimal payload length"));
                }
                (n, 2usize)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let n = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if n <= u16::MAX as u64 {
                    return Err(Error::Protocol("non-minimal payload length"));
                }
                if n >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB set"));
                }
                (n, 8usize)
            }
            n => (n as u64, 0usize),
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("oversized control frame"));
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let header_len = 2 + len_ext + if masked { 4 } else { 0 };
        let total = header_len + payload_len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let mask = if masked {
            let at = 2 + len_ext;
            Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        } else {
            None
        };

        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len as usize);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            header: FrameHeader {
                fin,
                rsv1,
                opcode,
                masked,
                mask,
                payload_len,
            },
            payload: payload.freeze(),
        }))
    }
}

/// Encode one frame into the buffer.
///
/// `mask` is `None` for server-originated frames; a masked encoding copies
/// and XORs the payload.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    rsv1: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_PAYLOAD_THRESHOLD {
            8
        } else if payload_len > SMALL_PAYLOAD_THRESHOLD {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };
    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::generate_mask;

    fn parser() -> FrameParser {
        FrameParser::new(16 * 1024 * 1024, true)
    }

    #[test]
    fn opcode_classification() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert!(OpCode::from_u8(0x3).is_none());
        assert!(OpCode::from_u8(0xB).is_none());
    }

    #[test]
    fn parse_masked_text() {
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            OpCode::Text,
            b"hello",
            true,
            false,
            Some([0x37, 0xFA, 0x21, 0x3D]),
        );

        let frame = parser().parse(&mut buf).unwrap().unwrap();
        assert!(frame.header.fin);
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_waits_for_complete_frame() {
        let mut full = BytesMut::new();
        encode_frame(
            &mut full,
            OpCode::Binary,
            &[7u8; 300],
            true,
            false,
            Some(generate_mask()),
        );

        let mut parser = parser();
        let mut buf = BytesMut::new();
        let mut frames = 0;
        for chunk in full.chunks(64) {
            buf.extend_from_slice(chunk);
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                assert_eq!(frame.payload.as_ref(), &[7u8; 300][..]);
                frames += 1;
            }
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn unmasked_peer_frame_rejected() {
        let mut buf = BytesMut::from(&[0x81u8, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);
        assert!(matches!(
            parser().parse(&mut buf),
            Err(Error::Protocol("unmasked frame from peer"))
        ));
    }

    #[test]
    fn unmasked_accepted_when_not_required() {
        let mut p = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x81u8, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);
        let frame = p.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn rsv_bits_rejected() {
        // RSV2
        let mut buf = BytesMut::from(&[0xA1u8, 0x80, 0, 0, 0, 0][..]);
        assert!(parser().parse(&mut buf).is_err());

        // RSV1 without negotiated compression
        let mut buf = BytesMut::from(&[0xC1u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            parser().parse(&mut buf),
            Err(Error::IncorrectData(_))
        ));

        // RSV1 accepted once compression is on
        let mut p = parser();
        p.set_compression(true);
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"x", true, true, Some(generate_mask()));
        let frame = p.parse(&mut buf).unwrap().unwrap();
        assert!(frame.header.rsv1);
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        let mut buf = BytesMut::from(&[0x09u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            parser().parse(&mut buf),
            Err(Error::Protocol("fragmented control frame"))
        ));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            OpCode::Ping,
            &[0u8; 126],
            true,
            false,
            Some(generate_mask()),
        );
        assert!(matches!(
            parser().parse(&mut buf),
            Err(Error::Protocol("oversized control frame"))
        ));
    }

    #[test]
    fn non_minimal_lengths_rejected() {
        // 16-bit length for a value under 126
        let mut buf = BytesMut::from(&[0x82u8, 0xFE, 0x00, 0x05][..]);
        assert!(parser().parse(&mut buf).is_err());

        // 64-bit length for a value that fits 16 bits
        let mut buf = BytesMut::from(&[0x82u8, 0xFF, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF][..]);
        assert!(parser().parse(&mut buf).is_err());
    }

    #[test]
    fn frame_over_cap_rejected() {
        let mut p = FrameParser::new(1024, true);
        let mut buf = BytesMut::from(&[0x82u8, 0xFE, 0x08, 0x00][..]); // 2048
        assert!(matches!(p.parse(&mut buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn encode_decode_roundtrip() {
        for (opcode, payload, fin, rsv1) in [
            (OpCode::Text, &b"hello"[..], true, false),
            (OpCode::Binary, &[0x41u8; 1016][..], false, true),
            (OpCode::Continuation, &[0x42u8; 200][..], true, false),
            (OpCode::Ping, &b"ka"[..], true, false),
        ] {
            let mut buf = BytesMut::new();
            encode_frame(&mut buf, opcode, payload, fin, rsv1, Some(generate_mask()));

            let mut p = parser();
            p.set_compression(true);
            let frame = p.parse(&mut buf).unwrap().unwrap();
            assert_eq!(frame.header.opcode, opcode);
            assert_eq!(frame.header.fin, fin);
            assert_eq!(frame.header.rsv1, rsv1);
            assert_eq!(frame.payload.as_ref(), payload);
        }
    }

    #[test]
    fn encode_large_uses_64bit_length() {
        let payload = vec![1u8; 70_000];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &payload, true, false, None);
        assert_eq!(buf[1] & 0x7F, 127);

        let mut p = FrameParser::new(1 << 20, false);
        let frame = p.parse(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"one", true, false, Some(generate_mask()));
        encode_frame(&mut buf, OpCode::Text, b"two", true, false, Some(generate_mask()));

        let mut p = parser();
        let a = p.parse(&mut buf).unwrap().unwrap();
        let b = p.parse(&mut buf).unwrap().unwrap();
        assert_eq!(a.payload.as_ref(), b"one");
        assert_eq!(b.payload.as_ref(), b"two");
        assert!(p.parse(&mut buf).unwrap().is_none());
    }
}
