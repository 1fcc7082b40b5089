//! RFC 6455 frame codec.
//!
//! Frame headers are parsed and written by tungstenite. Decoded frames carry
//! their payload unmasked together with the masking key they arrived with,
//! so re-encoding reproduces the original bytes.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tungstenite::protocol::frame::coding::OpCode;
use tungstenite::protocol::frame::FrameHeader;

use crate::error::DecodeError;
use crate::message::{Opcode, WebSocketFrame};

/// Default cap on a single frame payload.
pub const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Frame codec used for both legs after an upgrade.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: u64,
}

impl FrameCodec {
    /// Creates a codec with the default payload cap.
    pub fn new() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// Overrides the payload cap.
    pub fn with_max_payload(mut self, max_payload: u64) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = WebSocketFrame;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<WebSocketFrame>, DecodeError> {
        let mut cursor = Cursor::new(&src[..]);
        let Some((header, len)) = FrameHeader::parse(&mut cursor).map_err(invalid)? else {
            return Ok(None);
        };
        let offset = cursor.position() as usize;

        if len >> 63 != 0 {
            return Err(DecodeError::InvalidFrame(
                "most significant length bit set".into(),
            ));
        }
        let opcode = Opcode::from_u8(u8::from(header.opcode)).ok_or_else(|| {
            DecodeError::InvalidFrame(format!("reserved opcode {:?}", header.opcode))
        })?;
        if matches!(header.opcode, OpCode::Control(_)) && (len > 125 || !header.is_final) {
            return Err(DecodeError::InvalidFrame(format!(
                "{opcode:?} frame must be final and at most 125 bytes"
            )));
        }
        if len > self.max_payload {
            return Err(DecodeError::FrameTooLarge(len));
        }

        let len = len as usize;
        if src.len() - offset < len {
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(WebSocketFrame {
            fin: header.is_final,
            rsv: (u8::from(header.rsv1) << 2) | (u8::from(header.rsv2) << 1) | u8::from(header.rsv3),
            opcode,
            mask: header.mask,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<WebSocketFrame> for FrameCodec {
    type Error = DecodeError;

    fn encode(&mut self, frame: WebSocketFrame, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let header = FrameHeader {
            is_final: frame.fin,
            rsv1: frame.rsv & 0b100 != 0,
            rsv2: frame.rsv & 0b010 != 0,
            rsv3: frame.rsv & 0b001 != 0,
            opcode: OpCode::from(frame.opcode.as_u8()),
            mask: frame.mask,
        };

        let mut head = Vec::with_capacity(14);
        header
            .format(frame.payload.len() as u64, &mut head)
            .map_err(invalid)?;

        dst.reserve(head.len() + frame.payload.len());
        dst.put_slice(&head);
        let start = dst.len();
        dst.put_slice(&frame.payload);
        if let Some(key) = frame.mask {
            apply_mask(&mut dst[start..], key);
        }
        Ok(())
    }
}

/// XORs `buf` with the 4-byte masking key; masking and unmasking are the same.
fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn invalid(e: tungstenite::Error) -> DecodeError {
    DecodeError::InvalidFrame(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode(bytes: &[u8]) -> Result<Option<WebSocketFrame>, DecodeError> {
        FrameCodec::new().decode(&mut BytesMut::from(bytes))
    }

    fn encode(frame: WebSocketFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    const MASKED_HELLO: [u8; 11] = [
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];

    #[test]
    fn decodes_unmasked_text() {
        let frame = decode(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'])
            .unwrap()
            .unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.mask, None);
        assert_eq!(frame.as_text(), Some("Hello"));
    }

    #[test]
    fn decodes_masked_text() {
        let frame = decode(&MASKED_HELLO).unwrap().unwrap();
        assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.as_text(), Some("Hello"));
    }

    #[test]
    fn masked_frame_reencodes_byte_exact() {
        let frame = decode(&MASKED_HELLO).unwrap().unwrap();
        assert_eq!(&encode(frame)[..], &MASKED_HELLO[..]);
    }

    #[test]
    fn incomplete_input_waits() {
        assert!(decode(&[0x81]).unwrap().is_none());
        assert!(decode(&MASKED_HELLO[..6]).unwrap().is_none());
        assert!(decode(&[0x82, 0x7E, 0x01]).unwrap().is_none());
    }

    #[test]
    fn extended_16_bit_length() {
        let payload = Bytes::from(vec![7u8; 300]);
        let encoded = encode(WebSocketFrame::binary(payload.clone()));
        assert_eq!(&encoded[..4], &[0x82, 0x7E, 0x01, 0x2C]);

        let frame = decode(&encoded).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn extended_64_bit_length() {
        let payload = Bytes::from(vec![1u8; 70_000]);
        let encoded = encode(WebSocketFrame::binary(payload.clone()));
        assert_eq!(encoded[1], 0x7F);
        assert_eq!(decode(&encoded).unwrap().unwrap().payload, payload);
    }

    #[test]
    fn leaves_following_frame_in_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x89, 0x00, 0x8A, 0x00][..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, Opcode::Ping);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, Opcode::Pong);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn fragmented_message_keeps_flags() {
        let frame = decode(&[0x01, 0x03, b'H', b'e', b'l']).unwrap().unwrap();
        assert!(!frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);

        let frame = decode(&[0x80, 0x02, b'l', b'o']).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Continuation);
    }

    #[test]
    fn rsv_bits_survive_round_trip() {
        let raw = [0xC1, 0x01, b'x'];
        let frame = decode(&raw).unwrap().unwrap();
        assert_eq!(frame.rsv, 0b100);
        assert_eq!(&encode(frame)[..], &raw[..]);
    }

    #[test]
    fn rejects_reserved_opcode() {
        assert!(matches!(
            decode(&[0x83, 0x00]),
            Err(DecodeError::InvalidFrame(_))
        ));
    }

    #[test]
    fn rejects_oversized_control_frame() {
        let mut raw = vec![0x89, 0x7E, 0x00, 0x7E];
        raw.extend(std::iter::repeat(0u8).take(126));
        assert!(matches!(decode(&raw), Err(DecodeError::InvalidFrame(_))));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        assert!(matches!(
            decode(&[0x09, 0x00]),
            Err(DecodeError::InvalidFrame(_))
        ));
    }

    #[test]
    fn enforces_payload_cap() {
        let mut codec = FrameCodec::new().with_max_payload(4);
        let mut buf = BytesMut::from(&[0x82, 0x05, 1, 2, 3, 4, 5][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(DecodeError::FrameTooLarge(5))
        ));
    }
}
