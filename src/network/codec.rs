//! Wire framing
//!
//! Frames are laid out as
//! `MAGIC(4) | TYPE(4) | HAS_ID(1) | ID(4 iff HAS_ID) | LENGTH(4) |
//! CHECKSUM(4 iff LENGTH>0) | DATA`, all integers big-endian. The decoder
//! distinguishes "not enough bytes yet" (`Ok(None)`, caller keeps buffering)
//! from malformed input (`Err`, caller disconnects).

use super::message::{Message, MessageType, Payload, MAX_DATA_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Fixed prefix identifying this protocol; foreign traffic is rejected on
/// the first four bytes.
pub const MAGIC: [u8; 4] = *b"MESH";

/// Truncated-digest checksum width.
pub const CHECKSUM_LENGTH: usize = 4;

/// Fatal framing errors. Every variant terminates the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid magic bytes")]
    BadMagic,
    #[error("unknown message type code {0}")]
    UnknownType(u32),
    #[error("payload length {0} exceeds limit")]
    OversizedPayload(usize),
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("malformed {0} payload")]
    Malformed(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// First four bytes of the SHA-256 digest of the payload. Computed on
/// encode, verified on decode.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LENGTH] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; CHECKSUM_LENGTH];
    out.copy_from_slice(&digest[..CHECKSUM_LENGTH]);
    out
}

/// Codec for the framed message protocol.
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.payload.write(&mut body);

        if body.len() > MAX_DATA_SIZE {
            return Err(ProtocolError::OversizedPayload(body.len()));
        }

        dst.reserve(17 + CHECKSUM_LENGTH + body.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(item.kind().code());
        match item.id {
            Some(id) => {
                dst.put_u8(1);
                dst.put_u32(id);
            }
            None => dst.put_u8(0),
        }
        dst.put_u32(body.len() as u32);
        if !body.is_empty() {
            dst.put_slice(&checksum(&body));
            dst.put_slice(&body);
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Magic is rejected as soon as four bytes are in, before waiting
        // for the rest of the header.
        if src.len() < 4 {
            return Ok(None);
        }
        if src[..4] != MAGIC {
            return Err(ProtocolError::BadMagic);
        }

        // MAGIC + TYPE + HAS_ID
        if src.len() < 9 {
            return Ok(None);
        }
        let code = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let kind = MessageType::from_code(code).ok_or(ProtocolError::UnknownType(code))?;
        let has_id = src[8] != 0;

        let mut header = 9;
        let id = if has_id {
            if src.len() < header + 4 {
                return Ok(None);
            }
            let id = u32::from_be_bytes([src[9], src[10], src[11], src[12]]);
            header += 4;
            Some(id)
        } else {
            None
        };

        if src.len() < header + 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            src[header],
            src[header + 1],
            src[header + 2],
            src[header + 3],
        ]) as usize;
        header += 4;

        // The length bound is checked before any payload bytes are
        // buffered, so the accumulation buffer never grows past one
        // maximum-size frame.
        if len > MAX_DATA_SIZE {
            return Err(ProtocolError::OversizedPayload(len));
        }

        let total = header + if len > 0 { CHECKSUM_LENGTH + len } else { 0 };
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header);
        let payload = if len > 0 {
            let mut expected = [0u8; CHECKSUM_LENGTH];
            expected.copy_from_slice(&src[..CHECKSUM_LENGTH]);
            src.advance(CHECKSUM_LENGTH);
            let data = src.split_to(len);
            if checksum(&data) != expected {
                return Err(ProtocolError::ChecksumMismatch);
            }
            Payload::read(kind, &data)?
        } else {
            Payload::read(kind, &[])?
        };

        Ok(Some(Message { id, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_frame_round_trip() {
        let message = Message::with_id(77, Payload::Height(12345));
        let mut buf = encode(message.clone());
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_round_trip_without_id() {
        let message = Message::new(Payload::Height(7));
        let mut buf = encode(message.clone());
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_empty_payload_has_no_checksum() {
        // MAGIC + TYPE + HAS_ID + LENGTH, nothing else.
        let buf = encode(Message::new(Payload::Ping));
        assert_eq!(buf.len(), 13);
        // With an id: four more bytes.
        let buf = encode(Message::with_id(1, Payload::Ping));
        assert_eq!(buf.len(), 17);
    }

    #[test]
    fn test_partial_frames_need_more_data() {
        let full = encode(Message::with_id(42, Payload::Height(99)));
        for n in 0..full.len() {
            let mut partial = BytesMut::from(&full[..n]);
            assert!(
                MessageCodec.decode(&mut partial).unwrap().is_none(),
                "prefix of {} bytes should not decode",
                n
            );
        }
        let mut whole = full.clone();
        assert!(MessageCodec.decode(&mut whole).unwrap().is_some());
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let mut buf = encode(Message::new(Payload::Ping));
        buf[0] ^= 0xFF;
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(ProtocolError::BadMagic)
        ));
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(999);
        buf.put_u8(0);
        buf.put_u32(0);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(ProtocolError::UnknownType(999))
        ));
    }

    #[test]
    fn test_oversized_length_is_fatal_before_buffering() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(MessageType::Block.code());
        buf.put_u8(0);
        buf.put_u32((MAX_DATA_SIZE + 1) as u32);
        // No payload bytes present; the declared length alone is fatal.
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(ProtocolError::OversizedPayload(_))
        ));
    }

    #[test]
    fn test_flipping_any_payload_byte_breaks_checksum() {
        let message = Message::new(Payload::Block {
            height: 3,
            data: vec![0xA5; 32],
        });
        let clean = encode(message);
        // Payload starts after MAGIC(4)+TYPE(4)+HAS_ID(1)+LENGTH(4)+CHECKSUM(4).
        let payload_start = 17;
        for i in payload_start..clean.len() {
            let mut buf = clean.clone();
            buf[i] ^= 0x01;
            assert!(
                matches!(
                    MessageCodec.decode(&mut buf),
                    Err(ProtocolError::ChecksumMismatch)
                ),
                "flipped byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_oversized_encode_is_rejected() {
        let message = Message::new(Payload::Block {
            height: 1,
            data: vec![0u8; MAX_DATA_SIZE],
        });
        let mut buf = BytesMut::new();
        assert!(matches!(
            MessageCodec.encode(message, &mut buf),
            Err(ProtocolError::OversizedPayload(_))
        ));
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let mut buf = encode(Message::new(Payload::Height(1)));
        buf.extend_from_slice(&encode(Message::new(Payload::Height(2))));
        let first = MessageCodec.decode(&mut buf).unwrap().unwrap();
        let second = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload, Payload::Height(1));
        assert_eq!(second.payload, Payload::Height(2));
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
    }
}
