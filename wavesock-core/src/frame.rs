//! WebSocket frame codec
//!
//! Frame header parsing and frame serialization following RFC 6455. The
//! connection streams payloads instead of buffering whole frames, so the
//! inbound side decodes only the header here; payload bytes are unmasked
//! incrementally with [`apply_mask`].

use crate::error::{ProtocolError, Result};
use crate::protocol::{frame_bits::*, Opcode};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Decoded WebSocket frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final frame of the message
    pub fin: bool,
    /// Raw RSV1..RSV3 bits; nonzero means an unnegotiated extension
    pub rsv: u8,
    /// Raw 4-bit opcode field
    pub opcode: u8,
    /// Whether the payload is masked
    pub masked: bool,
    /// Masking key; zeroed when `masked` is false
    pub mask: [u8; 4],
    /// Payload length in bytes
    pub payload_len: u64,
}

impl FrameHeader {
    /// Decode the opcode field; `None` for reserved opcodes
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_bits(self.opcode)
    }

    /// Read the remainder of a header whose first two bytes are already in
    /// hand: 0/2/8 bytes of extended length, then 0/4 bytes of mask.
    pub async fn read_after_prefix<R>(reader: &mut R, b1: u8, b2: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut payload_len = u64::from(b2 & PAYLOAD_LEN_MASK);
        if payload_len == u64::from(PAYLOAD_LEN_16) {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            payload_len = u64::from(u16::from_be_bytes(ext));
        } else if payload_len == u64::from(PAYLOAD_LEN_64) {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            payload_len = u64::from_be_bytes(ext);
        }

        let masked = (b2 & MASK_BIT) != 0;
        let mut mask = [0u8; 4];
        if masked {
            reader.read_exact(&mut mask).await?;
        }

        Ok(Self {
            fin: (b1 & FIN_BIT) != 0,
            rsv: b1 & RSV_MASK,
            opcode: b1 & OPCODE_MASK,
            masked,
            mask,
            payload_len,
        })
    }

    /// Read a complete header from the stream
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; 2];
        reader.read_exact(&mut prefix).await?;
        Self::read_after_prefix(reader, prefix[0], prefix[1]).await
    }

    /// Parse a header from a byte slice. Returns the header and its encoded
    /// length, or `None` when the slice does not yet hold a full header.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 2 {
            return None;
        }
        let b1 = buf[0];
        let b2 = buf[1];
        let mut pos = 2usize;

        let mut payload_len = u64::from(b2 & PAYLOAD_LEN_MASK);
        if payload_len == u64::from(PAYLOAD_LEN_16) {
            if buf.len() < pos + 2 {
                return None;
            }
            payload_len = u64::from(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
            pos += 2;
        } else if payload_len == u64::from(PAYLOAD_LEN_64) {
            if buf.len() < pos + 8 {
                return None;
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[pos..pos + 8]);
            payload_len = u64::from_be_bytes(ext);
            pos += 8;
        }

        let masked = (b2 & MASK_BIT) != 0;
        let mut mask = [0u8; 4];
        if masked {
            if buf.len() < pos + 4 {
                return None;
            }
            mask.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
        }

        Some((
            Self {
                fin: (b1 & FIN_BIT) != 0,
                rsv: b1 & RSV_MASK,
                opcode: b1 & OPCODE_MASK,
                masked,
                mask,
                payload_len,
            },
            pos,
        ))
    }

    /// Validate the header against the frame-level invariants: known opcode,
    /// control frames final and at most 125 bytes.
    pub fn validate(&self) -> Result<Opcode> {
        let opcode = self
            .opcode()
            .ok_or(ProtocolError::UnexpectedOpcode(self.opcode))?;
        if opcode.is_control() {
            if !self.fin {
                return Err(ProtocolError::FragmentedControlFrame.into());
            }
            if self.payload_len > crate::protocol::constants::MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooBig(self.payload_len).into());
            }
        }
        Ok(opcode)
    }
}

/// XOR `buf` with `mask`, indexing the key by the byte's offset within the
/// frame payload.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[((offset + i as u64) & 3) as usize];
    }
}

/// Serialize one frame into `buf`. When `mask` is true a fresh random key is
/// generated and the payload is XOR-masked into the output; the caller's
/// payload is never mutated.
pub fn encode_frame(buf: &mut BytesMut, opcode: Opcode, fin: bool, payload: &[u8], mask: bool) {
    buf.reserve(14 + payload.len());
    let b1 = if fin { FIN_BIT } else { 0 } | opcode.bits();
    buf.put_u8(b1);

    let mask_bit = if mask { MASK_BIT } else { 0 };
    let len = payload.len();
    if len < usize::from(PAYLOAD_LEN_16) {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | PAYLOAD_LEN_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | PAYLOAD_LEN_64);
        buf.put_u64(len as u64);
    }

    if mask {
        let key = rand::random::<[u8; 4]>();
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key, 0);
    } else {
        buf.put_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::MAX_CONTROL_PAYLOAD;

    #[test]
    fn mask_is_an_involution() {
        let original: Vec<u8> = (0u8..=255).collect();
        let mask = [0x37, 0xFA, 0x21, 0x3D];
        let mut buf = original.clone();
        apply_mask(&mut buf, mask, 0);
        assert_ne!(buf, original);
        apply_mask(&mut buf, mask, 0);
        assert_eq!(buf, original);
    }

    #[test]
    fn mask_offset_continues_mid_frame() {
        let mask = [1, 2, 3, 4];
        let mut whole = vec![0u8; 8];
        apply_mask(&mut whole, mask, 0);

        let mut first = vec![0u8; 5];
        let mut rest = vec![0u8; 3];
        apply_mask(&mut first, mask, 0);
        apply_mask(&mut rest, mask, 5);
        first.extend_from_slice(&rest);
        assert_eq!(first, whole);
    }

    #[test]
    fn short_frame_round_trip() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Text, true, b"hello", false);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);

        let (header, n) = FrameHeader::parse(&buf).unwrap();
        assert_eq!(n, 2);
        assert!(header.fin);
        assert_eq!(header.opcode(), Some(Opcode::Text));
        assert!(!header.masked);
        assert_eq!(header.payload_len, 5);
        assert_eq!(&buf[n..], b"hello");
    }

    #[test]
    fn extended_16_bit_length() {
        let payload = vec![0xAB; 300];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Binary, true, &payload, false);
        assert_eq!(buf[1], 126);

        let (header, n) = FrameHeader::parse(&buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(header.payload_len, 300);
        assert_eq!(header.opcode(), Some(Opcode::Binary));
    }

    #[test]
    fn extended_64_bit_length() {
        let payload = vec![0u8; 70_000];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Binary, true, &payload, false);
        assert_eq!(buf[1], 127);

        let (header, n) = FrameHeader::parse(&buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(header.payload_len, 70_000);
    }

    #[test]
    fn masked_frame_round_trip() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Text, true, b"hello", true);
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(buf.len(), 2 + 4 + 5);

        let (header, n) = FrameHeader::parse(&buf).unwrap();
        assert!(header.masked);
        let mut payload = buf[n..].to_vec();
        apply_mask(&mut payload, header.mask, 0);
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn non_final_continuation() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Continuation, false, b"tail", false);
        let (header, _) = FrameHeader::parse(&buf).unwrap();
        assert!(!header.fin);
        assert_eq!(header.opcode(), Some(Opcode::Continuation));
        assert!(header.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_control_frames() {
        let fragmented = FrameHeader {
            fin: false,
            rsv: 0,
            opcode: Opcode::Ping.bits(),
            masked: false,
            mask: [0; 4],
            payload_len: 0,
        };
        assert!(fragmented.validate().is_err());

        let oversize = FrameHeader {
            fin: true,
            rsv: 0,
            opcode: Opcode::Close.bits(),
            masked: false,
            mask: [0; 4],
            payload_len: MAX_CONTROL_PAYLOAD + 1,
        };
        assert!(oversize.validate().is_err());

        let reserved = FrameHeader {
            fin: true,
            rsv: 0,
            opcode: 0x5,
            masked: false,
            mask: [0; 4],
            payload_len: 0,
        };
        assert!(reserved.validate().is_err());
    }

    #[tokio::test]
    async fn async_header_read_matches_parse() {
        let payload = vec![7u8; 300];
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, Opcode::Binary, true, &payload, true);

        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let header = FrameHeader::read(&mut cursor).await.unwrap();
        let (parsed, n) = FrameHeader::parse(&buf).unwrap();
        assert_eq!(header, parsed);
        assert_eq!(cursor.position() as usize, n);
    }
}
