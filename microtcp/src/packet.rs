//! Segment layout and the CRC-protected codec.
//!
//! A segment travels as one UDP datagram: a fixed 26-byte header followed
//! by at most one MSS of payload.  Encoding and decoding are pure; sockets
//! live in [`crate::socket`].
//!
//! ```text
//! offset  size  field
//!      0     4  seq         first payload byte, or the SYN/FIN itself
//!      4     4  ack         next byte expected from the peer
//!      8     2  control     SYN 0x4000, FIN 0x2000, ACK 0x1000
//!     10     2  window      free receive-buffer space
//!     12     4  data_len    payload length
//!     16     6  reserved    three zero words
//!     22     4  checksum    CRC-32 (ISO-HDLC)
//!     26     -  payload
//! ```
//!
//! Integers are big-endian.  The checksum covers header and payload with the
//! checksum field itself zeroed.

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;

/// Control bits.
pub mod flags {
    /// `ack` carries a cumulative acknowledgement.
    pub const ACK: u16 = 1 << 12;
    /// The sender's byte stream ends here.
    pub const FIN: u16 = 1 << 13;
    /// Opens a connection and carries the initial sequence number.
    pub const SYN: u16 = 1 << 14;

    /// Every bit this protocol defines; the rest are reserved.
    pub const DEFINED: u16 = ACK | FIN | SYN;
}

/// Encoded header size.
pub const HEADER_LEN: usize = 26;

const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CONTROL: usize = 8;
const OFF_WINDOW: usize = 10;
const OFF_DATA_LEN: usize = 12;
const OFF_RESERVED: usize = 16;
const OFF_CHECKSUM: usize = 22;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Decoded segment header, in host byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the first payload byte (or of the SYN/FIN itself).
    pub seq: u32,
    /// Cumulative acknowledgement; meaningful only with [`flags::ACK`].
    pub ack: u32,
    /// Any combination of [`flags`].
    pub control: u16,
    /// Advertised receive window: free receive-buffer space in bytes.
    pub window: u16,
    /// Payload length.  Ignored by [`Packet::encode`]; checked against the
    /// datagram size by [`Packet::decode`].
    pub data_len: u32,
    /// Zero on send; parsed (and covered by the checksum) on receive.
    pub reserved: [u16; 3],
    /// As received.  [`Packet::encode`] always computes a fresh one.
    pub checksum: u32,
}

impl Header {
    /// `true` when **every** bit of `mask` is set in the control field.
    #[inline]
    pub fn has(&self, mask: u16) -> bool {
        self.control & mask == mask
    }

    /// Parse the header fields of `buf` without verifying the checksum.
    ///
    /// Returns `None` when `buf` is shorter than [`HEADER_LEN`].  Used where
    /// a datagram only needs to be classified, not trusted.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            control: read_u16(buf, OFF_CONTROL),
            window: read_u16(buf, OFF_WINDOW),
            data_len: read_u32(buf, OFF_DATA_LEN),
            reserved: [
                read_u16(buf, OFF_RESERVED),
                read_u16(buf, OFF_RESERVED + 2),
                read_u16(buf, OFF_RESERVED + 4),
            ],
            checksum: read_u32(buf, OFF_CHECKSUM),
        })
    }
}

/// One segment: header plus payload.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet; `data_len` and `checksum` are filled in by [`encode`].
    ///
    /// [`encode`]: Packet::encode
    pub fn new(seq: u32, ack: u32, control: u16, window: u16, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                control,
                window,
                ..Header::default()
            },
            payload,
        }
    }

    /// Encode into a fresh datagram.
    ///
    /// `data_len` and `checksum` come from the payload; reserved words and
    /// undefined control bits go out as zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        let h = &self.header;
        write_u32(&mut buf, OFF_SEQ, h.seq);
        write_u32(&mut buf, OFF_ACK, h.ack);
        write_u16(&mut buf, OFF_CONTROL, h.control & flags::DEFINED);
        write_u16(&mut buf, OFF_WINDOW, h.window);
        write_u32(&mut buf, OFF_DATA_LEN, self.payload.len() as u32);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        // Reserved words and the checksum are still zero here.
        let crc = CRC32.checksum(&buf);
        write_u32(&mut buf, OFF_CHECKSUM, crc);

        buf
    }

    /// Decode and verify one datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::parse(buf).ok_or(PacketError::BufferTooShort)?;

        let body = &buf[HEADER_LEN..];
        if body.len() as u64 != u64::from(header.data_len) {
            return Err(PacketError::LengthMismatch);
        }

        let mut digest = CRC32.digest();
        digest.update(&buf[..OFF_CHECKSUM]);
        digest.update(&[0; 4]);
        digest.update(body);
        if digest.finalize() != header.checksum {
            return Err(PacketError::ChecksumFailed);
        }

        Ok(Packet {
            header,
            payload: body.to_vec(),
        })
    }
}

/// Why a datagram was rejected.  The connection layer logs these and drops
/// the datagram; they never reach the application.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram shorter than the {HEADER_LEN}-byte header")]
    BufferTooShort,
    #[error("data_len disagrees with the datagram size")]
    LengthMismatch,
    #[error("bad checksum")]
    ChecksumFailed,
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(seq: u32, ack: u32, control: u16, window: u16, payload: &[u8]) -> Vec<u8> {
        Packet::new(seq, ack, control, window, payload.to_vec()).encode()
    }

    #[test]
    fn data_segment_survives_the_wire() {
        let sent = Packet::new(42, 7, flags::ACK, 4096, b"hello".to_vec());
        let got = Packet::decode(&sent.encode()).unwrap();
        assert_eq!(
            got.header,
            Header {
                data_len: 5,
                checksum: got.header.checksum,
                ..sent.header.clone()
            }
        );
        assert_eq!(got.payload, b"hello");
    }

    #[test]
    fn data_len_is_taken_from_payload() {
        let mut pkt = Packet::new(1, 2, flags::ACK, 8192, b"world".to_vec());
        pkt.header.data_len = 999;
        assert_eq!(read_u32(&pkt.encode(), OFF_DATA_LEN), 5);
    }

    #[test]
    fn short_datagrams_are_rejected() {
        for len in [0, 1, HEADER_LEN - 1] {
            assert_eq!(
                Packet::decode(&vec![0u8; len]),
                Err(PacketError::BufferTooShort),
                "len {len}"
            );
        }
    }

    #[test]
    fn length_field_must_match_datagram() {
        let mut short = segment(0, 0, flags::ACK, 0, b"data");
        short.pop();
        assert_eq!(Packet::decode(&short), Err(PacketError::LengthMismatch));

        let mut long = segment(0, 0, flags::ACK, 0, b"data");
        long.push(0);
        assert_eq!(Packet::decode(&long), Err(PacketError::LengthMismatch));
    }

    #[test]
    fn every_single_byte_corruption_is_rejected() {
        let bytes = segment(0xdead_beef, 17, flags::ACK, 512, b"Hello Server!");
        for i in 0..bytes.len() {
            for mask in [0x01u8, 0x80, 0xff] {
                let mut corrupt = bytes.clone();
                corrupt[i] ^= mask;
                assert!(
                    Packet::decode(&corrupt).is_err(),
                    "flipping byte {i} with {mask:#04x} went undetected"
                );
            }
        }
    }

    #[test]
    fn reserved_words_are_covered_by_checksum() {
        let mut bytes = segment(5, 6, flags::ACK, 100, b"");
        bytes[OFF_RESERVED + 3] = 1;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::ChecksumFailed));
    }

    #[test]
    fn flag_bit_positions() {
        assert_eq!(flags::SYN, 0x4000);
        assert_eq!(flags::FIN, 0x2000);
        assert_eq!(flags::ACK, 0x1000);

        let bytes = segment(0, 0, flags::SYN | flags::ACK, 0, b"");
        assert_eq!(&bytes[OFF_CONTROL..OFF_CONTROL + 2], &[0x50, 0x00]);
    }

    #[test]
    fn undefined_flag_bits_are_cleared_on_send() {
        let bytes = segment(0, 0, flags::FIN | 0x0001, 0, b"");
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.header.control, flags::FIN);
    }

    #[test]
    fn has_requires_every_bit() {
        let h = Packet::new(0, 0, flags::FIN | flags::ACK, 0, Vec::new()).header;
        assert!(h.has(flags::FIN));
        assert!(h.has(flags::FIN | flags::ACK));
        assert!(!h.has(flags::SYN | flags::ACK));
    }

    #[test]
    fn pure_ack_is_header_only() {
        let bytes = segment(0, 1000, flags::ACK, 65535, b"");
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.header.window, 65535);
    }

    #[test]
    fn layout_offsets() {
        assert_eq!(HEADER_LEN, 26);
        assert_eq!(OFF_CHECKSUM + 4, HEADER_LEN);

        let bytes = segment(0x0102_0304, 0x0506_0708, flags::ACK, 0x090a, b"!");
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        assert_eq!(bytes[..4], [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(bytes[4..8], [0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[10..12], [0x09, 0x0a]);
        assert_eq!(bytes[12..16], [0, 0, 0, 1]);
        assert_eq!(bytes[16..22], [0; 6]);
        assert_eq!(bytes[HEADER_LEN], b'!');
    }

    #[test]
    fn checksum_is_crc32_of_zeroed_header_and_payload() {
        let bytes = segment(1, 2, flags::ACK, 3, b"xyz");
        let mut zeroed = bytes.clone();
        zeroed[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        assert_eq!(read_u32(&bytes, OFF_CHECKSUM), CRC32.checksum(&zeroed));
    }

    #[test]
    fn parse_skips_checksum_verification() {
        let mut bytes = segment(9, 0, flags::SYN, 0, b"");
        bytes[OFF_CHECKSUM] ^= 0xff;
        let h = Header::parse(&bytes).unwrap();
        assert_eq!(h.seq, 9);
        assert!(h.has(flags::SYN));
        assert!(Header::parse(&bytes[..HEADER_LEN - 1]).is_none());
    }
}
