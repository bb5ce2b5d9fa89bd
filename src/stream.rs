//! Stream Header and Stream Footer codecs.
//!
//! Both framing fields are fixed 12-byte structures. The header carries the
//! magic and the check type; the footer repeats the flags and adds the
//! backward-size, the encoded length of the Index, so a reader starting at
//! the end of the file can find the Index without scanning forward.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};

use crate::check::CheckType;
use crate::error::XzError;

pub const HEADER_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
pub const FOOTER_MAGIC: [u8; 2] = [0x59, 0x5A];

/// Encoded size of the Stream Header, and of the Stream Footer.
pub const STREAM_HEADER_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFlags {
    pub check: CheckType,
}

impl StreamFlags {
    fn encode(&self) -> [u8; 2] {
        [0x00, self.check.id()]
    }

    fn decode(bytes: [u8; 2]) -> Result<Self, XzError> {
        if bytes[0] != 0x00 || bytes[1] & 0xF0 != 0 {
            return Err(XzError::UnsupportedFilterChain(
                "unsupported options in XZ stream flags".to_string(),
            ));
        }
        Ok(Self {
            check: CheckType::from_id(bytes[1])?,
        })
    }
}

pub fn write_stream_header<W: Write>(w: &mut W, flags: StreamFlags) -> Result<(), XzError> {
    let flag_bytes = flags.encode();
    let mut buf = [0u8; 12];
    buf[..6].copy_from_slice(&HEADER_MAGIC);
    buf[6..8].copy_from_slice(&flag_bytes);
    LittleEndian::write_u32(&mut buf[8..], crc32fast::hash(&flag_bytes));
    w.write_all(&buf)?;
    Ok(())
}

/// Parse a Stream Header from a 12-byte buffer.
pub fn decode_stream_header(buf: &[u8; 12]) -> Result<StreamFlags, XzError> {
    if buf[..6] != HEADER_MAGIC {
        return Err(XzError::CorruptedInput(
            "input is not in the XZ format".to_string(),
        ));
    }
    let stored_crc = LittleEndian::read_u32(&buf[8..]);
    if stored_crc != crc32fast::hash(&buf[6..8]) {
        return Err(XzError::CorruptedInput(
            "XZ stream header is corrupt".to_string(),
        ));
    }
    StreamFlags::decode([buf[6], buf[7]])
}

pub fn read_stream_header<R: Read>(src: &mut R) -> Result<StreamFlags, XzError> {
    let mut buf = [0u8; 12];
    src.read_exact(&mut buf)?;
    decode_stream_header(&buf)
}

/// Write a Stream Footer for an Index of `index_len` encoded bytes.
pub fn write_stream_footer<W: Write>(
    w: &mut W,
    flags: StreamFlags,
    index_len: u64,
) -> Result<(), XzError> {
    let mut buf = [0u8; 12];
    LittleEndian::write_u32(&mut buf[4..8], (index_len / 4 - 1) as u32);
    buf[8..10].copy_from_slice(&flags.encode());
    let crc = crc32fast::hash(&buf[4..10]);
    LittleEndian::write_u32(&mut buf[..4], crc);
    buf[10..].copy_from_slice(&FOOTER_MAGIC);
    w.write_all(&buf)?;
    Ok(())
}

/// Parse a Stream Footer from a 12-byte buffer.
///
/// Returns the flags and the encoded length of the Index in bytes.
pub fn decode_stream_footer(buf: &[u8; 12]) -> Result<(StreamFlags, u64), XzError> {
    if buf[10..] != FOOTER_MAGIC {
        return Err(XzError::CorruptedInput(
            "XZ stream footer is corrupt".to_string(),
        ));
    }
    let stored_crc = LittleEndian::read_u32(&buf[..4]);
    if stored_crc != crc32fast::hash(&buf[4..10]) {
        return Err(XzError::CorruptedInput(
            "XZ stream footer is corrupt".to_string(),
        ));
    }
    let flags = StreamFlags::decode([buf[8], buf[9]])?;
    let index_len = (u64::from(LittleEndian::read_u32(&buf[4..8])) + 1) * 4;
    Ok((flags, index_len))
}

pub fn read_stream_footer<R: Read>(src: &mut R) -> Result<(StreamFlags, u64), XzError> {
    let mut buf = [0u8; 12];
    src.read_exact(&mut buf)?;
    decode_stream_footer(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for check in [
            CheckType::None,
            CheckType::Crc32,
            CheckType::Crc64,
            CheckType::Sha256,
        ] {
            let flags = StreamFlags { check };
            let mut buf = Vec::new();
            write_stream_header(&mut buf, flags).unwrap();
            assert_eq!(buf.len(), 12);
            assert_eq!(read_stream_header(&mut &buf[..]).unwrap(), flags);
        }
    }

    #[test]
    fn footer_round_trip() {
        let flags = StreamFlags {
            check: CheckType::Crc64,
        };
        let mut buf = Vec::new();
        write_stream_footer(&mut buf, flags, 64).unwrap();
        assert_eq!(buf.len(), 12);
        let (parsed, index_len) = read_stream_footer(&mut &buf[..]).unwrap();
        assert_eq!(parsed, flags);
        assert_eq!(index_len, 64);
    }

    #[test]
    fn bad_magic_is_not_xz() {
        let mut buf = Vec::new();
        write_stream_header(
            &mut buf,
            StreamFlags {
                check: CheckType::Crc32,
            },
        )
        .unwrap();
        buf[0] = 0x1F; // gzip's first byte
        let err = read_stream_header(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(ref m) if m.contains("not in the XZ format")));
    }

    #[test]
    fn header_crc_is_verified() {
        let mut buf = Vec::new();
        write_stream_header(
            &mut buf,
            StreamFlags {
                check: CheckType::Crc32,
            },
        )
        .unwrap();
        buf[9] ^= 0x01;
        assert!(read_stream_header(&mut &buf[..]).is_err());
    }

    #[test]
    fn reserved_flag_bits_are_rejected() {
        let flag_bytes = [0x00u8, 0x11]; // high nibble set
        let mut buf = [0u8; 12];
        buf[..6].copy_from_slice(&HEADER_MAGIC);
        buf[6..8].copy_from_slice(&flag_bytes);
        LittleEndian::write_u32(&mut buf[8..], crc32fast::hash(&flag_bytes));
        assert!(matches!(
            decode_stream_header(&buf),
            Err(XzError::UnsupportedFilterChain(_))
        ));
    }

    #[test]
    fn undefined_check_id_is_corrupt() {
        let flag_bytes = [0x00u8, 0x02];
        let mut buf = [0u8; 12];
        buf[..6].copy_from_slice(&HEADER_MAGIC);
        buf[6..8].copy_from_slice(&flag_bytes);
        LittleEndian::write_u32(&mut buf[8..], crc32fast::hash(&flag_bytes));
        assert!(matches!(
            decode_stream_header(&buf),
            Err(XzError::CorruptedInput(_))
        ));
    }

    #[test]
    fn footer_magic_is_verified() {
        let mut buf = Vec::new();
        write_stream_footer(
            &mut buf,
            StreamFlags {
                check: CheckType::None,
            },
            16,
        )
        .unwrap();
        buf[11] = b'X';
        assert!(read_stream_footer(&mut &buf[..]).is_err());
    }
}
