//! Index codec — the per-Stream table of Block sizes.
//!
//! The Index is what makes random access possible: one Record per Block,
//! in Block order, each holding the Block's unpadded size (header +
//! compressed payload + check, without padding) and its uncompressed size.
//! Prefix sums over the Records give every Block's compressed and
//! uncompressed offset without decoding anything.
//!
//! Encoding: Index Indicator 0x00, VLI Record count, the Records, zero
//! padding to a 4-byte multiple, and a CRC32 over everything before it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::XzError;
use crate::filter::check_memory_limit;
use crate::vli::{read_vli, write_vli};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub unpadded_size: u64,
    pub uncompressed_size: u64,
}

impl Record {
    /// Total bytes the Block occupies in the Stream, padding included.
    pub fn padded_size(&self) -> u64 {
        (self.unpadded_size + 3) & !3
    }
}

/// A decoded Index plus the bookkeeping the callers need.
#[derive(Debug)]
pub struct ParsedIndex {
    pub records: Vec<Record>,
    /// Total encoded size of the Index field, indicator through CRC32.
    pub encoded_len: u64,
    /// Declared memory cost of holding these Records, in KiB.
    pub memory_kib: u64,
}

/// Serialize the Index and return its encoded length in bytes.
pub fn write_index<W: Write>(w: &mut W, records: &[Record]) -> Result<u64, XzError> {
    let mut buf = vec![0x00u8]; // Index Indicator
    write_vli(&mut buf, records.len() as u64)?;
    for record in records {
        write_vli(&mut buf, record.unpadded_size)?;
        write_vli(&mut buf, record.uncompressed_size)?;
    }
    while buf.len() % 4 != 0 {
        buf.push(0x00);
    }
    let crc = crc32fast::hash(&buf);
    w.write_all(&buf)?;
    w.write_u32::<LittleEndian>(crc)?;
    Ok(buf.len() as u64 + 4)
}

/// Parse an Index whose indicator byte 0x00 was already consumed.
///
/// `expected_len`, when known from a Stream Footer's backward-size, bounds
/// the Record count up front and must match the actually-parsed length.
/// The Records' memory cost is checked against the limit before they are
/// materialized.
pub fn read_index<R: Read>(
    src: &mut R,
    memory_limit_kib: Option<u64>,
    expected_len: Option<u64>,
) -> Result<ParsedIndex, XzError> {
    let mut checked = Crc32Reader::new(src);
    checked.absorb(&[0x00]); // the indicator the caller consumed

    let count = read_vli(&mut checked)?;

    // A Record takes at least two bytes, so a count anywhere near the
    // encoded length is nonsense.
    if let Some(len) = expected_len {
        if count >= len / 2 {
            return Err(index_corrupt());
        }
    }
    if count > u64::from(u32::MAX) {
        return Err(XzError::UnsupportedFilterChain(format!(
            "XZ index has {count} records, more than supported"
        )));
    }

    let memory_kib = 1 + (16 * count + 1023) / 1024;
    check_memory_limit(memory_kib, memory_limit_kib)?;

    let mut records = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        let unpadded_size = read_vli(&mut checked)?;
        let uncompressed_size = read_vli(&mut checked)?;
        if unpadded_size == 0 {
            return Err(index_corrupt());
        }
        records.push(Record {
            unpadded_size,
            uncompressed_size,
        });
    }

    // Index Padding
    while checked.len % 4 != 0 {
        if checked.read_u8()? != 0x00 {
            return Err(index_corrupt());
        }
    }

    let encoded_len = checked.len + 4;
    if expected_len.is_some_and(|len| len != encoded_len) {
        return Err(index_corrupt());
    }

    let computed = checked.hasher.finalize();
    let stored = checked.inner.read_u32::<LittleEndian>()?;
    if computed != stored {
        return Err(index_corrupt());
    }

    Ok(ParsedIndex {
        records,
        encoded_len,
        memory_kib,
    })
}

fn index_corrupt() -> XzError {
    XzError::CorruptedInput("XZ index is corrupt".to_string())
}

/// Reader decorator that feeds every consumed byte into a CRC32 and counts
/// them, so the Index CRC can be verified without buffering the field.
struct Crc32Reader<'a, R> {
    inner: &'a mut R,
    hasher: crc32fast::Hasher,
    len: u64,
}

impl<'a, R: Read> Crc32Reader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            len: 0,
        }
    }

    /// Account for bytes the caller consumed before handing us the source.
    fn absorb(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }
}

impl<R: Read> Read for Crc32Reader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ByteOrder;

    fn sample_records() -> Vec<Record> {
        vec![
            Record {
                unpadded_size: 130,
                uncompressed_size: 100,
            },
            Record {
                unpadded_size: 285,
                uncompressed_size: 250,
            },
            Record {
                unpadded_size: 99,
                uncompressed_size: 75,
            },
        ]
    }

    fn encode(records: &[Record]) -> (Vec<u8>, u64) {
        let mut buf = Vec::new();
        let len = write_index(&mut buf, records).unwrap();
        assert_eq!(len, buf.len() as u64);
        assert_eq!(len % 4, 0);
        (buf, len)
    }

    #[test]
    fn round_trip() {
        let records = sample_records();
        let (buf, len) = encode(&records);
        assert_eq!(buf[0], 0x00);

        let mut src = &buf[1..];
        let parsed = read_index(&mut src, None, Some(len)).unwrap();
        assert_eq!(parsed.records, records);
        assert_eq!(parsed.encoded_len, len);
    }

    #[test]
    fn empty_index_round_trips() {
        let (buf, len) = encode(&[]);
        let mut src = &buf[1..];
        let parsed = read_index(&mut src, None, Some(len)).unwrap();
        assert!(parsed.records.is_empty());
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let records = sample_records();
        let (mut buf, len) = encode(&records);
        let pos = buf.len() - 6; // inside the padding / record area
        buf[pos] ^= 0x40;

        let mut src = &buf[1..];
        let err = read_index(&mut src, None, Some(len)).unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(_)));
    }

    #[test]
    fn wrong_backward_size_is_detected() {
        let records = sample_records();
        let (buf, len) = encode(&records);
        let mut src = &buf[1..];
        let err = read_index(&mut src, None, Some(len + 4)).unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(_)));
    }

    #[test]
    fn absurd_record_count_is_rejected_before_allocation() {
        // Hand-craft an index claiming a huge record count.
        let mut buf = vec![0x00u8];
        write_vli(&mut buf, 1 << 30).unwrap();
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        let crc = crc32fast::hash(&buf);
        let mut crc_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut crc_bytes, crc);
        buf.extend_from_slice(&crc_bytes);

        let len = buf.len() as u64;
        let mut src = &buf[1..];
        assert!(matches!(
            read_index(&mut src, None, Some(len)),
            Err(XzError::CorruptedInput(_))
        ));

        // Without a known length the memory limit stops it instead.
        let mut src = &buf[1..];
        assert!(matches!(
            read_index(&mut src, Some(1024), None),
            Err(XzError::MemoryLimitExceeded { .. })
        ));
    }

    #[test]
    fn zero_unpadded_size_is_corrupt() {
        let mut buf = vec![0x00u8];
        write_vli(&mut buf, 1).unwrap();
        write_vli(&mut buf, 0).unwrap(); // unpadded_size — invalid
        write_vli(&mut buf, 10).unwrap();
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        let mut src = &buf[1..];
        assert!(matches!(
            read_index(&mut src, None, None),
            Err(XzError::CorruptedInput(_))
        ));
    }
}
