//! Block codec — one filter-chain-compressed segment of a Stream.
//!
//! On disk a Block is: a CRC32-protected header (filter chain description
//! plus optional declared sizes), the compressed payload, zero padding to
//! the next 4-byte boundary, and the integrity digest over the uncompressed
//! bytes.
//!
//! A Block Header always starts with its size in 4-byte units minus one; a
//! value of 0x00 at that position is not a Block at all but the Index
//! Indicator, so the caller reads the first byte through
//! [`read_block_start`] and switches to Index parsing when told to.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::check::{Check, CheckType};
use crate::count::{CountingReader, CountingWriter};
use crate::error::XzError;
use crate::filter::{self, Filter, FinishWrite};
use crate::index::Record;
use crate::vli::{read_vli, write_vli, VLI_MAX};

pub const BLOCK_HEADER_SIZE_MAX: usize = 1024;

/// How much decoded data to pull out of the filter chain per step. Size
/// mismatches are detected at these boundaries, not only at the very end.
const DECODE_CHUNK: usize = 8192;

// ── Block Header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub filters: Vec<Filter>,
    pub compressed_size: Option<u64>,
    pub uncompressed_size: Option<u64>,
}

impl BlockHeader {
    /// Serialize the header: size byte, flags, optional VLI sizes, one
    /// filter-flags record per filter, zero padding to a 4-byte multiple,
    /// and the CRC32 over everything before it.
    pub fn encode(&self) -> Result<Vec<u8>, XzError> {
        debug_assert!(!self.filters.is_empty() && self.filters.len() <= 4);

        let mut body = Vec::new();
        let mut flags = (self.filters.len() - 1) as u8;
        if self.compressed_size.is_some() {
            flags |= 0x40;
        }
        if self.uncompressed_size.is_some() {
            flags |= 0x80;
        }
        body.push(flags);

        if let Some(size) = self.compressed_size {
            write_vli(&mut body, size)?;
        }
        if let Some(size) = self.uncompressed_size {
            write_vli(&mut body, size)?;
        }

        for filter in &self.filters {
            write_vli(&mut body, filter.filter_id())?;
            let props = filter.encoded_properties();
            write_vli(&mut body, props.len() as u64)?;
            body.extend_from_slice(&props);
        }

        // Size byte + body + CRC32, rounded up to the next 4-byte multiple.
        let header_size = (1 + body.len() + 4 + 3) & !3;
        if header_size > BLOCK_HEADER_SIZE_MAX {
            return Err(XzError::UnsupportedFilterChain(
                "block header would exceed 1024 bytes".to_string(),
            ));
        }

        let mut out = Vec::with_capacity(header_size);
        out.push((header_size / 4 - 1) as u8);
        out.extend_from_slice(&body);
        out.resize(header_size - 4, 0x00);
        let crc = crc32fast::hash(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    /// Parse a header whose first byte (already consumed by the caller and
    /// known to be non-zero) is `size_byte`. Returns the header and its
    /// total encoded size.
    pub fn decode<R: Read>(size_byte: u8, src: &mut R) -> Result<(BlockHeader, usize), XzError> {
        debug_assert_ne!(size_byte, 0);
        let header_size = 4 * (size_byte as usize + 1);
        let mut buf = vec![0u8; header_size];
        buf[0] = size_byte;
        src.read_exact(&mut buf[1..])
            .map_err(|e| XzError::from(e).truncated("block header"))?;

        let stored_crc = LittleEndian::read_u32(&buf[header_size - 4..]);
        if crc32fast::hash(&buf[..header_size - 4]) != stored_crc {
            return Err(XzError::CorruptedInput(
                "block header CRC32 mismatch".to_string(),
            ));
        }

        let flags = buf[1];
        if flags & 0x3C != 0 {
            return Err(XzError::UnsupportedFilterChain(
                "reserved bits set in block flags".to_string(),
            ));
        }
        let filter_count = (flags & 0x03) as usize + 1;

        // Parse the fields between the flags byte and the CRC32.
        let fields = &buf[2..header_size - 4];
        let mut cursor = Cursor::new(fields);

        let compressed_size = if flags & 0x40 != 0 {
            Some(read_vli(&mut cursor).map_err(corrupt_header)?)
        } else {
            None
        };
        let uncompressed_size = if flags & 0x80 != 0 {
            Some(read_vli(&mut cursor).map_err(corrupt_header)?)
        } else {
            None
        };

        let mut filters = Vec::with_capacity(filter_count);
        for _ in 0..filter_count {
            let id = read_vli(&mut cursor).map_err(corrupt_header)?;
            let props_len = read_vli(&mut cursor).map_err(corrupt_header)?;
            let remaining = fields.len() as u64 - cursor.position();
            if props_len > remaining {
                return Err(XzError::CorruptedInput(
                    "block header is corrupt".to_string(),
                ));
            }
            let start = cursor.position() as usize;
            let props = &fields[start..start + props_len as usize];
            cursor.set_position(cursor.position() + props_len);
            filters.push(Filter::from_id_props(id, props)?);
        }

        // Header padding must be zero.
        if fields[cursor.position() as usize..].iter().any(|&b| b != 0) {
            return Err(XzError::UnsupportedFilterChain(
                "non-zero padding in block header".to_string(),
            ));
        }

        Ok((
            BlockHeader {
                filters,
                compressed_size,
                uncompressed_size,
            },
            header_size,
        ))
    }
}

fn corrupt_header(e: XzError) -> XzError {
    match e {
        XzError::UnexpectedEof(_) => XzError::CorruptedInput("block header is corrupt".to_string()),
        other => other,
    }
}

impl XzError {
    fn truncated(self, what: &str) -> XzError {
        match self {
            XzError::UnexpectedEof(_) => {
                XzError::UnexpectedEof(format!("input ended inside a {what}"))
            }
            other => other,
        }
    }
}

// ── Block boundary ───────────────────────────────────────────────────────────

/// What the first byte at a Block-boundary position turned out to be.
pub enum BlockStart {
    /// A Block Header begins here; the value is its size byte.
    Block(u8),
    /// The Index Indicator: no more Blocks in this Stream.
    IndexIndicator,
}

pub fn read_block_start<R: Read>(src: &mut R) -> Result<BlockStart, XzError> {
    match src.read_u8()? {
        0x00 => Ok(BlockStart::IndexIndicator),
        size_byte => Ok(BlockStart::Block(size_byte)),
    }
}

// ── Encode ───────────────────────────────────────────────────────────────────

/// Write one complete Block and return its Index record.
///
/// The header omits the declared-size fields; the sizes end up in the Index
/// instead. The integrity digest is computed over the raw uncompressed
/// bytes while they pass into the filter chain.
pub fn write_block<W: Write>(
    sink: &mut W,
    filters: &[Filter],
    check_type: CheckType,
    data: &[u8],
) -> Result<Record, XzError> {
    filter::validate_chain(filters)?;

    let header = BlockHeader {
        filters: filters.to_vec(),
        compressed_size: None,
        uncompressed_size: None,
    };
    let header_bytes = header.encode()?;
    sink.write_all(&header_bytes)?;

    let counted = CountingWriter::new(&mut *sink);
    let counter = counted.counter();
    {
        let mut chain: Box<dyn FinishWrite + '_> = Box::new(counted);
        for f in filters.iter().rev() {
            chain = f.wrap_encoder(chain);
        }
        chain.write_all(data)?;
        chain.finish()?;
    }

    let compressed = counter.get();
    let pad_len = ((4 - (compressed % 4)) % 4) as usize;
    sink.write_all(&[0u8; 3][..pad_len])?;

    let mut check = Check::new(check_type);
    check.update(data);
    sink.write_all(&check.finish())?;

    Ok(Record {
        unpadded_size: header_bytes.len() as u64 + compressed + check_type.size() as u64,
        uncompressed_size: data.len() as u64,
    })
}

// ── Decode ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct DecodedBlock {
    pub data: Vec<u8>,
    pub unpadded_size: u64,
    pub uncompressed_size: u64,
}

/// Decode one Block whose size byte was already read.
///
/// `expected` carries the Index record in random-access mode; the Block's
/// actual sizes must match it exactly. The declared memory cost of the
/// filter chain is checked against `memory_limit_kib` before the chain is
/// built, so a limit violation never allocates the decoder state.
pub fn read_block<R: Read>(
    src: &mut R,
    size_byte: u8,
    check_type: CheckType,
    verify_check: bool,
    memory_limit_kib: Option<u64>,
    expected: Option<Record>,
) -> Result<DecodedBlock, XzError> {
    let (header, header_size) = BlockHeader::decode(size_byte, src)?;
    filter::validate_chain(&header.filters)?;
    filter::check_memory_limit(
        filter::chain_decoder_memory_kib(&header.filters),
        memory_limit_kib,
    )?;

    let check_size = check_type.size() as u64;
    let mut compressed_limit = (VLI_MAX & !3) - header_size as u64 - check_size;
    let mut declared_compressed = header.compressed_size;
    let mut declared_uncompressed = header.uncompressed_size;

    if let Some(size) = declared_compressed {
        if size == 0 || size > compressed_limit {
            return Err(XzError::CorruptedInput(
                "declared compressed size is invalid".to_string(),
            ));
        }
        compressed_limit = size;
    }

    // Cross-validate against the Index record when doing random access.
    if let Some(record) = expected {
        let header_and_check = header_size as u64 + check_size;
        // The compressed payload is at least one byte.
        if record.unpadded_size <= header_and_check {
            return Err(index_mismatch());
        }
        let compressed_from_index = record.unpadded_size - header_and_check;
        if compressed_from_index > compressed_limit
            || declared_compressed.is_some_and(|c| c != compressed_from_index)
            || declared_uncompressed.is_some_and(|u| u != record.uncompressed_size)
        {
            return Err(index_mismatch());
        }
        compressed_limit = compressed_from_index;
        declared_compressed = Some(compressed_from_index);
        declared_uncompressed = Some(record.uncompressed_size);
    }

    let mut check = Check::new(check_type);
    let mut data = Vec::new();

    // The chain never sees a byte past the compressed-size ceiling, so a
    // corrupt block cannot pull the source into the following structure.
    let mut counted = CountingReader::new((&mut *src).take(compressed_limit));
    let counter = counted.counter();
    {
        let mut chain: Box<dyn Read + '_> = Box::new(&mut counted);
        for f in header.filters.iter().rev() {
            chain = f.wrap_decoder(chain);
        }

        let mut chunk = [0u8; DECODE_CHUNK];
        loop {
            let n = match chain.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    let err = XzError::from(e);
                    // Running dry exactly at the ceiling means the payload
                    // claims more bytes than were declared for it.
                    if counter.get() >= compressed_limit
                        && matches!(err, XzError::UnexpectedEof(_))
                    {
                        return Err(XzError::CorruptedInput(
                            "compressed data exceeds the declared size".to_string(),
                        ));
                    }
                    return Err(err);
                }
            };
            if n == 0 {
                break;
            }
            if verify_check {
                check.update(&chunk[..n]);
            }
            data.extend_from_slice(&chunk[..n]);

            // Catch size mismatches as early as possible.
            if declared_uncompressed.is_some_and(|u| (data.len() as u64) > u) {
                return Err(XzError::CorruptedInput(
                    "uncompressed data exceeds the declared size".to_string(),
                ));
            }
        }
    }

    let compressed = counter.get();
    if declared_compressed.is_some_and(|c| c != compressed)
        || declared_uncompressed.is_some_and(|u| u != data.len() as u64)
    {
        return Err(XzError::CorruptedInput(
            "block sizes do not match the declared sizes".to_string(),
        ));
    }

    // Block Padding bytes must be zeros.
    let mut padded = compressed;
    while padded & 3 != 0 {
        if src
            .read_u8()
            .map_err(|e| XzError::from(e).truncated("block"))?
            != 0x00
        {
            return Err(XzError::CorruptedInput(
                "non-zero byte in block padding".to_string(),
            ));
        }
        padded += 1;
    }

    let mut stored_digest = vec![0u8; check_type.size()];
    src.read_exact(&mut stored_digest)
        .map_err(|e| XzError::from(e).truncated("block check"))?;
    if verify_check && check.finish() != stored_digest {
        return Err(XzError::IntegrityMismatch {
            check: check_type.name(),
        });
    }

    Ok(DecodedBlock {
        unpadded_size: header_size as u64 + compressed + check_size,
        uncompressed_size: data.len() as u64,
        data,
    })
}

fn index_mismatch() -> XzError {
    XzError::CorruptedInput("index does not match the block header".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DeltaOptions, Lzma2Options};

    fn lzma2_chain() -> Vec<Filter> {
        vec![Filter::Lzma2(Lzma2Options::default())]
    }

    fn expect_block_start(src: &mut &[u8]) -> u8 {
        match read_block_start(src).unwrap() {
            BlockStart::Block(b) => b,
            BlockStart::IndexIndicator => panic!("expected a block"),
        }
    }

    #[test]
    fn header_round_trip_with_declared_sizes() {
        let header = BlockHeader {
            filters: vec![
                Filter::Delta(DeltaOptions::new(4).unwrap()),
                Filter::Lzma2(Lzma2Options::default()),
            ],
            compressed_size: Some(1234),
            uncompressed_size: Some(99999),
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len() % 4, 0);

        let mut src = &bytes[1..];
        let (decoded, size) = BlockHeader::decode(bytes[0], &mut src).unwrap();
        assert_eq!(size, bytes.len());
        assert_eq!(decoded, header);
    }

    #[test]
    fn block_round_trip() {
        let data = b"some block payload that goes through the whole codec";
        let mut container = Vec::new();
        let record = write_block(&mut container, &lzma2_chain(), CheckType::Crc64, data).unwrap();
        assert_eq!(record.uncompressed_size, data.len() as u64);

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let block = read_block(&mut src, size_byte, CheckType::Crc64, true, None, None).unwrap();
        assert_eq!(block.data, data);
        assert_eq!(block.unpadded_size, record.unpadded_size);
        assert!(src.is_empty(), "block decode must consume the whole block");
    }

    #[test]
    fn block_round_trip_against_index_record() {
        let data = vec![7u8; 10_000];
        let mut container = Vec::new();
        let record = write_block(&mut container, &lzma2_chain(), CheckType::Sha256, &data).unwrap();

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let block =
            read_block(&mut src, size_byte, CheckType::Sha256, true, None, Some(record)).unwrap();
        assert_eq!(block.data, data);
    }

    #[test]
    fn wrong_index_record_is_corrupted_input() {
        let mut container = Vec::new();
        let mut record =
            write_block(&mut container, &lzma2_chain(), CheckType::Crc32, b"abcdef").unwrap();
        record.uncompressed_size += 1;

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let err = read_block(&mut src, size_byte, CheckType::Crc32, true, None, Some(record))
            .unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(_)));
    }

    #[test]
    fn undersized_index_record_does_not_over_read() {
        let data = vec![5u8; 1000];
        let mut container = Vec::new();
        let mut record =
            write_block(&mut container, &lzma2_chain(), CheckType::Crc32, &data).unwrap();
        // Claim four compressed bytes fewer than the block really has.
        record.unpadded_size -= 4;

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let err = read_block(&mut src, size_byte, CheckType::Crc32, true, None, Some(record))
            .unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(_)));
        // The withheld compressed bytes, the padding and the digest must
        // still be unconsumed: the decoder stopped at the claimed ceiling.
        assert!(src.len() >= 8);
    }

    #[test]
    fn header_corruption_is_detected() {
        let mut container = Vec::new();
        write_block(&mut container, &lzma2_chain(), CheckType::Crc32, b"payload").unwrap();
        container[2] ^= 0x01;

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let err = read_block(&mut src, size_byte, CheckType::Crc32, true, None, None).unwrap_err();
        assert!(matches!(err, XzError::CorruptedInput(_)));
    }

    #[test]
    fn memory_limit_is_checked_before_decoding() {
        let mut container = Vec::new();
        write_block(&mut container, &lzma2_chain(), CheckType::Crc32, b"payload").unwrap();

        let mut src = &container[..];
        let size_byte = expect_block_start(&mut src);
        let needed = filter::chain_decoder_memory_kib(&lzma2_chain());
        let err =
            read_block(&mut src, size_byte, CheckType::Crc32, true, Some(64), None).unwrap_err();
        match err {
            XzError::MemoryLimitExceeded {
                needed_kib,
                limit_kib,
            } => {
                assert_eq!(needed_kib, needed);
                assert_eq!(limit_kib, 64);
            }
            other => panic!("expected MemoryLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn index_indicator_is_a_distinguished_condition() {
        let buf = [0x00u8];
        assert!(matches!(
            read_block_start(&mut &buf[..]).unwrap(),
            BlockStart::IndexIndicator
        ));
    }
}
