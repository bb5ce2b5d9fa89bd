//! Random-access XZ decoder.
//!
//! Works on any `Read + Seek` source. Construction walks the file backwards:
//! strip Stream Padding, parse the Footer, follow its backward-size to the
//! Index, verify the Header it points past, repeat until the start of the
//! file. After that every Block's compressed offset and uncompressed range
//! is known without having decoded anything, so `Seek` is just arithmetic
//! and `Read` decodes at most the one Block containing the target position.
//!
//! Seeking is lazy: nothing touches the source until the next `read`.
//! Seeking past the end is allowed and reads return 0 there.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use crate::block::{read_block, read_block_start, BlockStart};
use crate::check::CheckType;
use crate::error::XzError;
use crate::index::{read_index, Record};
use crate::stream::{
    decode_stream_footer, decode_stream_header, StreamFlags, HEADER_MAGIC, STREAM_HEADER_SIZE,
};
use crate::vli::VLI_MAX;

/// Everything the Index says about one Block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Global Block number, counted across Streams from zero.
    pub number: u64,
    /// Offset of the Block Header in the compressed file.
    pub compressed_offset: u64,
    /// Offset of the Block's first byte in the uncompressed output.
    pub uncompressed_offset: u64,
    pub unpadded_size: u64,
    pub uncompressed_size: u64,
    pub check: CheckType,
}

/// One Stream's Index with prefix sums for offset lookups.
struct StreamIndex {
    header_offset: u64,
    flags: StreamFlags,
    records: Vec<Record>,
    /// Compressed offset of Block i relative to the first Block.
    compressed_rel: Vec<u64>,
    /// Uncompressed offset of Block i within the Stream.
    uncompressed_rel: Vec<u64>,
    total_uncompressed: u64,
    /// Global uncompressed offset of this Stream's first byte.
    uncompressed_base: u64,
    /// Global number of this Stream's first Block.
    block_base: u64,
}

impl StreamIndex {
    fn from_records(header_offset: u64, flags: StreamFlags, records: Vec<Record>) -> Result<Self, XzError> {
        let mut compressed_rel = Vec::with_capacity(records.len());
        let mut uncompressed_rel = Vec::with_capacity(records.len());
        let mut compressed_sum = 0u64;
        let mut uncompressed_sum = 0u64;
        for record in &records {
            compressed_rel.push(compressed_sum);
            uncompressed_rel.push(uncompressed_sum);
            compressed_sum = compressed_sum
                .checked_add(record.padded_size())
                .filter(|&s| s <= VLI_MAX)
                .ok_or_else(index_overflow)?;
            uncompressed_sum = uncompressed_sum
                .checked_add(record.uncompressed_size)
                .filter(|&s| s <= VLI_MAX)
                .ok_or_else(index_overflow)?;
        }
        Ok(Self {
            header_offset,
            flags,
            records,
            compressed_rel,
            uncompressed_rel,
            total_uncompressed: uncompressed_sum,
            uncompressed_base: 0,
            block_base: 0,
        })
    }

    /// Block index containing the stream-relative uncompressed position.
    fn locate(&self, pos: u64) -> usize {
        debug_assert!(pos < self.total_uncompressed);
        self.uncompressed_rel.partition_point(|&off| off <= pos) - 1
    }

    fn block_info(&self, i: usize) -> BlockInfo {
        let record = self.records[i];
        BlockInfo {
            number: self.block_base + i as u64,
            compressed_offset: self.header_offset + STREAM_HEADER_SIZE + self.compressed_rel[i],
            uncompressed_offset: self.uncompressed_base + self.uncompressed_rel[i],
            unpadded_size: record.unpadded_size,
            uncompressed_size: record.uncompressed_size,
            check: self.flags.check,
        }
    }
}

fn index_overflow() -> XzError {
    XzError::CorruptedInput("XZ index sizes overflow".to_string())
}

/// The decoded Block currently held in memory.
struct CurrentBlock {
    data: Vec<u8>,
    /// Global uncompressed offset of `data[0]`.
    start: u64,
}

pub struct SeekableXzReader<R: Read + Seek> {
    src: R,
    streams: Vec<StreamIndex>,
    verify_check: bool,
    /// Memory budget left for Block decoding after the Indexes took theirs.
    block_memory_limit_kib: Option<u64>,
    index_memory_kib: u64,
    total_uncompressed: u64,
    block_count: u64,
    largest_block_size: u64,
    position: u64,
    cur: Option<CurrentBlock>,
    pending: Option<XzError>,
    error: Option<XzError>,
}

impl<R: Read + Seek> fmt::Debug for SeekableXzReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeekableXzReader")
            .field("streams", &self.streams.len())
            .field("blocks", &self.block_count)
            .field("uncompressed_size", &self.total_uncompressed)
            .field("position", &self.position)
            .finish()
    }
}

impl<R: Read + Seek> SeekableXzReader<R> {
    pub fn new(src: R) -> Result<Self, XzError> {
        Self::with_options(src, None, true)
    }

    pub fn with_options(
        mut src: R,
        memory_limit_kib: Option<u64>,
        verify_check: bool,
    ) -> Result<Self, XzError> {
        let len = src.seek(SeekFrom::End(0))?;

        let mut magic = [0u8; 6];
        src.seek(SeekFrom::Start(0))?;
        src.read_exact(&mut magic)
            .map_err(|_| not_xz())?;
        if magic != HEADER_MAGIC {
            return Err(not_xz());
        }
        if len % 4 != 0 {
            return Err(XzError::CorruptedInput(
                "XZ file size is not a multiple of 4 bytes".to_string(),
            ));
        }

        // Walk the Streams back to front.
        let mut streams_rev: Vec<StreamIndex> = Vec::new();
        let mut index_memory_kib = 0u64;
        let mut pos = len;
        while pos > 0 {
            if pos < 2 * STREAM_HEADER_SIZE {
                return Err(truncated_stream());
            }
            let mut buf = [0u8; 12];
            src.seek(SeekFrom::Start(pos - 12))?;
            src.read_exact(&mut buf)?;

            // Stream Padding comes in 4-byte zero groups; the Footer magic
            // is never zero.
            if buf[8..12] == [0, 0, 0, 0] {
                pos -= 4;
                continue;
            }

            let (footer_flags, index_len) = decode_stream_footer(&buf)?;
            if index_len + 2 * STREAM_HEADER_SIZE > pos {
                return Err(XzError::CorruptedInput(
                    "backward size in the stream footer overlaps the stream header".to_string(),
                ));
            }

            src.seek(SeekFrom::Start(pos - 12 - index_len))?;
            let mut indicator = [0u8; 1];
            src.read_exact(&mut indicator)?;
            if indicator[0] != 0x00 {
                return Err(XzError::CorruptedInput(
                    "stream footer does not point at an index".to_string(),
                ));
            }
            let remaining = memory_limit_kib.map(|l| l.saturating_sub(index_memory_kib));
            let parsed = read_index(&mut src, remaining, Some(index_len))?;
            index_memory_kib += parsed.memory_kib;

            let blocks_len: u64 = parsed.records.iter().map(Record::padded_size).sum();
            let stream_size = 2 * STREAM_HEADER_SIZE + blocks_len + index_len;
            if stream_size > pos {
                return Err(truncated_stream());
            }
            let header_offset = pos - stream_size;

            src.seek(SeekFrom::Start(header_offset))?;
            src.read_exact(&mut buf)?;
            let header_flags = decode_stream_header(&buf)?;
            if header_flags != footer_flags {
                return Err(XzError::CorruptedInput(
                    "XZ stream footer does not match the stream header".to_string(),
                ));
            }

            streams_rev.push(StreamIndex::from_records(
                header_offset,
                header_flags,
                parsed.records,
            )?);
            pos = header_offset;
        }

        // Front-to-back pass to assign global bases and aggregates.
        let mut streams = streams_rev;
        streams.reverse();
        let mut total_uncompressed = 0u64;
        let mut block_count = 0u64;
        let mut largest_block_size = 0u64;
        for stream in &mut streams {
            stream.uncompressed_base = total_uncompressed;
            stream.block_base = block_count;
            total_uncompressed = total_uncompressed
                .checked_add(stream.total_uncompressed)
                .filter(|&s| s <= VLI_MAX)
                .ok_or_else(index_overflow)?;
            block_count += stream.records.len() as u64;
            largest_block_size = largest_block_size.max(
                stream
                    .records
                    .iter()
                    .map(|r| r.uncompressed_size)
                    .max()
                    .unwrap_or(0),
            );
        }

        log::debug!(
            "opened seekable XZ file: {} streams, {} blocks, {} uncompressed bytes",
            streams.len(),
            block_count,
            total_uncompressed
        );

        Ok(Self {
            src,
            streams,
            verify_check,
            block_memory_limit_kib: memory_limit_kib.map(|l| l.saturating_sub(index_memory_kib)),
            index_memory_kib,
            total_uncompressed,
            block_count,
            largest_block_size,
            position: 0,
            cur: None,
            pending: None,
            error: None,
        })
    }

    pub fn into_inner(self) -> R {
        self.src
    }

    /// Total uncompressed size across all Streams.
    pub fn uncompressed_size(&self) -> u64 {
        self.total_uncompressed
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Largest uncompressed Block size, an upper bound on the memory one
    /// random read may need.
    pub fn largest_block_size(&self) -> u64 {
        self.largest_block_size
    }

    /// Memory held by the parsed Indexes, in KiB.
    pub fn index_memory_kib(&self) -> u64 {
        self.index_memory_kib
    }

    /// Current logical position in the uncompressed output.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn block_info(&self, number: u64) -> Option<BlockInfo> {
        let stream = self.stream_for_block(number)?;
        Some(stream.block_info((number - stream.block_base) as usize))
    }

    /// Number of the Block containing the uncompressed position, if any.
    pub fn block_number_at(&self, pos: u64) -> Option<u64> {
        if pos >= self.total_uncompressed {
            return None;
        }
        let stream = self.stream_for_pos(pos);
        Some(stream.block_base + stream.locate(pos - stream.uncompressed_base) as u64)
    }

    /// Position the reader at the first byte of the given Block.
    pub fn seek_to_block(&mut self, number: u64) -> io::Result<()> {
        match self.block_info(number) {
            Some(info) => {
                self.position = info.uncompressed_offset;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {number} does not exist"),
            )),
        }
    }

    fn stream_for_block(&self, number: u64) -> Option<&StreamIndex> {
        if number >= self.block_count {
            return None;
        }
        let i = self.streams.partition_point(|s| s.block_base <= number) - 1;
        Some(&self.streams[i])
    }

    fn stream_for_pos(&self, pos: u64) -> &StreamIndex {
        debug_assert!(pos < self.total_uncompressed);
        let i = self
            .streams
            .partition_point(|s| s.uncompressed_base <= pos)
            - 1;
        &self.streams[i]
    }

    /// Decode the Block containing `self.position` into the cache.
    fn load_block(&mut self) -> Result<(), XzError> {
        let (info, check) = {
            let stream = self.stream_for_pos(self.position);
            let i = stream.locate(self.position - stream.uncompressed_base);
            (stream.block_info(i), stream.flags.check)
        };
        self.src.seek(SeekFrom::Start(info.compressed_offset))?;
        let size_byte = match read_block_start(&mut self.src)? {
            BlockStart::Block(b) => b,
            BlockStart::IndexIndicator => {
                return Err(XzError::CorruptedInput(
                    "index points at something that is not a block".to_string(),
                ));
            }
        };
        let block = read_block(
            &mut self.src,
            size_byte,
            check,
            self.verify_check,
            self.block_memory_limit_kib,
            Some(Record {
                unpadded_size: info.unpadded_size,
                uncompressed_size: info.uncompressed_size,
            }),
        )?;
        self.cur = Some(CurrentBlock {
            data: block.data,
            start: info.uncompressed_offset,
        });
        Ok(())
    }

    fn fail(&mut self, err: XzError, copied: usize) -> io::Result<usize> {
        if copied > 0 {
            self.pending = Some(err);
            Ok(copied)
        } else {
            self.error = Some(err.clone());
            Err(err.into())
        }
    }
}

impl<R: Read + Seek> Read for SeekableXzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.error {
            return Err(err.clone().into());
        }
        if let Some(err) = self.pending.take() {
            self.error = Some(err.clone());
            return Err(err.into());
        }
        let mut copied = 0;
        while copied < buf.len() && self.position < self.total_uncompressed {
            let cached = self.cur.as_ref().is_some_and(|cur| {
                self.position >= cur.start && self.position < cur.start + cur.data.len() as u64
            });
            if !cached {
                if let Err(err) = self.load_block() {
                    return self.fail(err, copied);
                }
            }
            let cur = match &self.cur {
                Some(cur) => cur,
                None => break,
            };
            let offset = (self.position - cur.start) as usize;
            let available = &cur.data[offset..];
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            self.position += n as u64;
            copied += n;
        }
        Ok(copied)
    }
}

impl<R: Read + Seek> Seek for SeekableXzReader<R> {
    /// Lazy: only updates the logical position. Seeking past the end is
    /// allowed; reads there return 0.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.position) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.total_uncompressed) + i128::from(d),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek before the beginning",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

fn not_xz() -> XzError {
    XzError::CorruptedInput("input is not in the XZ format".to_string())
}

fn truncated_stream() -> XzError {
    XzError::CorruptedInput("XZ stream is truncated or overlaps another".to_string())
}
