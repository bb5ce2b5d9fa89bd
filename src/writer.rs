//! Streaming XZ encoder.
//!
//! Buffers plaintext per Block, compresses each Block through the configured
//! filter chain, and closes the Stream with the Index and Footer. Calling
//! [`XzWriter::finish`] returns the sink, so several Streams can be written
//! back to back into one file; any conforming decoder treats the result as
//! the concatenation of their contents.

use std::io::{self, Write};

use crate::check::CheckType;
use crate::block::write_block;
use crate::error::XzError;
use crate::filter::{self, Filter};
use crate::index::{write_index, Record};
use crate::stream::{write_stream_header, write_stream_footer, StreamFlags};

/// Streaming encoder for one Stream. Plaintext is buffered per Block and
/// compressed when the Block ends; without a split threshold the whole
/// payload lands in a single Block.
pub struct XzWriter<W: Write> {
    sink: W,
    filters: Vec<Filter>,
    flags: StreamFlags,
    block_buf: Vec<u8>,
    block_size: Option<usize>,
    records: Vec<Record>,
    error: Option<XzError>,
    finished: bool,
}

impl<W: Write> XzWriter<W> {
    /// Start a Stream: validates the filter chain and writes the Stream
    /// Header. All written data goes into a single Block unless
    /// [`end_block`](Self::end_block) is called.
    pub fn new(sink: W, filters: &[Filter], check: CheckType) -> Result<Self, XzError> {
        Self::build(sink, filters, check, None)
    }

    /// Like [`new`](Self::new), but automatically ends the current Block
    /// whenever it reaches `block_size` uncompressed bytes. Bounded Blocks
    /// are what make the output seekable with bounded memory.
    pub fn with_block_size(
        sink: W,
        filters: &[Filter],
        check: CheckType,
        block_size: usize,
    ) -> Result<Self, XzError> {
        if block_size == 0 {
            return Err(XzError::UnsupportedFilterChain(
                "block size must be at least one byte".to_string(),
            ));
        }
        Self::build(sink, filters, check, Some(block_size))
    }

    fn build(
        mut sink: W,
        filters: &[Filter],
        check: CheckType,
        block_size: Option<usize>,
    ) -> Result<Self, XzError> {
        filter::validate_chain(filters)?;
        let flags = StreamFlags { check };
        write_stream_header(&mut sink, flags)?;
        Ok(Self {
            sink,
            filters: filters.to_vec(),
            flags,
            block_buf: Vec::new(),
            block_size,
            records: Vec::new(),
            error: None,
            finished: false,
        })
    }

    fn check_usable(&self) -> Result<(), XzError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.finished {
            return Err(XzError::Io(
                io::ErrorKind::Other,
                "stream already finished".to_string(),
            ));
        }
        Ok(())
    }

    fn guard<T>(&mut self, result: Result<T, XzError>) -> Result<T, XzError> {
        if let Err(err) = &result {
            self.error = Some(err.clone());
        }
        result
    }

    /// Compress the buffered data as one Block. A no-op while the buffer is
    /// empty, so Streams never contain empty Blocks.
    pub fn end_block(&mut self) -> Result<(), XzError> {
        self.check_usable()?;
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let record = {
            let result = write_block(
                &mut self.sink,
                &self.filters,
                self.flags.check,
                &self.block_buf,
            );
            self.guard(result)?
        };
        log::debug!(
            "wrote XZ block: {} bytes in, {} bytes unpadded",
            record.uncompressed_size,
            record.unpadded_size
        );
        self.records.push(record);
        self.block_buf.clear();
        Ok(())
    }

    /// Close the Stream: last Block, Index, Footer. Returns the sink so the
    /// caller can append another Stream or keep writing unrelated data.
    pub fn finish(mut self) -> Result<W, XzError> {
        self.check_usable()?;
        self.end_block()?;
        let index_len = write_index(&mut self.sink, &self.records)?;
        write_stream_footer(&mut self.sink, self.flags, index_len)?;
        self.sink.flush()?;
        log::debug!(
            "finished XZ stream: {} blocks, {} uncompressed bytes",
            self.records.len(),
            self.records.iter().map(|r| r.uncompressed_size).sum::<u64>()
        );
        Ok(self.sink)
    }

    fn append(&mut self, data: &[u8]) -> Result<(), XzError> {
        self.check_usable()?;
        match self.block_size {
            None => self.block_buf.extend_from_slice(data),
            Some(limit) => {
                let mut rest = data;
                while !rest.is_empty() {
                    let room = limit - self.block_buf.len();
                    let taken = room.min(rest.len());
                    self.block_buf.extend_from_slice(&rest[..taken]);
                    rest = &rest[taken..];
                    if self.block_buf.len() == limit {
                        self.end_block()?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for XzWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Buffered plaintext stays buffered until its Block ends; only the
        // sink itself can be flushed here.
        self.sink.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Lzma2Options;

    fn lzma2() -> Vec<Filter> {
        vec![Filter::Lzma2(Lzma2Options::default())]
    }

    #[test]
    fn empty_stream_is_header_index_footer() {
        let writer = XzWriter::new(Vec::new(), &lzma2(), CheckType::Crc32).unwrap();
        let out = writer.finish().unwrap();
        // 12-byte header, 8-byte empty index, 12-byte footer.
        assert_eq!(out.len(), 32);
        assert_eq!(&out[..6], &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]);
        assert_eq!(&out[out.len() - 2..], b"YZ");
    }

    #[test]
    fn block_size_splits_automatically() {
        let mut writer =
            XzWriter::with_block_size(Vec::new(), &lzma2(), CheckType::None, 100).unwrap();
        writer.write_all(&[0x55u8; 425]).unwrap();
        assert_eq!(writer.records.len(), 4);
        writer.finish().unwrap();
    }

    #[test]
    fn end_block_on_empty_buffer_is_a_no_op() {
        let mut writer = XzWriter::new(Vec::new(), &lzma2(), CheckType::Crc64).unwrap();
        writer.end_block().unwrap();
        writer.end_block().unwrap();
        assert!(writer.records.is_empty());
        writer.write_all(b"x").unwrap();
        writer.end_block().unwrap();
        assert_eq!(writer.records.len(), 1);
    }

    #[test]
    fn invalid_chain_is_rejected_up_front() {
        let chain = vec![
            Filter::Lzma2(Lzma2Options::default()),
            Filter::Lzma2(Lzma2Options::default()),
        ];
        assert!(matches!(
            XzWriter::new(Vec::new(), &chain, CheckType::Crc32),
            Err(XzError::UnsupportedFilterChain(_))
        ));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(XzWriter::with_block_size(Vec::new(), &lzma2(), CheckType::Crc32, 0).is_err());
    }
}
