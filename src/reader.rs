//! Streaming XZ decoder.
//!
//! Decodes one or more concatenated Streams front to back, verifying every
//! CRC-protected structure and each Block's integrity digest on the way.
//! After the last Block of a Stream the Index is parsed and compared against
//! the Blocks actually seen, then the Footer against the Header; only then
//! does the decoder move on to the next Stream or report end of input.
//!
//! Error delivery follows the usual stream contract: if a `read` call has
//! already produced bytes when a problem is found, those bytes are returned
//! and the error is raised by the next call. A failed decoder stays failed.

use std::io::{self, Read};

use crate::block::{read_block, read_block_start, BlockStart};
use crate::error::XzError;
use crate::index::{read_index, Record};
use crate::stream::{decode_stream_header, read_stream_footer, StreamFlags};

pub struct XzReader<R: Read> {
    src: R,
    verify_check: bool,
    memory_limit_kib: Option<u64>,
    state: State,
    block_data: Vec<u8>,
    block_pos: usize,
    /// Error found mid-call after bytes were already produced.
    pending: Option<XzError>,
    error: Option<XzError>,
}

enum State {
    /// Before a Stream Header; `first` distinguishes empty input from a
    /// clean end after at least one Stream.
    BetweenStreams { first: bool },
    InStream {
        flags: StreamFlags,
        seen: Vec<Record>,
    },
    Done,
}

impl<R: Read> XzReader<R> {
    pub fn new(src: R) -> Self {
        Self::with_options(src, None, true)
    }

    /// `memory_limit_kib` bounds the declared decoder memory of every filter
    /// chain and Index; `verify_check` disables digest verification (the
    /// digest bytes are still consumed).
    pub fn with_options(src: R, memory_limit_kib: Option<u64>, verify_check: bool) -> Self {
        Self {
            src,
            verify_check,
            memory_limit_kib,
            state: State::BetweenStreams { first: true },
            block_data: Vec::new(),
            block_pos: 0,
            pending: None,
            error: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.src
    }

    /// Skip Stream Padding and parse the next Stream Header. `None` means
    /// clean end of input at a Stream boundary.
    fn next_stream(&mut self, first: bool) -> Result<Option<StreamFlags>, XzError> {
        let mut buf = [0u8; 12];
        loop {
            let mut got = 0;
            while got < 4 {
                let n = self.src.read(&mut buf[got..4])?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if got == 0 {
                if first {
                    return Err(XzError::UnexpectedEof(
                        "the input is empty".to_string(),
                    ));
                }
                return Ok(None);
            }
            if got < 4 {
                return Err(XzError::UnexpectedEof(
                    "input ended inside stream padding".to_string(),
                ));
            }
            // Stream Padding comes in 4-byte zero groups.
            if buf[..4] == [0, 0, 0, 0] {
                continue;
            }
            self.src
                .read_exact(&mut buf[4..])
                .map_err(|_| XzError::UnexpectedEof(
                    "input ended inside a stream header".to_string(),
                ))?;
            let flags = decode_stream_header(&buf)?;
            log::debug!("XZ stream opened, check type {}", flags.check.name());
            return Ok(Some(flags));
        }
    }

    /// Parse the Index, compare it with the Blocks seen, then verify the
    /// Footer against the Header.
    fn finish_stream(&mut self, flags: StreamFlags, seen: &[Record]) -> Result<(), XzError> {
        let parsed = read_index(&mut self.src, self.memory_limit_kib, None)?;
        if parsed.records != seen {
            return Err(XzError::CorruptedInput(
                "XZ index does not match the decoded blocks".to_string(),
            ));
        }
        let (footer_flags, index_len) = read_stream_footer(&mut self.src)?;
        if footer_flags != flags || index_len != parsed.encoded_len {
            return Err(XzError::CorruptedInput(
                "XZ stream footer does not match the stream header".to_string(),
            ));
        }
        log::debug!("XZ stream closed, {} blocks", seen.len());
        Ok(())
    }

    /// Move the state machine until a fresh Block is buffered or the input
    /// is exhausted. Returns false at end of input.
    fn advance(&mut self) -> Result<bool, XzError> {
        loop {
            match &mut self.state {
                State::Done => return Ok(false),
                State::BetweenStreams { first } => {
                    let first = *first;
                    match self.next_stream(first)? {
                        Some(flags) => {
                            self.state = State::InStream {
                                flags,
                                seen: Vec::new(),
                            };
                        }
                        None => {
                            self.state = State::Done;
                            return Ok(false);
                        }
                    }
                }
                State::InStream { flags, seen } => {
                    let flags = *flags;
                    match read_block_start(&mut self.src)? {
                        BlockStart::Block(size_byte) => {
                            let block = read_block(
                                &mut self.src,
                                size_byte,
                                flags.check,
                                self.verify_check,
                                self.memory_limit_kib,
                                None,
                            )?;
                            if let State::InStream { seen, .. } = &mut self.state {
                                seen.push(Record {
                                    unpadded_size: block.unpadded_size,
                                    uncompressed_size: block.uncompressed_size,
                                });
                            }
                            self.block_data = block.data;
                            self.block_pos = 0;
                            if !self.block_data.is_empty() {
                                return Ok(true);
                            }
                        }
                        BlockStart::IndexIndicator => {
                            let seen = std::mem::take(seen);
                            self.finish_stream(flags, &seen)?;
                            self.state = State::BetweenStreams { first: false };
                        }
                    }
                }
            }
        }
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

impl<R: Read> Read for XzReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = &self.error {
            return Err(err.clone().into());
        }
        if let Some(err) = self.pending.take() {
            self.error = Some(err.clone());
            return Err(err.into());
        }
        let mut copied = 0;
        while copied < buf.len() {
            let available = &self.block_data[self.block_pos..];
            if !available.is_empty() {
                let n = available.len().min(buf.len() - copied);
                buf[copied..copied + n].copy_from_slice(&available[..n]);
                self.block_pos += n;
                copied += n;
                continue;
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => return self.fail(err, copied),
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckType;
    use crate::error::as_xz_error;
    use crate::filter::{Filter, Lzma2Options};
    use crate::writer::XzWriter;
    use std::io::Write;

    fn compress(data: &[u8], check: CheckType) -> Vec<u8> {
        let mut writer =
            XzWriter::new(Vec::new(), &[Filter::Lzma2(Lzma2Options::default())], check).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn empty_input_is_unexpected_eof() {
        let mut reader = XzReader::new(&[][..]);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            as_xz_error(&err),
            Some(XzError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn failed_reader_keeps_failing() {
        let mut compressed = compress(b"data", CheckType::Crc32);
        let len = compressed.len();
        compressed.truncate(len - 10);

        let mut reader = XzReader::new(&compressed[..]);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).is_err());
        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn garbage_after_padding_is_rejected() {
        let mut compressed = compress(b"data", CheckType::Crc32);
        compressed.extend_from_slice(&[0, 0, 0, 0]); // valid stream padding
        compressed.extend_from_slice(b"garbage here");

        let mut reader = XzReader::new(&compressed[..]);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            as_xz_error(&err),
            Some(XzError::CorruptedInput(_))
        ));
    }

    #[test]
    fn misaligned_stream_padding_is_rejected() {
        let mut compressed = compress(b"data", CheckType::Crc32);
        compressed.extend_from_slice(&[0, 0]); // not a multiple of four

        let mut reader = XzReader::new(&compressed[..]);
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            as_xz_error(&err),
            Some(XzError::UnexpectedEof(_))
        ));
    }
}
