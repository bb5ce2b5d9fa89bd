//! LZMA2 compressor filter.
//!
//! The entropy coder itself is an external collaborator (`lzma-rs`); this
//! module owns the container-side contract around it: the single dictionary
//! size property byte, the declared memory cost, and the LZMA2 chunk
//! framing. The decoder parses the framing byte-exactly so it never reads
//! past the end marker — the Block codec relies on that to account for the
//! compressed payload size when no size was declared in the header.
//!
//! The encoder emits uncompressed LZMA2 chunks (store mode). Any conforming
//! LZMA2 decoder accepts them, and the decode path below accepts compressed
//! chunks produced by other encoders.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::FinishWrite;
use crate::error::XzError;

pub const DICT_SIZE_MIN: u32 = 1 << 12;
pub const DICT_SIZE_DEFAULT: u32 = 1 << 23;

/// Largest payload of one uncompressed LZMA2 chunk.
const CHUNK_MAX: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lzma2Options {
    dict_size: u32,
}

impl Default for Lzma2Options {
    fn default() -> Self {
        Self {
            dict_size: DICT_SIZE_DEFAULT,
        }
    }
}

impl Lzma2Options {
    pub fn new(dict_size: u32) -> Result<Self, XzError> {
        if dict_size < DICT_SIZE_MIN {
            return Err(XzError::UnsupportedFilterChain(format!(
                "LZMA2 dictionary size {dict_size} is below the minimum of {DICT_SIZE_MIN}"
            )));
        }
        Ok(Self { dict_size })
    }

    pub fn dict_size(&self) -> u32 {
        self.dict_size
    }

    /// Dictionary size encoded by a property code 0–40.
    fn dict_size_of(code: u8) -> u64 {
        if code == 40 {
            u64::from(u32::MAX)
        } else {
            (2 | u64::from(code & 1)) << (code / 2 + 11)
        }
    }

    pub(crate) fn parse_props(props: &[u8]) -> Result<Self, XzError> {
        if props.len() != 1 || props[0] > 40 {
            return Err(XzError::UnsupportedFilterChain(
                "unsupported LZMA2 properties".to_string(),
            ));
        }
        Ok(Self {
            dict_size: Self::dict_size_of(props[0]) as u32,
        })
    }

    pub(crate) fn encoded_properties(&self) -> Vec<u8> {
        // Smallest code whose dictionary covers the requested size.
        let code = (0u8..=40)
            .find(|&c| Self::dict_size_of(c) >= u64::from(self.dict_size))
            .unwrap_or(40);
        vec![code]
    }

    pub(crate) fn encoder_memory_kib(&self) -> u64 {
        u64::from(self.dict_size / 1024) * 10 + 512
    }

    pub(crate) fn decoder_memory_kib(&self) -> u64 {
        u64::from(self.dict_size / 1024) + 104
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

pub(crate) struct Lzma2Writer<'a> {
    sink: Box<dyn FinishWrite + 'a>,
    buf: Vec<u8>,
    first_chunk: bool,
    finished: bool,
}

impl<'a> Lzma2Writer<'a> {
    pub(crate) fn new(sink: Box<dyn FinishWrite + 'a>, _opts: &Lzma2Options) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(CHUNK_MAX),
            first_chunk: true,
            finished: false,
        }
    }

    fn flush_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        // Control 0x01 resets the dictionary (mandatory for the first chunk),
        // 0x02 continues it.
        self.sink.write_u8(if self.first_chunk { 0x01 } else { 0x02 })?;
        self.first_chunk = false;
        self.sink.write_u16::<BigEndian>((self.buf.len() - 1) as u16)?;
        self.sink.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

impl Write for Lzma2Writer<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_MAX - self.buf.len();
        let taken = room.min(data.len());
        self.buf.extend_from_slice(&data[..taken]);
        if self.buf.len() == CHUNK_MAX {
            self.flush_chunk()?;
        }
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl FinishWrite for Lzma2Writer<'_> {
    fn finish(&mut self) -> io::Result<()> {
        if !self.finished {
            self.flush_chunk()?;
            // End-of-stream marker.
            self.sink.write_u8(0x00)?;
            self.finished = true;
        }
        self.sink.finish()
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

pub(crate) struct Lzma2Reader<'a> {
    src: Box<dyn Read + 'a>,
    out: Vec<u8>,
    pos: usize,
    decoded: bool,
}

impl<'a> Lzma2Reader<'a> {
    pub(crate) fn new(src: Box<dyn Read + 'a>, _opts: &Lzma2Options) -> Self {
        Self {
            src,
            out: Vec::new(),
            pos: 0,
            decoded: false,
        }
    }

    /// Copy the raw LZMA2 stream out of the source, consuming exactly the
    /// bytes that belong to it, then run the external decoder over it.
    fn decode_all(&mut self) -> io::Result<()> {
        let mut raw = Vec::new();
        loop {
            let control = self.src.read_u8()?;
            raw.push(control);
            match control {
                0x00 => break,
                0x01 | 0x02 => {
                    // Uncompressed chunk: 16-bit big-endian size minus one.
                    let mut head = [0u8; 2];
                    self.src.read_exact(&mut head)?;
                    raw.extend_from_slice(&head);
                    let size = u16::from_be_bytes(head) as usize + 1;
                    let start = raw.len();
                    raw.resize(start + size, 0);
                    self.src.read_exact(&mut raw[start..])?;
                }
                0x80..=0xFF => {
                    // LZMA chunk: 5 more header bytes (21-bit uncompressed
                    // size minus one split across control and two bytes,
                    // 16-bit compressed size minus one), optionally a
                    // properties byte, then the compressed data.
                    let mut head = [0u8; 4];
                    self.src.read_exact(&mut head)?;
                    raw.extend_from_slice(&head);
                    let packed = u16::from_be_bytes([head[2], head[3]]) as usize + 1;
                    if (control >> 5) & 0x03 >= 2 {
                        raw.push(self.src.read_u8()?);
                    }
                    let start = raw.len();
                    raw.resize(start + packed, 0);
                    self.src.read_exact(&mut raw[start..])?;
                }
                _ => {
                    return Err(XzError::CorruptedInput(format!(
                        "invalid LZMA2 chunk control byte 0x{control:02X}"
                    ))
                    .into());
                }
            }
        }

        let mut decoder = lzma_rs::decompress::raw::Lzma2Decoder::new();
        decoder
            .decompress(&mut Cursor::new(&raw), &mut self.out)
            .map_err(|e| {
                io::Error::from(XzError::CorruptedInput(format!(
                    "LZMA2 data is corrupt: {e:?}"
                )))
            })?;
        Ok(())
    }
}

impl Read for Lzma2Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.decoded {
            self.decode_all()?;
            self.decoded = true;
        }
        let available = &self.out[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
