//! Byte-delta transform filter.
//!
//! Size-preserving: each output byte is the difference (modulo 256) between
//! the input byte and the byte `distance` positions earlier, using a small
//! sliding window that starts zero-filled. The single property byte stores
//! `distance - 1`.

use std::io::{self, Read, Write};

use super::FinishWrite;
use crate::error::XzError;

pub const DISTANCE_MIN: u32 = 1;
pub const DISTANCE_MAX: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOptions {
    distance: u32,
}

impl DeltaOptions {
    pub fn new(distance: u32) -> Result<Self, XzError> {
        if !(DISTANCE_MIN..=DISTANCE_MAX).contains(&distance) {
            return Err(XzError::UnsupportedFilterChain(format!(
                "delta distance {distance} outside {DISTANCE_MIN}-{DISTANCE_MAX}"
            )));
        }
        Ok(Self { distance })
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }

    pub(crate) fn parse_props(props: &[u8]) -> Result<Self, XzError> {
        if props.len() != 1 {
            return Err(XzError::UnsupportedFilterChain(
                "unsupported delta properties".to_string(),
            ));
        }
        Ok(Self {
            distance: u32::from(props[0]) + 1,
        })
    }

    pub(crate) fn encoded_properties(&self) -> Vec<u8> {
        vec![(self.distance - 1) as u8]
    }
}

/// Ring buffer of the last `distance` plaintext bytes.
struct DeltaState {
    history: Vec<u8>,
    pos: usize,
}

impl DeltaState {
    fn new(opts: &DeltaOptions) -> Self {
        Self {
            history: vec![0u8; opts.distance as usize],
            pos: 0,
        }
    }

    fn encode(&mut self, byte: u8) -> u8 {
        let out = byte.wrapping_sub(self.history[self.pos]);
        self.history[self.pos] = byte;
        self.pos = (self.pos + 1) % self.history.len();
        out
    }

    fn decode(&mut self, byte: u8) -> u8 {
        let out = byte.wrapping_add(self.history[self.pos]);
        self.history[self.pos] = out;
        self.pos = (self.pos + 1) % self.history.len();
        out
    }
}

pub(crate) struct DeltaWriter<'a> {
    sink: Box<dyn FinishWrite + 'a>,
    state: DeltaState,
}

impl<'a> DeltaWriter<'a> {
    pub(crate) fn new(sink: Box<dyn FinishWrite + 'a>, opts: &DeltaOptions) -> Self {
        Self {
            sink,
            state: DeltaState::new(opts),
        }
    }
}

impl Write for DeltaWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut scratch = [0u8; 4096];
        for chunk in data.chunks(scratch.len()) {
            for (slot, &byte) in scratch.iter_mut().zip(chunk) {
                *slot = self.state.encode(byte);
            }
            self.sink.write_all(&scratch[..chunk.len()])?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl FinishWrite for DeltaWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.sink.finish()
    }
}

pub(crate) struct DeltaReader<'a> {
    src: Box<dyn Read + 'a>,
    state: DeltaState,
}

impl<'a> DeltaReader<'a> {
    pub(crate) fn new(src: Box<dyn Read + 'a>, opts: &DeltaOptions) -> Self {
        Self {
            src,
            state: DeltaState::new(opts),
        }
    }
}

impl Read for DeltaReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.src.read(buf)?;
        for byte in &mut buf[..n] {
            *byte = self.state.decode(*byte);
        }
        Ok(n)
    }
}
