//! Branch/call/jump transform filters.
//!
//! These filters are declared for chain validation and header round-tripping:
//! identity, properties (an optional naturally aligned start offset), and
//! memory cost. The container treats them as opaque size-preserving
//! transforms; the per-instruction-set address rewriting itself lives in the
//! coder layer, outside this crate, so the wrappers here pass payload bytes
//! through unchanged.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read, Write};

use super::{
    FinishWrite, FILTER_ID_ARM, FILTER_ID_ARMTHUMB, FILTER_ID_IA64, FILTER_ID_POWERPC,
    FILTER_ID_SPARC, FILTER_ID_X86,
};
use crate::error::XzError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcjKind {
    X86,
    PowerPc,
    Ia64,
    Arm,
    ArmThumb,
    Sparc,
}

impl BcjKind {
    pub fn filter_id(self) -> u64 {
        match self {
            BcjKind::X86 => FILTER_ID_X86,
            BcjKind::PowerPc => FILTER_ID_POWERPC,
            BcjKind::Ia64 => FILTER_ID_IA64,
            BcjKind::Arm => FILTER_ID_ARM,
            BcjKind::ArmThumb => FILTER_ID_ARMTHUMB,
            BcjKind::Sparc => FILTER_ID_SPARC,
        }
    }

    fn from_filter_id(id: u64) -> Option<Self> {
        match id {
            FILTER_ID_X86 => Some(BcjKind::X86),
            FILTER_ID_POWERPC => Some(BcjKind::PowerPc),
            FILTER_ID_IA64 => Some(BcjKind::Ia64),
            FILTER_ID_ARM => Some(BcjKind::Arm),
            FILTER_ID_ARMTHUMB => Some(BcjKind::ArmThumb),
            FILTER_ID_SPARC => Some(BcjKind::Sparc),
            _ => None,
        }
    }

    /// Instruction alignment; the start offset must be a multiple of this.
    pub fn alignment(self) -> u32 {
        match self {
            BcjKind::X86 => 1,
            BcjKind::PowerPc => 4,
            BcjKind::Ia64 => 16,
            BcjKind::Arm => 4,
            BcjKind::ArmThumb => 2,
            BcjKind::Sparc => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BcjKind::X86 => "x86",
            BcjKind::PowerPc => "PowerPC",
            BcjKind::Ia64 => "IA-64",
            BcjKind::Arm => "ARM",
            BcjKind::ArmThumb => "ARM-Thumb",
            BcjKind::Sparc => "SPARC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcjOptions {
    pub kind: BcjKind,
    start_offset: u32,
}

impl BcjOptions {
    pub fn new(kind: BcjKind) -> Self {
        Self {
            kind,
            start_offset: 0,
        }
    }

    pub fn with_start_offset(kind: BcjKind, start_offset: u32) -> Result<Self, XzError> {
        if start_offset % kind.alignment() != 0 {
            return Err(XzError::UnsupportedFilterChain(format!(
                "start offset {start_offset} is not a multiple of {} for the {} filter",
                kind.alignment(),
                kind.name()
            )));
        }
        Ok(Self { kind, start_offset })
    }

    pub fn start_offset(&self) -> u32 {
        self.start_offset
    }

    pub(crate) fn parse(id: u64, props: &[u8]) -> Result<Self, XzError> {
        let kind = BcjKind::from_filter_id(id).ok_or_else(|| {
            XzError::UnsupportedFilterChain(format!("unknown filter ID 0x{id:02X}"))
        })?;
        match props.len() {
            0 => Ok(Self::new(kind)),
            4 => Self::with_start_offset(kind, LittleEndian::read_u32(props)),
            _ => Err(XzError::UnsupportedFilterChain(format!(
                "unsupported properties for the {} filter",
                kind.name()
            ))),
        }
    }

    pub(crate) fn encoded_properties(&self) -> Vec<u8> {
        if self.start_offset == 0 {
            Vec::new()
        } else {
            self.start_offset.to_le_bytes().to_vec()
        }
    }
}

pub(crate) struct BcjWriter<'a> {
    sink: Box<dyn FinishWrite + 'a>,
}

impl<'a> BcjWriter<'a> {
    pub(crate) fn new(sink: Box<dyn FinishWrite + 'a>, _opts: &BcjOptions) -> Self {
        Self { sink }
    }
}

impl Write for BcjWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.sink.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl FinishWrite for BcjWriter<'_> {
    fn finish(&mut self) -> io::Result<()> {
        self.sink.finish()
    }
}

pub(crate) struct BcjReader<'a> {
    src: Box<dyn Read + 'a>,
}

impl<'a> BcjReader<'a> {
    pub(crate) fn new(src: Box<dyn Read + 'a>, _opts: &BcjOptions) -> Self {
        Self { src }
    }
}

impl Read for BcjReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.src.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_round_trip_with_start_offset() {
        let opts = BcjOptions::with_start_offset(BcjKind::Arm, 0x1000).unwrap();
        let props = opts.encoded_properties();
        assert_eq!(props.len(), 4);
        assert_eq!(BcjOptions::parse(FILTER_ID_ARM, &props).unwrap(), opts);
    }

    #[test]
    fn misaligned_start_offset_is_rejected() {
        assert!(BcjOptions::with_start_offset(BcjKind::Ia64, 8).is_err());
        assert!(BcjOptions::with_start_offset(BcjKind::X86, 1).is_ok());
    }

    #[test]
    fn empty_props_mean_offset_zero() {
        let opts = BcjOptions::parse(FILTER_ID_SPARC, &[]).unwrap();
        assert_eq!(opts.start_offset(), 0);
        assert!(opts.encoded_properties().is_empty());
    }

    #[test]
    fn bad_props_length_is_rejected() {
        assert!(BcjOptions::parse(FILTER_ID_X86, &[1, 2]).is_err());
    }
}
