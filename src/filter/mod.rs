//! Filter descriptors and chain composition rules.
//!
//! A Block's payload passes through an ordered chain of 1–4 filters. Every
//! filter is one variant of the closed [`Filter`] enum; new kinds are added
//! as new variants, never via open-ended registration. A filter declares
//! its on-disk identity (`filter_id`, `encoded_properties`), its memory
//! cost, and three capability flags that the chain validator enforces:
//!
//! - `changes_size` — output length differs from input length,
//! - `allowed_non_last` — may appear anywhere except the end of the chain,
//! - `allowed_last` — may terminate the chain.
//!
//! Only the size-changing compressor may terminate a chain (decompression
//! must recover the exact uncompressed length); the reversible transform
//! filters must precede it.

pub mod bcj;
pub mod delta;
pub mod lzma2;

use std::io::{self, Read, Write};

pub use bcj::{BcjKind, BcjOptions};
pub use delta::DeltaOptions;
pub use lzma2::Lzma2Options;

use crate::error::XzError;

pub const FILTER_ID_DELTA: u64 = 0x03;
pub const FILTER_ID_X86: u64 = 0x04;
pub const FILTER_ID_POWERPC: u64 = 0x05;
pub const FILTER_ID_IA64: u64 = 0x06;
pub const FILTER_ID_ARM: u64 = 0x07;
pub const FILTER_ID_ARMTHUMB: u64 = 0x08;
pub const FILTER_ID_SPARC: u64 = 0x09;
pub const FILTER_ID_LZMA2: u64 = 0x21;

/// A sink that needs an explicit end-of-payload signal. The compressor
/// filter uses it to emit its end marker; pass-through filters forward it.
pub trait FinishWrite: Write {
    fn finish(&mut self) -> io::Result<()>;
}

impl<T: FinishWrite + ?Sized> FinishWrite for Box<T> {
    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Lzma2(Lzma2Options),
    Delta(DeltaOptions),
    Bcj(BcjOptions),
}

impl Filter {
    /// Reconstruct a filter from the ID and properties stored in a Block
    /// Header. Unknown IDs and malformed properties fail with
    /// `UnsupportedFilterChain`.
    pub fn from_id_props(id: u64, props: &[u8]) -> Result<Filter, XzError> {
        match id {
            FILTER_ID_LZMA2 => Ok(Filter::Lzma2(Lzma2Options::parse_props(props)?)),
            FILTER_ID_DELTA => Ok(Filter::Delta(DeltaOptions::parse_props(props)?)),
            FILTER_ID_X86..=FILTER_ID_SPARC => {
                Ok(Filter::Bcj(BcjOptions::parse(id, props)?))
            }
            _ => Err(XzError::UnsupportedFilterChain(format!(
                "unknown filter ID 0x{id:02X}"
            ))),
        }
    }

    pub fn filter_id(&self) -> u64 {
        match self {
            Filter::Lzma2(_) => FILTER_ID_LZMA2,
            Filter::Delta(_) => FILTER_ID_DELTA,
            Filter::Bcj(opts) => opts.kind.filter_id(),
        }
    }

    pub fn encoded_properties(&self) -> Vec<u8> {
        match self {
            Filter::Lzma2(opts) => opts.encoded_properties(),
            Filter::Delta(opts) => opts.encoded_properties(),
            Filter::Bcj(opts) => opts.encoded_properties(),
        }
    }

    pub fn changes_size(&self) -> bool {
        matches!(self, Filter::Lzma2(_))
    }

    pub fn allowed_non_last(&self) -> bool {
        !matches!(self, Filter::Lzma2(_))
    }

    pub fn allowed_last(&self) -> bool {
        matches!(self, Filter::Lzma2(_))
    }

    /// Declared encoder memory cost in KiB.
    pub fn encoder_memory_kib(&self) -> u64 {
        match self {
            Filter::Lzma2(opts) => opts.encoder_memory_kib(),
            Filter::Delta(_) => 1,
            Filter::Bcj(_) => 4,
        }
    }

    /// Declared decoder memory cost in KiB.
    pub fn decoder_memory_kib(&self) -> u64 {
        match self {
            Filter::Lzma2(opts) => opts.decoder_memory_kib(),
            Filter::Delta(_) => 1,
            Filter::Bcj(_) => 4,
        }
    }

    /// Wrap `sink` so that bytes written come out filtered on the far side.
    pub fn wrap_encoder<'a>(&self, sink: Box<dyn FinishWrite + 'a>) -> Box<dyn FinishWrite + 'a> {
        match self {
            Filter::Lzma2(opts) => Box::new(lzma2::Lzma2Writer::new(sink, opts)),
            Filter::Delta(opts) => Box::new(delta::DeltaWriter::new(sink, opts)),
            Filter::Bcj(opts) => Box::new(bcj::BcjWriter::new(sink, opts)),
        }
    }

    /// Wrap `source` so that reads yield the unfiltered bytes.
    pub fn wrap_decoder<'a>(&self, source: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        match self {
            Filter::Lzma2(opts) => Box::new(lzma2::Lzma2Reader::new(source, opts)),
            Filter::Delta(opts) => Box::new(delta::DeltaReader::new(source, opts)),
            Filter::Bcj(opts) => Box::new(bcj::BcjReader::new(source, opts)),
        }
    }
}

// ── Chain validation ─────────────────────────────────────────────────────────

/// Enforce the composition rules over an ordered chain.
pub fn validate_chain(filters: &[Filter]) -> Result<(), XzError> {
    if filters.is_empty() || filters.len() > 4 {
        return Err(XzError::UnsupportedFilterChain(format!(
            "chain must contain 1-4 filters, got {}",
            filters.len()
        )));
    }

    for filter in &filters[..filters.len() - 1] {
        if !filter.allowed_non_last() {
            return Err(XzError::UnsupportedFilterChain(format!(
                "filter 0x{:02X} must be the last filter in the chain",
                filter.filter_id()
            )));
        }
    }

    let last = filters.last().unwrap();
    if !last.allowed_last() {
        return Err(XzError::UnsupportedFilterChain(format!(
            "filter 0x{:02X} cannot be the last filter in the chain",
            last.filter_id()
        )));
    }

    let size_changing = filters.iter().filter(|f| f.changes_size()).count();
    if size_changing > 3 {
        return Err(XzError::UnsupportedFilterChain(format!(
            "{size_changing} size-changing filters in the chain, at most 3 allowed"
        )));
    }

    Ok(())
}

/// Sum of the chain's declared decoder memory costs in KiB.
pub fn chain_decoder_memory_kib(filters: &[Filter]) -> u64 {
    filters.iter().map(Filter::decoder_memory_kib).sum()
}

/// Fail with `MemoryLimitExceeded` when `needed_kib` does not fit in the
/// optional limit. Called before the corresponding structure is built.
pub fn check_memory_limit(needed_kib: u64, limit_kib: Option<u64>) -> Result<(), XzError> {
    match limit_kib {
        Some(limit) if needed_kib > limit => Err(XzError::MemoryLimitExceeded {
            needed_kib,
            limit_kib: limit,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lzma2() -> Filter {
        Filter::Lzma2(Lzma2Options::default())
    }

    fn delta() -> Filter {
        Filter::Delta(DeltaOptions::new(1).unwrap())
    }

    #[test]
    fn compressor_alone_is_valid() {
        validate_chain(&[lzma2()]).unwrap();
    }

    #[test]
    fn transforms_before_compressor_are_valid() {
        validate_chain(&[delta(), delta(), delta(), lzma2()]).unwrap();
    }

    #[test]
    fn chain_ending_in_transform_is_rejected() {
        assert!(matches!(
            validate_chain(&[delta()]),
            Err(XzError::UnsupportedFilterChain(_))
        ));
        assert!(matches!(
            validate_chain(&[lzma2(), delta()]),
            Err(XzError::UnsupportedFilterChain(_))
        ));
    }

    #[test]
    fn compressor_in_non_last_position_is_rejected() {
        assert!(matches!(
            validate_chain(&[lzma2(), lzma2()]),
            Err(XzError::UnsupportedFilterChain(_))
        ));
    }

    #[test]
    fn empty_and_oversized_chains_are_rejected() {
        assert!(validate_chain(&[]).is_err());
        assert!(validate_chain(&[delta(), delta(), delta(), delta(), lzma2()]).is_err());
    }

    #[test]
    fn unknown_filter_id_is_rejected() {
        assert!(matches!(
            Filter::from_id_props(0x7F, &[]),
            Err(XzError::UnsupportedFilterChain(_))
        ));
    }

    #[test]
    fn filters_round_trip_through_id_and_props() {
        for filter in [lzma2(), delta(), Filter::Bcj(BcjOptions::new(BcjKind::X86))] {
            let rebuilt =
                Filter::from_id_props(filter.filter_id(), &filter.encoded_properties()).unwrap();
            assert_eq!(rebuilt, filter);
        }
    }
}
