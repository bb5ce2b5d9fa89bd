//! Integrity checks computed over each Block's uncompressed bytes.
//!
//! The digest is stored after the Block's padded payload; its size depends
//! only on the check type, so a decoder can skip it even when it does not
//! verify it.

use crc::Crc;
use sha2::{Digest, Sha256};

use crate::error::XzError;

static CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    None,
    Crc32,
    Crc64,
    Sha256,
}

impl CheckType {
    /// Parse the check-type ID from the stream flags (low 4 bits).
    pub fn from_id(id: u8) -> Result<Self, XzError> {
        match id {
            0x00 => Ok(CheckType::None),
            0x01 => Ok(CheckType::Crc32),
            0x04 => Ok(CheckType::Crc64),
            0x0A => Ok(CheckType::Sha256),
            _ => Err(XzError::CorruptedInput(format!(
                "undefined integrity check ID 0x{id:02X} in stream flags"
            ))),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            CheckType::None => 0x00,
            CheckType::Crc32 => 0x01,
            CheckType::Crc64 => 0x04,
            CheckType::Sha256 => 0x0A,
        }
    }

    /// Digest size in bytes.
    pub fn size(self) -> usize {
        match self {
            CheckType::None => 0,
            CheckType::Crc32 => 4,
            CheckType::Crc64 => 8,
            CheckType::Sha256 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CheckType::None => "none",
            CheckType::Crc32 => "CRC32",
            CheckType::Crc64 => "CRC64",
            CheckType::Sha256 => "SHA-256",
        }
    }
}

/// Running digest accumulator for one Block.
pub enum Check {
    None,
    Crc32(crc32fast::Hasher),
    Crc64(crc::Digest<'static, u64>),
    Sha256(Sha256),
}

impl Check {
    pub fn new(kind: CheckType) -> Self {
        match kind {
            CheckType::None => Check::None,
            CheckType::Crc32 => Check::Crc32(crc32fast::Hasher::new()),
            CheckType::Crc64 => Check::Crc64(CRC64.digest()),
            CheckType::Sha256 => Check::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Check::None => {}
            Check::Crc32(h) => h.update(data),
            Check::Crc64(d) => d.update(data),
            Check::Sha256(h) => h.update(data),
        }
    }

    /// Consume the accumulator and produce the digest bytes as stored on
    /// disk (CRC values little-endian, SHA-256 raw).
    pub fn finish(self) -> Vec<u8> {
        match self {
            Check::None => Vec::new(),
            Check::Crc32(h) => h.finalize().to_le_bytes().to_vec(),
            Check::Crc64(d) => d.finalize().to_le_bytes().to_vec(),
            Check::Sha256(h) => h.finalize().to_vec(),
        }
    }
}
