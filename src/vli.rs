//! Variable-length integers used throughout the container headers.
//!
//! A VLI stores an unsigned value in 1–9 bytes. Each byte carries 7 value
//! bits in little-endian group order; the high bit is set on every byte
//! except the last. Encodings must be minimal: a continuation byte of 0x00
//! would contribute nothing and is rejected.

use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::XzError;

/// Largest value a VLI may hold. The all-ones 63-bit value is reserved.
pub const VLI_MAX: u64 = (1u64 << 63) - 2;

/// Number of bytes `n` occupies when VLI-encoded.
pub fn vli_size(n: u64) -> u64 {
    debug_assert!(n <= VLI_MAX);
    let mut size = 1;
    let mut rest = n >> 7;
    while rest != 0 {
        size += 1;
        rest >>= 7;
    }
    size
}

pub fn write_vli<W: Write>(w: &mut W, n: u64) -> Result<(), XzError> {
    debug_assert!(n <= VLI_MAX);
    let mut rest = n;
    while rest >= 0x80 {
        w.write_u8((rest as u8 & 0x7F) | 0x80)?;
        rest >>= 7;
    }
    w.write_u8(rest as u8)?;
    Ok(())
}

pub fn read_vli<R: Read>(r: &mut R) -> Result<u64, XzError> {
    let byte = r.read_u8()?;
    let mut value = u64::from(byte & 0x7F);
    let mut shift = 0u32;

    let mut cont = byte & 0x80 != 0;
    while cont {
        shift += 7;
        // 9 bytes hold 63 value bits; a continuation bit on the 9th byte
        // cannot be satisfied.
        if shift == 63 {
            return Err(XzError::MalformedVli);
        }
        let byte = r.read_u8()?;
        // A most-significant group of zero means the encoding is non-minimal.
        if byte == 0x00 {
            return Err(XzError::MalformedVli);
        }
        value |= u64::from(byte & 0x7F) << shift;
        cont = byte & 0x80 != 0;
    }

    if value > VLI_MAX {
        return Err(XzError::MalformedVli);
    }
    Ok(value)
}
