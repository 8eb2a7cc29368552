//! Variable-length integers used in chunk headers.
//!
//! Values below 192 take a single byte. Larger values store their low six bits
//! in a lead byte (`192..=255`) followed by little-endian 7-bit groups with a
//! continuation bit. Lengths take at most 5 bytes, backlink deltas at most 10.

use smallvec::SmallVec;

/// Scratch buffer large enough for any encoded chunk header.
pub type VarintBuf = SmallVec<[u8; 16]>;

const SINGLE_BYTE_LIMIT: u64 = 192;

pub const MAX_U32_LEN: usize = 5;
pub const MAX_U64_LEN: usize = 10;

pub fn write_u32(out: &mut VarintBuf, value: u32) {
    write_u64(out, u64::from(value));
}

pub fn write_u64(out: &mut VarintBuf, value: u64) {
    let mut value = value;
    if value >= SINGLE_BYTE_LIMIT {
        out.push((SINGLE_BYTE_LIMIT + (value & 0x3F)) as u8);
        value >>= 6;
        while value >= 0x80 {
            out.push(((value & 0x7F) | 0x80) as u8);
            value >>= 7;
        }
    }
    out.push(value as u8);
}

/// Decodes a `u32` from the front of `bytes`, returning the value and the
/// number of bytes consumed. `None` means the input is truncated or the value
/// does not fit.
#[must_use]
pub fn read_u32(bytes: &[u8]) -> Option<(u32, usize)> {
    let (value, used) = read_bounded(bytes, 32)?;
    Some((u32::try_from(value).ok()?, used))
}

#[must_use]
pub fn read_u64(bytes: &[u8]) -> Option<(u64, usize)> {
    read_bounded(bytes, 64)
}

fn read_bounded(bytes: &[u8], bits: u32) -> Option<(u64, usize)> {
    let lead = u64::from(*bytes.first()?);
    if lead < SINGLE_BYTE_LIMIT {
        return Some((lead, 1));
    }
    let mut result = lead - SINGLE_BYTE_LIMIT;
    let mut shift = 6u32;
    for (index, byte) in bytes.iter().enumerate().skip(1) {
        if shift >= bits {
            return None;
        }
        let group = u64::from(byte & 0x7F);
        let shifted = group << shift;
        if shifted >> shift != group || (bits < 64 && shifted >> bits != 0) {
            return None;
        }
        result |= shifted;
        if byte & 0x80 == 0 {
            return Some((result, index + 1));
        }
        shift += 7;
    }
    None
}
