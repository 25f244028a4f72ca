//! Offset-map encodings.
//!
//! A window `[base, next_expected)` of offsets with a subset marked
//! incomplete can be written two ways: as a bitset (one bit per offset in
//! the window) or as run lengths (alternating counts of complete then
//! incomplete offsets, starting from the base). Each comes in a short
//! (u16) and long (u32) variant, identified by a leading magic byte. All
//! integers are big-endian.
//!
//! Wire layout:
//!
//! ```text
//! byte 0      magic
//! bytes 1..   BitsetU16:    u16 range, then ceil(range/8) bytes, MSB-first
//!             BitsetU32:    u32 range, then ceil(range/8) bytes, MSB-first
//!             RunLengthU16: u16 run lengths until the payload is exhausted
//!             RunLengthU32: u32 run lengths until the payload is exhausted
//! ```

use std::collections::BTreeSet;

use crate::errors::OffsetCodecError;

pub const MAGIC_BITSET_U16: u8 = b'B';
pub const MAGIC_BITSET_U32: u8 = b'b';
pub const MAGIC_RUN_LENGTH_U16: u8 = b'R';
pub const MAGIC_RUN_LENGTH_U32: u8 = b'r';

/// Widest window the u16 bitset form may describe. Matches the signed
/// 16-bit limit of the original wire format, not `u16::MAX`.
pub const BITSET_U16_MAX_RANGE: u64 = i16::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetEncoding {
    BitsetU16,
    BitsetU32,
    RunLengthU16,
    RunLengthU32,
}

impl OffsetEncoding {
    /// Selection order; ties on encoded size go to the earlier entry.
    pub const ALL: [OffsetEncoding; 4] = [
        OffsetEncoding::BitsetU16,
        OffsetEncoding::BitsetU32,
        OffsetEncoding::RunLengthU16,
        OffsetEncoding::RunLengthU32,
    ];

    pub fn magic(self) -> u8 {
        match self {
            OffsetEncoding::BitsetU16 => MAGIC_BITSET_U16,
            OffsetEncoding::BitsetU32 => MAGIC_BITSET_U32,
            OffsetEncoding::RunLengthU16 => MAGIC_RUN_LENGTH_U16,
            OffsetEncoding::RunLengthU32 => MAGIC_RUN_LENGTH_U32,
        }
    }

    pub fn from_magic(magic: u8) -> Option<Self> {
        match magic {
            MAGIC_BITSET_U16 => Some(OffsetEncoding::BitsetU16),
            MAGIC_BITSET_U32 => Some(OffsetEncoding::BitsetU32),
            MAGIC_RUN_LENGTH_U16 => Some(OffsetEncoding::RunLengthU16),
            MAGIC_RUN_LENGTH_U32 => Some(OffsetEncoding::RunLengthU32),
            _ => None,
        }
    }

    /// Encode the window, magic byte included. Returns `None` when the
    /// window does not fit this encoding's integer width.
    pub fn encode(self, window: &OffsetWindow<'_>) -> Option<Vec<u8>> {
        match self {
            OffsetEncoding::BitsetU16 => {
                if window.range() > BITSET_U16_MAX_RANGE {
                    return None;
                }
                Some(encode_bitset(self, window, IntWidth::U16))
            }
            OffsetEncoding::BitsetU32 => {
                if window.range() > u32::MAX as u64 {
                    return None;
                }
                Some(encode_bitset(self, window, IntWidth::U32))
            }
            OffsetEncoding::RunLengthU16 => encode_run_length(self, window, IntWidth::U16),
            OffsetEncoding::RunLengthU32 => encode_run_length(self, window, IntWidth::U32),
        }
    }

    /// Decode a payload (magic byte already stripped) against `base`.
    /// Returns the next expected offset (`base + range`) and the
    /// reconstructed incomplete set.
    pub fn decode(
        self,
        base: i64,
        payload: &[u8],
    ) -> Result<(i64, BTreeSet<i64>), OffsetCodecError> {
        match self {
            OffsetEncoding::BitsetU16 => decode_bitset(self, base, payload, IntWidth::U16),
            OffsetEncoding::BitsetU32 => decode_bitset(self, base, payload, IntWidth::U32),
            OffsetEncoding::RunLengthU16 => decode_run_length(self, base, payload, IntWidth::U16),
            OffsetEncoding::RunLengthU32 => decode_run_length(self, base, payload, IntWidth::U32),
        }
    }
}

/// A window of offsets `[base, next_expected)` and the subset of it known
/// not to be complete.
pub struct OffsetWindow<'a> {
    pub base: i64,
    pub next_expected: i64,
    pub incomplete: &'a BTreeSet<i64>,
}

impl<'a> OffsetWindow<'a> {
    pub fn new(base: i64, next_expected: i64, incomplete: &'a BTreeSet<i64>) -> Self {
        Self {
            base,
            next_expected,
            incomplete,
        }
    }

    /// Window width. Offsets outside `[base, next_expected)` are not
    /// representable and are ignored by every encoding.
    pub fn range(&self) -> u64 {
        (self.next_expected - self.base).max(0) as u64
    }

    /// Alternating run lengths, complete first. A window whose first
    /// offset is incomplete starts with a zero-length complete run; an
    /// empty window produces no runs.
    pub(crate) fn runs(&self) -> Vec<u64> {
        let mut runs = Vec::new();
        if self.range() == 0 {
            return runs;
        }
        let mut cursor = self.base;
        let mut iter = self
            .incomplete
            .range(self.base..self.next_expected)
            .copied()
            .peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next == end + 1 {
                    end = next;
                    iter.next();
                } else {
                    break;
                }
            }
            runs.push((start - cursor) as u64);
            runs.push((end - start + 1) as u64);
            cursor = end + 1;
        }
        if cursor < self.next_expected {
            runs.push((self.next_expected - cursor) as u64);
        }
        runs
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum IntWidth {
    U16,
    U32,
}

impl IntWidth {
    fn bytes(self) -> usize {
        match self {
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
        }
    }

    fn max(self) -> u64 {
        match self {
            IntWidth::U16 => u16::MAX as u64,
            IntWidth::U32 => u32::MAX as u64,
        }
    }

    fn push(self, out: &mut Vec<u8>, value: u64) {
        match self {
            IntWidth::U16 => out.extend_from_slice(&(value as u16).to_be_bytes()),
            IntWidth::U32 => out.extend_from_slice(&(value as u32).to_be_bytes()),
        }
    }

    fn read(self, bytes: &[u8]) -> u64 {
        match self {
            IntWidth::U16 => u16::from_be_bytes([bytes[0], bytes[1]]) as u64,
            IntWidth::U32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        }
    }
}

fn encode_bitset(encoding: OffsetEncoding, window: &OffsetWindow<'_>, width: IntWidth) -> Vec<u8> {
    let range = window.range() as usize;
    let bitset_len = range.div_ceil(8);
    let mut out = Vec::with_capacity(1 + width.bytes() + bitset_len);
    out.push(encoding.magic());
    width.push(&mut out, range as u64);

    let mut bits = vec![0u8; bitset_len];
    for &offset in window.incomplete.range(window.base..window.next_expected) {
        let i = (offset - window.base) as usize;
        bits[i / 8] |= 0x80 >> (i % 8);
    }
    out.extend_from_slice(&bits);
    out
}

fn decode_bitset(
    encoding: OffsetEncoding,
    base: i64,
    payload: &[u8],
    width: IntWidth,
) -> Result<(i64, BTreeSet<i64>), OffsetCodecError> {
    let header = width.bytes();
    if payload.len() < header {
        return Err(OffsetCodecError::TruncatedPayload {
            encoding,
            expected: header,
            actual: payload.len(),
        });
    }
    let range = width.read(payload) as usize;
    let bitset_len = range.div_ceil(8);
    let bits = &payload[header..];
    if bits.len() < bitset_len {
        return Err(OffsetCodecError::TruncatedPayload {
            encoding,
            expected: header + bitset_len,
            actual: payload.len(),
        });
    }

    let mut incomplete = BTreeSet::new();
    for i in 0..range {
        if bits[i / 8] & (0x80 >> (i % 8)) != 0 {
            incomplete.insert(base + i as i64);
        }
    }
    Ok((base + range as i64, incomplete))
}

fn encode_run_length(
    encoding: OffsetEncoding,
    window: &OffsetWindow<'_>,
    width: IntWidth,
) -> Option<Vec<u8>> {
    let runs = window.runs();
    if runs.iter().any(|&run| run > width.max()) {
        return None;
    }
    let mut out = Vec::with_capacity(1 + runs.len() * width.bytes());
    out.push(encoding.magic());
    for run in runs {
        width.push(&mut out, run);
    }
    Some(out)
}

fn decode_run_length(
    encoding: OffsetEncoding,
    base: i64,
    payload: &[u8],
    width: IntWidth,
) -> Result<(i64, BTreeSet<i64>), OffsetCodecError> {
    let step = width.bytes();
    if payload.len() % step != 0 {
        return Err(OffsetCodecError::TruncatedPayload {
            encoding,
            expected: payload.len().next_multiple_of(step),
            actual: payload.len(),
        });
    }

    let mut incomplete = BTreeSet::new();
    let mut cursor = base;
    let mut incomplete_run = false;
    for chunk in payload.chunks_exact(step) {
        let run = width.read(chunk) as i64;
        if incomplete_run {
            for offset in cursor..cursor + run {
                incomplete.insert(offset);
            }
        }
        cursor += run;
        incomplete_run = !incomplete_run;
    }
    Ok((cursor, incomplete))
}
