//! Serialises the per-partition incomplete-offset set into the broker's
//! commit metadata field and back.
//!
//! Every applicable encoding is run and the smallest output wins; the
//! result is base64-wrapped because the metadata field is a UTF-8 string.
//! The total across all partitions has to stay within the broker-side
//! metadata limit, which the commit planner enforces.

use std::collections::BTreeSet;

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, warn};

use crate::encodings::{OffsetEncoding, OffsetWindow};
use crate::errors::OffsetCodecError;

/// Broker-side maximum for the commit metadata field
/// (kafka.coordinator.group.OffsetConfig#DefaultMaxMetadataSize).
pub const MAX_METADATA_SIZE: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct OffsetMapCodec {
    /// Forces the use of a specific codec instead of choosing the most
    /// efficient one. Useful for testing.
    forced: Option<OffsetEncoding>,
}

impl OffsetMapCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forced_encoding(forced: Option<OffsetEncoding>) -> Self {
        Self { forced }
    }

    /// Build the metadata payload for a commit at `base`, covering the
    /// window up to `next_expected`.
    pub fn make_metadata_payload(
        &self,
        base: i64,
        next_expected: i64,
        incomplete: &BTreeSet<i64>,
    ) -> Result<String, OffsetCodecError> {
        let window = OffsetWindow::new(base, next_expected, incomplete);
        let bytes = self.encode_smallest(&window)?;
        Ok(general_purpose::STANDARD.encode(bytes))
    }

    fn encode_smallest(&self, window: &OffsetWindow<'_>) -> Result<Vec<u8>, OffsetCodecError> {
        let unsupported = || OffsetCodecError::EncodingNotSupported {
            range: window.range(),
            incomplete_count: window.incomplete.len(),
        };

        if let Some(forced) = self.forced {
            warn!("Forcing use of {:?}, for testing", forced);
            return forced.encode(window).ok_or_else(unsupported);
        }

        let mut smallest: Option<(OffsetEncoding, Vec<u8>)> = None;
        for encoding in OffsetEncoding::ALL {
            let Some(bytes) = encoding.encode(window) else {
                continue;
            };
            let improves = match &smallest {
                Some((_, best)) => bytes.len() < best.len(),
                None => true,
            };
            if improves {
                smallest = Some((encoding, bytes));
            }
        }

        match smallest {
            Some((encoding, bytes)) => {
                debug!(
                    encoding = ?encoding,
                    size = bytes.len(),
                    range = window.range(),
                    "Selected smallest offset encoding"
                );
                Ok(bytes)
            }
            None => Err(unsupported()),
        }
    }

    /// Decode a metadata payload read back from the broker on assignment.
    /// Returns the next expected offset and the restored incomplete set.
    ///
    /// Panics on an unknown magic byte: the payload decoded as valid
    /// base64 but does not match any known encoding, so our own committed
    /// state is corrupt.
    pub fn decode_metadata_payload(
        &self,
        base: i64,
        payload: &str,
    ) -> Result<(i64, BTreeSet<i64>), OffsetCodecError> {
        let bytes = general_purpose::STANDARD.decode(payload)?;
        if bytes.is_empty() {
            return Ok((base, BTreeSet::new()));
        }
        let magic = bytes[0];
        match OffsetEncoding::from_magic(magic) {
            Some(encoding) => encoding.decode(base, &bytes[1..]),
            None => panic!("unknown offset encoding magic byte {magic:#04x}: committed metadata is corrupt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encodings::{MAGIC_BITSET_U32, MAGIC_RUN_LENGTH_U16, MAGIC_RUN_LENGTH_U32};
    use base64::Engine;

    fn set(offsets: &[i64]) -> BTreeSet<i64> {
        offsets.iter().copied().collect()
    }

    fn round_trip(codec: &OffsetMapCodec, base: i64, next: i64, incomplete: &BTreeSet<i64>) {
        let payload = codec.make_metadata_payload(base, next, incomplete).unwrap();
        let (next_expected, decoded) = codec.decode_metadata_payload(base, &payload).unwrap();
        assert_eq!(next_expected, next);
        assert_eq!(&decoded, incomplete);
    }

    #[test]
    fn test_round_trip_via_base64() {
        let codec = OffsetMapCodec::new();
        round_trip(&codec, 0, 1, &set(&[0]));
        round_trip(&codec, 0, 100, &set(&[0, 7, 50, 99]));
        round_trip(&codec, 5000, 5100, &set(&[5001, 5002, 5003]));
    }

    #[test]
    fn test_empty_payload_decodes_to_empty_set() {
        let codec = OffsetMapCodec::new();
        let (next_expected, incomplete) = codec.decode_metadata_payload(42, "").unwrap();
        assert_eq!(next_expected, 42);
        assert!(incomplete.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_decoding_error() {
        let codec = OffsetMapCodec::new();
        let result = codec.decode_metadata_payload(0, "not!!valid@@base64");
        assert!(matches!(result, Err(OffsetCodecError::Base64(_))));
    }

    #[test]
    #[should_panic(expected = "unknown offset encoding magic byte")]
    fn test_unknown_magic_panics() {
        let codec = OffsetMapCodec::new();
        let payload = general_purpose::STANDARD.encode([0x7f, 0x00, 0x01]);
        let _ = codec.decode_metadata_payload(0, &payload);
    }

    #[test]
    fn test_dense_window_picks_bitset() {
        // Half the window incomplete: run lengths need an entry per gap,
        // the bitset stays at one bit per offset.
        let incomplete: BTreeSet<i64> = (0..64).filter(|offset| offset % 2 == 0).collect();
        let codec = OffsetMapCodec::new();
        let payload = codec.make_metadata_payload(0, 64, &incomplete).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_eq!(bytes[0], crate::encodings::MAGIC_BITSET_U16);
    }

    #[test]
    fn test_sparse_wide_window_picks_run_length() {
        // One incomplete offset at the end of a wide window: two or three
        // run lengths beat thousands of bitset bytes.
        let incomplete = set(&[19_999]);
        let codec = OffsetMapCodec::new();
        let payload = codec.make_metadata_payload(0, 20_000, &incomplete).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_eq!(bytes[0], MAGIC_RUN_LENGTH_U16);
    }

    #[test]
    fn test_bitset_short_boundary_window() {
        // range == 32768: the u16 bitset is inapplicable, so the pick must
        // come from the remaining codecs and still round-trip.
        let incomplete = set(&[32_767]);
        let codec = OffsetMapCodec::new();
        let payload = codec.make_metadata_payload(0, 32_768, &incomplete).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_ne!(bytes[0], crate::encodings::MAGIC_BITSET_U16);
        round_trip(&codec, 0, 32_768, &incomplete);
    }

    #[test]
    fn test_run_length_overflow_falls_back_to_u32() {
        // A complete run of ~200k exceeds u16 runs; RunLengthU32 wins over
        // the 25KB BitsetU32 alternative.
        let incomplete = set(&[199_999]);
        let codec = OffsetMapCodec::new();
        let payload = codec.make_metadata_payload(0, 200_000, &incomplete).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_eq!(bytes[0], MAGIC_RUN_LENGTH_U32);
        round_trip(&codec, 0, 200_000, &incomplete);
    }

    #[test]
    fn test_forced_codec_is_used() {
        let incomplete = set(&[1]);
        let codec = OffsetMapCodec::with_forced_encoding(Some(OffsetEncoding::BitsetU32));
        let payload = codec.make_metadata_payload(0, 4, &incomplete).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_eq!(bytes[0], MAGIC_BITSET_U32);
    }

    #[test]
    fn test_forced_codec_inapplicable_is_unsupported() {
        let incomplete = set(&[199_999]);
        let codec = OffsetMapCodec::with_forced_encoding(Some(OffsetEncoding::RunLengthU16));
        let result = codec.make_metadata_payload(0, 200_000, &incomplete);
        assert!(matches!(
            result,
            Err(OffsetCodecError::EncodingNotSupported { .. })
        ));
    }
}
