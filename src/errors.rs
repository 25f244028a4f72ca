use thiserror::Error;

use crate::encodings::OffsetEncoding;

/// Errors from encoding or decoding the incomplete-offsets commit metadata.
#[derive(Error, Debug)]
pub enum OffsetCodecError {
    /// No encoding can represent the current window. The commit proceeds
    /// without metadata; recovery will replay messages beyond the bare
    /// committed offset.
    #[error("no offset encoding can represent the window (range {range}, {incomplete_count} incomplete offsets)")]
    EncodingNotSupported {
        range: u64,
        incomplete_count: usize,
    },

    /// Metadata read back from the broker was not valid base64.
    #[error("offset metadata is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Metadata payload ended before the encoding's declared contents.
    #[error("{encoding:?} payload truncated: expected {expected} bytes, got {actual}")]
    TruncatedPayload {
        encoding: OffsetEncoding,
        expected: usize,
        actual: usize,
    },
}
