//! Error taxonomy for the mask codec.
//!
//! Only codec and consistency failures live here. Degenerate input (short
//! polygons, zero-sized images, out-of-range pixel queries) is answered with
//! empty results instead.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MaskError>;

#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("instance id space exhausted: no free id in 1..=65535")]
    InstanceIdExhausted,

    #[error("class id {0} does not fit the 8-bit class channel")]
    ClassIdOutOfRange(u32),

    #[error("malformed run list in {channel} channel: {reason}")]
    MalformedRuns {
        channel: &'static str,
        reason: String,
    },

    #[error("{channel} channel expands to {actual} pixels, expected {expected}")]
    ChannelLengthMismatch {
        channel: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("malformed mask blob: {0}")]
    MalformedBlob(String),

    #[error("unsupported codec version {0}")]
    UnsupportedCodecVersion(u32),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
