// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error types.
//!
//! Cancellation, precondition failures, decode failures and device failures are distinct
//! variants of [UploadError] so callers can branch on them.

use crate::cancellation::Cancelled;
use crate::gate::AcquireError;

/// Why an upload or load did not complete.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The call's token, or the loader's shutdown token, fired.
    #[error("upload cancelled")]
    Cancelled,
    /// The request was rejected before any GPU resource was touched.
    #[error("precondition violated: {0}")]
    Precondition(#[from] PreconditionViolation),
    #[error("decode failed: {0}")]
    Decode(DecodeError),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// The loader was disposed.
    #[error("loader disposed")]
    Disposed,
}

impl From<Cancelled> for UploadError {
    fn from(_: Cancelled) -> Self {
        UploadError::Cancelled
    }
}

impl From<AcquireError> for UploadError {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Cancelled => UploadError::Cancelled,
            AcquireError::Closed => UploadError::Disposed,
            //we never try_acquire on the upload path, but a held gate is a disposal race at worst
            AcquireError::Held => UploadError::Disposed,
        }
    }
}

impl From<DecodeError> for UploadError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Cancelled => UploadError::Cancelled,
            other => UploadError::Decode(other),
        }
    }
}

/// A request that can never succeed as written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionViolation {
    #[error("region is empty")]
    EmptyRegion,
    #[error(
        "region {x_offset},{y_offset} {width}x{height} exceeds mip level of {level_width}x{level_height}"
    )]
    RegionOutOfBounds {
        x_offset: u32,
        y_offset: u32,
        width: u32,
        height: u32,
        level_width: u32,
        level_height: u32,
    },
    #[error("mip level {mip_level} out of range for texture with {mip_count} levels")]
    MipOutOfRange { mip_level: u32, mip_count: u32 },
    #[error("texture does not support random-access writes")]
    NotRandomWrite,
    #[error("expected {expected} bytes of pixel data, got {actual}")]
    DataLength { expected: usize, actual: usize },
    #[error("{pixels} pixels is too large for a staging buffer")]
    TooLarge { pixels: u64 },
}

/// Failure decoding compressed image bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("unsupported image: {0}")]
    Unsupported(String),
    #[error("invalid dimensions {width}x{height} for {len} bytes")]
    InvalidDimensions { width: u32, height: u32, len: usize },
    #[error("decode cancelled")]
    Cancelled,
}

impl From<Cancelled> for DecodeError {
    fn from(_: Cancelled) -> Self {
        DecodeError::Cancelled
    }
}

/// Failure reported by a [crate::device::GraphicsDevice].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("write of {len} bytes at {offset} exceeds buffer of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("offset {offset} or length {len} is not a multiple of {alignment}")]
    Misaligned {
        offset: usize,
        len: usize,
        alignment: usize,
    },
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_cancellation_is_cancellation() {
        let e: UploadError = DecodeError::Cancelled.into();
        assert!(matches!(e, UploadError::Cancelled));
        let e: UploadError = DecodeError::Malformed("bad".to_string()).into();
        assert!(matches!(e, UploadError::Decode(DecodeError::Malformed(_))));
    }

    #[test]
    fn closed_gate_is_disposal() {
        let e: UploadError = AcquireError::Closed.into();
        assert!(matches!(e, UploadError::Disposed));
        let e: UploadError = AcquireError::Cancelled.into();
        assert!(matches!(e, UploadError::Cancelled));
    }
}
