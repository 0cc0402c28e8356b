// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Decoded images and the decoder seam.

pub mod png_support;

use crate::cancellation::CancellationToken;
use crate::error::DecodeError;
use std::fmt::{Debug, Formatter};
use std::io::Read;
use std::sync::Arc;

pub use png_support::PngDecoder;

/// An RGBA8 image.  Immutable once decoded.
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl DecodedImage {
    /// Wraps `pixels`, which must hold exactly `width * height * 4` bytes.
    pub fn new(width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> Result<Self, DecodeError> {
        let pixels = pixels.into();
        let expected = width as u64 * height as u64 * 4;
        if width == 0 || height == 0 || pixels.len() as u64 != expected {
            return Err(DecodeError::InvalidDimensions {
                width,
                height,
                len: pixels.len(),
            });
        }
        Ok(DecodedImage {
            width,
            height,
            pixels,
        })
    }

    /// A `width`x`height` image where every pixel is `rgba`.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, DecodeError> {
        let pixels: Vec<u8> = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self::new(width, height, pixels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tightly packed RGBA rows, top to bottom.
    pub fn pixels(&self) -> &Arc<[u8]> {
        &self.pixels
    }

    pub fn into_pixels(self) -> Arc<[u8]> {
        self.pixels
    }
}

impl Debug for DecodedImage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Turns compressed bytes into a [DecodedImage].
pub trait ImageDecoder: Send + Sync + 'static {
    /// Decodes one image from `stream`.
    ///
    /// The stream need not be seekable; implementations buffer it if they must.  Implementations
    /// should check `token` between stages and fail with [DecodeError::Cancelled].
    fn decode(
        &self,
        stream: &mut dyn Read,
        token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_must_match() {
        assert!(DecodedImage::new(2, 2, vec![0u8; 16]).is_ok());
        assert!(matches!(
            DecodedImage::new(2, 2, vec![0u8; 15]),
            Err(DecodeError::InvalidDimensions { len: 15, .. })
        ));
        assert!(DecodedImage::new(0, 4, Vec::new()).is_err());
    }

    #[test]
    fn solid_fill() {
        let image = DecodedImage::solid(3, 1, [1, 2, 3, 4]).unwrap();
        assert_eq!(&image.pixels()[..], &[1, 2, 3, 4, 1, 2, 3, 4, 1, 2, 3, 4]);
    }
}
