// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! PNG decoding via the `png` crate.

use super::{DecodedImage, ImageDecoder};
use crate::cancellation::CancellationToken;
use crate::error::DecodeError;
use png::{ColorType, Transformations};
use std::io::{Cursor, Read};

/// Decodes any PNG to RGBA8.
///
/// Palettes are expanded, 16-bit channels are stripped to 8 bits, and missing channels are filled
/// in (grey is replicated, alpha is opaque).
#[derive(Debug, Clone, Copy, Default)]
pub struct PngDecoder;

impl PngDecoder {
    pub fn new() -> Self {
        PngDecoder
    }

    /// Decodes an in-memory PNG.
    pub fn decode_bytes(
        &self,
        bytes: &[u8],
        token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError> {
        token.check()?;
        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(Transformations::normalize_to_color8());
        let mut reader = decoder.read_info().map_err(convert_error)?;
        let (width, height) = {
            let info = reader.info();
            (info.width, info.height)
        };
        logwise::trace_sync!(
            "decoding png {width}x{height}",
            width = width,
            height = height
        );
        token.check()?;
        //after normalization nothing is wider than 4 bytes per pixel
        let mut buf = vec![0u8; width as usize * height as usize * 4];
        let info = reader.next_frame(&mut buf).map_err(convert_error)?;
        token.check()?;
        let used = info.line_size * info.height as usize;
        buf.truncate(used);
        let rgba = expand_to_rgba(info.color_type, buf)?;
        DecodedImage::new(info.width, info.height, rgba)
    }
}

impl ImageDecoder for PngDecoder {
    fn decode(
        &self,
        stream: &mut dyn Read,
        token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError> {
        //png wants BufRead + Seek; buffer the whole stream
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        self.decode_bytes(&bytes, token)
    }
}

fn expand_to_rgba(color_type: ColorType, buf: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
    match color_type {
        ColorType::Rgba => Ok(buf),
        ColorType::Rgb => Ok(buf
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect()),
        ColorType::Grayscale => Ok(buf.iter().flat_map(|&g| [g, g, g, 255]).collect()),
        ColorType::GrayscaleAlpha => Ok(buf
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect()),
        ColorType::Indexed => Err(DecodeError::Unsupported(
            "palette was not expanded".to_string(),
        )),
    }
}

fn convert_error(e: png::DecodingError) -> DecodeError {
    match e {
        png::DecodingError::IoError(e) => DecodeError::Io(e),
        png::DecodingError::LimitsExceeded => {
            DecodeError::Unsupported("image exceeds decoder limits".to_string())
        }
        other => DecodeError::Malformed(other.to_string()),
    }
}
