// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Loader configuration.
//!
//! [LoaderConfig] is a builder consumed when the loader is constructed.  The loader keeps the
//! values in [UploadSettings], which can be changed at any time from any thread: chunk size and
//! time slice take effect on the next chunk, initial capacity on the next resize.

use crate::device::TextureLifetime;
use crate::sys::time::{Duration, millis};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Default budget for one time slice of the chunked copy.
pub const DEFAULT_UPLOAD_TIME_SLICE_MILLIS: f64 = 3.0;
/// Default bytes written per chunk.
pub const DEFAULT_CHUNK_BYTE_SIZE: usize = 131_072;
/// Default floor for the staging buffer, in pixels.
pub const DEFAULT_INITIAL_STAGING_CAPACITY_PIXELS: usize = 16_777_216;

/// Builder for loader settings.
///
/// ```
/// use staged_textures::config::LoaderConfig;
/// let config = LoaderConfig::new()
///     .with_upload_time_slice_millis(1.5)
///     .with_chunk_byte_size(64 * 1024);
/// assert_eq!(config.chunk_byte_size(), 65_536);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    upload_time_slice_millis: f64,
    chunk_byte_size: usize,
    initial_staging_capacity_pixels: usize,
    texture_mip_count: u32,
    texture_lifetime: TextureLifetime,
    regenerate_mips: bool,
}

impl LoaderConfig {
    pub fn new() -> Self {
        LoaderConfig {
            upload_time_slice_millis: DEFAULT_UPLOAD_TIME_SLICE_MILLIS,
            chunk_byte_size: DEFAULT_CHUNK_BYTE_SIZE,
            initial_staging_capacity_pixels: DEFAULT_INITIAL_STAGING_CAPACITY_PIXELS,
            texture_mip_count: 1,
            texture_lifetime: TextureLifetime::Persistent,
            regenerate_mips: true,
        }
    }

    /// Budget for each slice of the chunked copy.  Zero or negative yields after every chunk.
    pub fn with_upload_time_slice_millis(mut self, millis: f64) -> Self {
        self.upload_time_slice_millis = sanitize_millis(millis);
        self
    }

    /// Bytes written per chunk, rounded up to a multiple of 4.
    pub fn with_chunk_byte_size(mut self, bytes: usize) -> Self {
        self.chunk_byte_size = sanitize_chunk(bytes);
        self
    }

    /// Smallest staging buffer ever allocated, in pixels.
    pub fn with_initial_staging_capacity_pixels(mut self, pixels: usize) -> Self {
        self.initial_staging_capacity_pixels = pixels.max(1);
        self
    }

    /// Mip count for textures the loader creates.
    pub fn with_texture_mip_count(mut self, mip_count: u32) -> Self {
        self.texture_mip_count = mip_count.max(1);
        self
    }

    pub fn with_texture_lifetime(mut self, lifetime: TextureLifetime) -> Self {
        self.texture_lifetime = lifetime;
        self
    }

    /// Whether lower mips are regenerated after an upload into a mipmapped texture.
    pub fn with_regenerate_mips(mut self, regenerate: bool) -> Self {
        self.regenerate_mips = regenerate;
        self
    }

    pub fn upload_time_slice_millis(&self) -> f64 {
        self.upload_time_slice_millis
    }

    pub fn chunk_byte_size(&self) -> usize {
        self.chunk_byte_size
    }

    pub fn initial_staging_capacity_pixels(&self) -> usize {
        self.initial_staging_capacity_pixels
    }

    pub fn texture_mip_count(&self) -> u32 {
        self.texture_mip_count
    }

    pub fn texture_lifetime(&self) -> TextureLifetime {
        self.texture_lifetime
    }

    pub fn regenerate_mips(&self) -> bool {
        self.regenerate_mips
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize_millis(millis: f64) -> f64 {
    if millis.is_nan() || millis < 0.0 {
        0.0
    } else {
        millis
    }
}

fn sanitize_chunk(bytes: usize) -> usize {
    crate::bittricks::align_to_element(bytes.clamp(4, usize::MAX - 3))
}

/// Live settings of one loader.
///
/// Every getter and setter is a relaxed atomic; readers see the most recent write at their next
/// read.
#[derive(Debug)]
pub struct UploadSettings {
    upload_time_slice_millis: AtomicU64,
    chunk_byte_size: AtomicUsize,
    initial_staging_capacity_pixels: AtomicUsize,
    texture_mip_count: AtomicU32,
    texture_lifetime: AtomicU8,
    regenerate_mips: AtomicBool,
}

impl UploadSettings {
    pub fn new(config: &LoaderConfig) -> Self {
        UploadSettings {
            upload_time_slice_millis: AtomicU64::new(config.upload_time_slice_millis.to_bits()),
            chunk_byte_size: AtomicUsize::new(config.chunk_byte_size),
            initial_staging_capacity_pixels: AtomicUsize::new(
                config.initial_staging_capacity_pixels,
            ),
            texture_mip_count: AtomicU32::new(config.texture_mip_count),
            texture_lifetime: AtomicU8::new(lifetime_to_u8(config.texture_lifetime)),
            regenerate_mips: AtomicBool::new(config.regenerate_mips),
        }
    }

    pub fn upload_time_slice_millis(&self) -> f64 {
        f64::from_bits(self.upload_time_slice_millis.load(Ordering::Relaxed))
    }

    pub fn set_upload_time_slice_millis(&self, millis: f64) {
        self.upload_time_slice_millis
            .store(sanitize_millis(millis).to_bits(), Ordering::Relaxed);
    }

    /// The slice budget as a [Duration].
    pub fn time_slice(&self) -> Duration {
        millis(self.upload_time_slice_millis())
    }

    pub fn chunk_byte_size(&self) -> usize {
        self.chunk_byte_size.load(Ordering::Relaxed)
    }

    pub fn set_chunk_byte_size(&self, bytes: usize) {
        self.chunk_byte_size
            .store(sanitize_chunk(bytes), Ordering::Relaxed);
    }

    pub fn initial_staging_capacity_pixels(&self) -> usize {
        self.initial_staging_capacity_pixels.load(Ordering::Relaxed)
    }

    pub fn set_initial_staging_capacity_pixels(&self, pixels: usize) {
        self.initial_staging_capacity_pixels
            .store(pixels.max(1), Ordering::Relaxed);
    }

    pub fn texture_mip_count(&self) -> u32 {
        self.texture_mip_count.load(Ordering::Relaxed)
    }

    pub fn set_texture_mip_count(&self, mip_count: u32) {
        self.texture_mip_count
            .store(mip_count.max(1), Ordering::Relaxed);
    }

    pub fn texture_lifetime(&self) -> TextureLifetime {
        lifetime_from_u8(self.texture_lifetime.load(Ordering::Relaxed))
    }

    pub fn set_texture_lifetime(&self, lifetime: TextureLifetime) {
        self.texture_lifetime
            .store(lifetime_to_u8(lifetime), Ordering::Relaxed);
    }

    pub fn regenerate_mips(&self) -> bool {
        self.regenerate_mips.load(Ordering::Relaxed)
    }

    pub fn set_regenerate_mips(&self, regenerate: bool) {
        self.regenerate_mips.store(regenerate, Ordering::Relaxed);
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self::new(&LoaderConfig::default())
    }
}

fn lifetime_to_u8(lifetime: TextureLifetime) -> u8 {
    match lifetime {
        TextureLifetime::Persistent => 0,
        TextureLifetime::Pooled => 1,
    }
}

fn lifetime_from_u8(value: u8) -> TextureLifetime {
    match value {
        1 => TextureLifetime::Pooled,
        _ => TextureLifetime::Persistent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.upload_time_slice_millis(), 3.0);
        assert_eq!(config.chunk_byte_size(), 131_072);
        assert_eq!(config.initial_staging_capacity_pixels(), 16_777_216);
        assert_eq!(config.texture_mip_count(), 1);
        assert_eq!(config.texture_lifetime(), TextureLifetime::Persistent);
        assert!(config.regenerate_mips());
    }

    #[test]
    fn builder_sanitizes() {
        let config = LoaderConfig::new()
            .with_upload_time_slice_millis(-5.0)
            .with_chunk_byte_size(0)
            .with_initial_staging_capacity_pixels(0)
            .with_texture_mip_count(0);
        assert_eq!(config.upload_time_slice_millis(), 0.0);
        assert_eq!(config.chunk_byte_size(), 4);
        assert_eq!(config.initial_staging_capacity_pixels(), 1);
        assert_eq!(config.texture_mip_count(), 1);

        let config = LoaderConfig::new()
            .with_upload_time_slice_millis(f64::NAN)
            .with_chunk_byte_size(10);
        assert_eq!(config.upload_time_slice_millis(), 0.0);
        assert_eq!(config.chunk_byte_size(), 12);
    }

    #[test]
    fn settings_are_live() {
        let settings = UploadSettings::new(&LoaderConfig::new().with_chunk_byte_size(1024));
        assert_eq!(settings.chunk_byte_size(), 1024);
        settings.set_chunk_byte_size(7);
        assert_eq!(settings.chunk_byte_size(), 8);
        settings.set_upload_time_slice_millis(0.5);
        assert_eq!(settings.time_slice(), Duration::from_micros(500));
        settings.set_texture_lifetime(TextureLifetime::Pooled);
        assert_eq!(settings.texture_lifetime(), TextureLifetime::Pooled);
        settings.set_initial_staging_capacity_pixels(0);
        assert_eq!(settings.initial_staging_capacity_pixels(), 1);
    }
}
