// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The graphics device seam.

The upload pipeline never talks to a GPU API directly.  It drives a [GraphicsDevice], which owns
textures, staging buffers and the blit program.  Two implementations ship with the crate:

* [crate::software::SoftwareDevice], a CPU reference that records every call.
* `WgpuDevice`, behind the `backend_wgpu` feature.

# Threading

Apart from [GraphicsDevice::texture_info] and [GraphicsDevice::supports_compute_dispatch], every
method is only called from the graphics context of the scheduler the loader was built with.
Handles are `Send + Sync` so they can travel between the caller and that context.
*/

use crate::error::{DeviceError, PreconditionViolation};
use crate::upload::blit::{BlitParams, DispatchGrid};

/// How long textures are expected to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLifetime {
    /// The texture is owned by the caller until it releases it.
    #[default]
    Persistent,
    /// The texture may come from, and go back to, a pool of temporary render targets.
    Pooled,
}

/// Everything needed to create a texture.  The format is always RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    /// Whether compute programs may write the texture directly.
    pub random_write: bool,
    pub lifetime: TextureLifetime,
    pub debug_name: String,
}

impl TextureDescriptor {
    /// A persistent, single-mip, random-write texture.
    pub fn new(width: u32, height: u32, debug_name: impl Into<String>) -> Self {
        TextureDescriptor {
            width,
            height,
            mip_count: 1,
            random_write: true,
            lifetime: TextureLifetime::Persistent,
            debug_name: debug_name.into(),
        }
    }

    pub fn with_mip_count(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count;
        self
    }

    pub fn with_random_write(mut self, random_write: bool) -> Self {
        self.random_write = random_write;
        self
    }

    pub fn with_lifetime(mut self, lifetime: TextureLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }
}

/// What the pipeline needs to know about an existing texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
    pub random_write: bool,
}

impl TextureInfo {
    /// Dimensions of mip level `mip`.  Levels never shrink below 1x1.
    pub fn level_size(&self, mip: u32) -> (u32, u32) {
        (level_extent(self.width, mip), level_extent(self.height, mip))
    }
}

/// Levels in a full mip chain for a `width`x`height` texture, down to 1x1.
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    (u32::BITS - width.max(height).leading_zeros()).max(1)
}

pub(crate) fn level_extent(size: u32, mip: u32) -> u32 {
    size.checked_shr(mip).unwrap_or(0).max(1)
}

/// A rectangle on one mip level of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRegion {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
    pub mip_level: u32,
}

impl TextureRegion {
    pub fn new(x_offset: u32, y_offset: u32, width: u32, height: u32, mip_level: u32) -> Self {
        TextureRegion {
            x_offset,
            y_offset,
            width,
            height,
            mip_level,
        }
    }

    /// The whole of mip 0 of a `width`x`height` texture.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height, 0)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes of RGBA8 data that cover the region.
    pub fn byte_len(&self) -> u64 {
        self.pixel_count() * 4
    }

    /// Checks that the region can be written into `info` from `data_len` bytes.
    pub fn validate(&self, info: &TextureInfo, data_len: usize) -> Result<(), PreconditionViolation> {
        if self.width == 0 || self.height == 0 {
            return Err(PreconditionViolation::EmptyRegion);
        }
        if self.mip_level >= info.mip_count {
            return Err(PreconditionViolation::MipOutOfRange {
                mip_level: self.mip_level,
                mip_count: info.mip_count,
            });
        }
        let (level_width, level_height) = info.level_size(self.mip_level);
        let fits_x = self.x_offset as u64 + self.width as u64 <= level_width as u64;
        let fits_y = self.y_offset as u64 + self.height as u64 <= level_height as u64;
        if !fits_x || !fits_y {
            return Err(PreconditionViolation::RegionOutOfBounds {
                x_offset: self.x_offset,
                y_offset: self.y_offset,
                width: self.width,
                height: self.height,
                level_width,
                level_height,
            });
        }
        if !info.random_write {
            return Err(PreconditionViolation::NotRandomWrite);
        }
        let expected = usize::try_from(self.byte_len()).map_err(|_| {
            PreconditionViolation::TooLarge {
                pixels: self.pixel_count(),
            }
        })?;
        if expected != data_len {
            return Err(PreconditionViolation::DataLength {
                expected,
                actual: data_len,
            });
        }
        Ok(())
    }
}

/// A GPU (or GPU-like) device the loader uploads through.
pub trait GraphicsDevice: Send + Sync + 'static {
    type Texture: Clone + Send + Sync + 'static;
    /// A staging buffer of 32-bit elements.
    type Buffer: Clone + Send + Sync + 'static;
    /// The compiled compute program that moves staged words into a texture.
    type BlitProgram: Clone + Send + Sync + 'static;

    /// Whether [Self::dispatch_blit] is available.  When false, uploads use [Self::write_texture].
    fn supports_compute_dispatch(&self) -> bool;

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Self::Texture, DeviceError>;

    /// May be called from any thread.
    fn texture_info(&self, texture: &Self::Texture) -> TextureInfo;

    /// Gives a texture back to the device (or its pool).
    fn release_texture(&self, texture: Self::Texture);

    /// Writes tightly packed RGBA8 `bytes` into `region` without going through staging.
    fn write_texture(
        &self,
        texture: &Self::Texture,
        region: &TextureRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError>;

    /// Rebuilds every level below 0 from level 0.
    fn generate_mips(&self, texture: &Self::Texture) -> Result<(), DeviceError>;

    fn load_blit_program(&self) -> Result<Self::BlitProgram, DeviceError>;

    fn create_staging_buffer(&self, elements: usize) -> Result<Self::Buffer, DeviceError>;

    /// Frees the buffer's GPU memory.
    fn dispose_buffer(&self, buffer: Self::Buffer);

    /**
    Updates `byte_len` bytes of `buffer` starting at `byte_offset`.

    This is one begin-write/end-write pair: `fill` receives the mapped sub-range, and the range is
    committed when it returns.  Both offset and length must be multiples of 4.  Bytes outside the
    range are untouched.
    */
    fn write_staging(
        &self,
        buffer: &Self::Buffer,
        byte_offset: usize,
        byte_len: usize,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError>;

    /// Issues one compute dispatch copying staged words into the region described by `params`.
    fn dispatch_blit(
        &self,
        program: &Self::BlitProgram,
        texture: &Self::Texture,
        buffer: &Self::Buffer,
        params: &BlitParams,
        grid: DispatchGrid,
    ) -> Result<(), DeviceError>;
}

/// Checks the arguments of a [GraphicsDevice::write_staging] call against a buffer of
/// `capacity_bytes`.
pub fn check_staging_range(
    byte_offset: usize,
    byte_len: usize,
    capacity_bytes: usize,
) -> Result<(), DeviceError> {
    if byte_offset % 4 != 0 || byte_len % 4 != 0 {
        return Err(DeviceError::Misaligned {
            offset: byte_offset,
            len: byte_len,
            alignment: 4,
        });
    }
    match byte_offset.checked_add(byte_len) {
        Some(end) if end <= capacity_bytes => Ok(()),
        _ => Err(DeviceError::OutOfBounds {
            offset: byte_offset,
            len: byte_len,
            capacity: capacity_bytes,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32, mip_count: u32) -> TextureInfo {
        TextureInfo {
            width,
            height,
            mip_count,
            random_write: true,
        }
    }

    #[test]
    fn level_sizes() {
        let i = info(64, 16, 7);
        assert_eq!(i.level_size(0), (64, 16));
        assert_eq!(i.level_size(2), (16, 4));
        assert_eq!(i.level_size(5), (2, 1));
        assert_eq!(i.level_size(40), (1, 1));
    }

    #[test]
    fn region_checks() {
        let i = info(64, 64, 2);
        assert_eq!(TextureRegion::full(64, 64).validate(&i, 64 * 64 * 4), Ok(()));
        assert_eq!(
            TextureRegion::new(0, 0, 0, 4, 0).validate(&i, 0),
            Err(PreconditionViolation::EmptyRegion)
        );
        assert!(matches!(
            TextureRegion::new(1, 0, 64, 64, 0).validate(&i, 64 * 64 * 4),
            Err(PreconditionViolation::RegionOutOfBounds { .. })
        ));
        //mip 1 is 32x32
        assert!(matches!(
            TextureRegion::new(0, 0, 33, 1, 1).validate(&i, 33 * 4),
            Err(PreconditionViolation::RegionOutOfBounds { .. })
        ));
        assert_eq!(
            TextureRegion::new(0, 0, 1, 1, 2).validate(&i, 4),
            Err(PreconditionViolation::MipOutOfRange {
                mip_level: 2,
                mip_count: 2
            })
        );
        assert_eq!(
            TextureRegion::new(0, 0, 2, 2, 0).validate(&i, 15),
            Err(PreconditionViolation::DataLength {
                expected: 16,
                actual: 15
            })
        );
        let read_only = TextureInfo {
            random_write: false,
            ..i
        };
        assert_eq!(
            TextureRegion::full(2, 2).validate(&read_only, 16),
            Err(PreconditionViolation::NotRandomWrite)
        );
    }

    #[test]
    fn offsets_do_not_overflow() {
        let i = info(u32::MAX, 1, 1);
        assert!(matches!(
            TextureRegion::new(u32::MAX, 0, 2, 1, 0).validate(&i, 8),
            Err(PreconditionViolation::RegionOutOfBounds { .. })
        ));
    }

    #[test]
    fn staging_ranges() {
        assert_eq!(check_staging_range(0, 16, 16), Ok(()));
        assert!(matches!(
            check_staging_range(2, 4, 16),
            Err(DeviceError::Misaligned { .. })
        ));
        assert!(matches!(
            check_staging_range(8, 12, 16),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn full_mip_chains() {
        assert_eq!(mip_levels_for(1, 1), 1);
        assert_eq!(mip_levels_for(4, 4), 3);
        assert_eq!(mip_levels_for(5, 2), 3);
        assert_eq!(mip_levels_for(4096, 1), 13);
        assert_eq!(mip_levels_for(0, 0), 1);
        assert_eq!(mip_levels_for(u32::MAX, 1), 32);
    }
}
