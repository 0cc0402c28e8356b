// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! CPU textures for [super::SoftwareDevice].

Each mip level is a tightly packed RGBA8 array, origin at the top-left, x to the right and
y downward.
*/

use crate::device::{TextureDescriptor, TextureInfo, TextureLifetime, level_extent};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

struct Inner {
    id: u64,
    width: u32,
    height: u32,
    mip_count: u32,
    random_write: bool,
    lifetime: TextureLifetime,
    debug_name: String,
    levels: Mutex<Vec<Vec<u8>>>,
}

/// A texture living in main memory.  Clones share storage.
#[derive(Clone)]
pub struct SoftwareTexture {
    inner: Arc<Inner>,
}

impl SoftwareTexture {
    pub(super) fn new(id: u64, descriptor: &TextureDescriptor) -> Self {
        let mip_count = descriptor.mip_count.max(1);
        let levels = (0..mip_count)
            .map(|mip| {
                let w = level_extent(descriptor.width, mip) as usize;
                let h = level_extent(descriptor.height, mip) as usize;
                vec![0u8; w * h * 4]
            })
            .collect();
        SoftwareTexture {
            inner: Arc::new(Inner {
                id,
                width: descriptor.width,
                height: descriptor.height,
                mip_count,
                random_write: descriptor.random_write,
                lifetime: descriptor.lifetime,
                debug_name: descriptor.debug_name.clone(),
                levels: Mutex::new(levels),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn debug_name(&self) -> &str {
        &self.inner.debug_name
    }

    pub fn lifetime(&self) -> TextureLifetime {
        self.inner.lifetime
    }

    pub fn info(&self) -> TextureInfo {
        TextureInfo {
            width: self.inner.width,
            height: self.inner.height,
            mip_count: self.inner.mip_count,
            random_write: self.inner.random_write,
        }
    }

    /// A copy of one mip level.
    pub fn read_level(&self, mip: u32) -> Vec<u8> {
        self.levels()
            .get(mip as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// The texel at `(x, y)` on `mip`.
    ///
    /// # Panics
    /// If the coordinate is outside the level.
    pub fn texel(&self, x: u32, y: u32, mip: u32) -> [u8; 4] {
        let (w, _) = self.info().level_size(mip);
        let levels = self.levels();
        let start = (y as usize * w as usize + x as usize) * 4;
        let mut out = [0u8; 4];
        out.copy_from_slice(&levels[mip as usize][start..start + 4]);
        out
    }

    pub(super) fn levels(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.inner.levels.lock().expect("texture levels poisoned")
    }

    /// Rebuilds every level below 0 with a 2x2 box filter.
    pub(super) fn regenerate_mips(&self) {
        let info = self.info();
        let mut levels = self.levels();
        for mip in 1..info.mip_count {
            let (src_w, src_h) = info.level_size(mip - 1);
            let (dst_w, dst_h) = info.level_size(mip);
            let (before, after) = levels.split_at_mut(mip as usize);
            let src = &before[mip as usize - 1];
            let dst = &mut after[0];
            for y in 0..dst_h {
                for x in 0..dst_w {
                    for c in 0..4 {
                        let mut sum = 0u32;
                        let mut n = 0u32;
                        for (sx, sy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let px = (x * 2 + sx).min(src_w - 1);
                            let py = (y * 2 + sy).min(src_h - 1);
                            sum += src[((py * src_w + px) * 4 + c) as usize] as u32;
                            n += 1;
                        }
                        dst[((y * dst_w + x) * 4 + c) as usize] = ((sum + n / 2) / n) as u8;
                    }
                }
            }
        }
    }
}

impl PartialEq for SoftwareTexture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for SoftwareTexture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTexture")
            .field("id", &self.inner.id)
            .field("debug_name", &self.inner.debug_name)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("mip_count", &self.inner.mip_count)
            .finish()
    }
}
