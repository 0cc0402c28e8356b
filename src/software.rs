// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A [GraphicsDevice] that runs on the CPU.

[SoftwareDevice] implements the whole device contract in main memory.  It is the reference the
upload pipeline is tested against, and it is useful anywhere a GPU isn't available.

Besides doing the work, it keeps a log of every call as [DeviceEvent]s, counts live buffers and
textures so leaks show up, and can be told which thread is the graphics thread so calls made
from anywhere else are counted.

The blit is emulated invocation by invocation on the same 8x8 tiling the GPU program uses, so
a wrong grid leaves texels unwritten here as it would on hardware.
*/

pub mod texture;

pub use texture::SoftwareTexture;

use crate::device::{
    GraphicsDevice, TextureDescriptor, TextureInfo, TextureRegion, check_staging_range,
    mip_levels_for,
};
use crate::error::DeviceError;
use crate::upload::blit::{BlitParams, DispatchGrid};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

/// One call into a [SoftwareDevice].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    ProgramLoaded,
    BufferCreated {
        buffer: u64,
        elements: usize,
    },
    BufferDisposed {
        buffer: u64,
    },
    StagingWrite {
        buffer: u64,
        byte_offset: usize,
        byte_len: usize,
    },
    Dispatch {
        texture: u64,
        buffer: u64,
        params: BlitParams,
        grid: DispatchGrid,
    },
    TextureCreated {
        texture: u64,
        width: u32,
        height: u32,
        mip_count: u32,
    },
    TextureWritten {
        texture: u64,
        region: TextureRegion,
    },
    MipsGenerated {
        texture: u64,
    },
    TextureReleased {
        texture: u64,
    },
}

/// A staging buffer of 32-bit words.  Clones share storage.
#[derive(Clone)]
pub struct SoftwareBuffer {
    id: u64,
    words: Arc<Mutex<Vec<u32>>>,
}

impl SoftwareBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn words(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        self.words.lock().expect("buffer poisoned")
    }
}

impl Debug for SoftwareBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBuffer")
            .field("id", &self.id)
            .field("elements", &self.words().len())
            .finish()
    }
}

/// The software blit program.  There is nothing to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareBlitProgram;

/// A CPU implementation of [GraphicsDevice].
pub struct SoftwareDevice {
    compute: bool,
    graphics_thread: Mutex<Option<ThreadId>>,
    off_thread_calls: AtomicUsize,
    events: Mutex<Vec<DeviceEvent>>,
    next_id: AtomicU64,
    live_buffers: AtomicUsize,
    live_textures: AtomicUsize,
}

impl SoftwareDevice {
    /// A device that supports compute dispatch.
    pub fn new() -> Self {
        SoftwareDevice {
            compute: true,
            graphics_thread: Mutex::new(None),
            off_thread_calls: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            live_buffers: AtomicUsize::new(0),
            live_textures: AtomicUsize::new(0),
        }
    }

    /// A device that reports no compute support, forcing the direct-write path.
    pub fn without_compute() -> Self {
        SoftwareDevice {
            compute: false,
            ..Self::new()
        }
    }

    /// Counts every later call made from a thread other than `thread`.
    pub fn set_graphics_thread(&self, thread: ThreadId) {
        *self
            .graphics_thread
            .lock()
            .expect("graphics thread poisoned") = Some(thread);
    }

    /// Calls that arrived from the wrong thread since [Self::set_graphics_thread].
    pub fn off_thread_calls(&self) -> usize {
        self.off_thread_calls.load(Ordering::Relaxed)
    }

    /// A snapshot of the call log.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().expect("events poisoned").clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    pub fn live_textures(&self) -> usize {
        self.live_textures.load(Ordering::Relaxed)
    }

    /// A copy of a staging buffer's words.
    pub fn read_buffer(&self, buffer: &SoftwareBuffer) -> Vec<u32> {
        buffer.words().clone()
    }

    /// A copy of one mip level of `texture`, as RGBA8 rows.
    pub fn read_texture(&self, texture: &SoftwareTexture, mip: u32) -> Vec<u8> {
        texture.read_level(mip)
    }

    fn record(&self, event: DeviceEvent) {
        self.events.lock().expect("events poisoned").push(event);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_thread(&self, call: &'static str) {
        let expected = *self
            .graphics_thread
            .lock()
            .expect("graphics thread poisoned");
        if let Some(expected) = expected {
            if std::thread::current().id() != expected {
                self.off_thread_calls.fetch_add(1, Ordering::Relaxed);
                logwise::warn_sync!("{call} called off the graphics thread", call = call);
            }
        }
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SoftwareDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("compute", &self.compute)
            .field("live_buffers", &self.live_buffers())
            .field("live_textures", &self.live_textures())
            .finish_non_exhaustive()
    }
}

impl GraphicsDevice for SoftwareDevice {
    type Texture = SoftwareTexture;
    type Buffer = SoftwareBuffer;
    type BlitProgram = SoftwareBlitProgram;

    fn supports_compute_dispatch(&self) -> bool {
        self.compute
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<SoftwareTexture, DeviceError> {
        self.check_thread("create_texture");
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(DeviceError::Allocation(format!(
                "texture {} has no texels",
                descriptor.debug_name
            )));
        }
        let levels = mip_levels_for(descriptor.width, descriptor.height);
        if descriptor.mip_count > levels {
            return Err(DeviceError::Allocation(format!(
                "texture {} asks for {} mips but {}x{} has {levels}",
                descriptor.debug_name, descriptor.mip_count, descriptor.width, descriptor.height
            )));
        }
        let texture = SoftwareTexture::new(self.next_id(), descriptor);
        self.live_textures.fetch_add(1, Ordering::Relaxed);
        self.record(DeviceEvent::TextureCreated {
            texture: texture.id(),
            width: descriptor.width,
            height: descriptor.height,
            mip_count: texture.info().mip_count,
        });
        Ok(texture)
    }

    fn texture_info(&self, texture: &SoftwareTexture) -> TextureInfo {
        texture.info()
    }

    fn release_texture(&self, texture: SoftwareTexture) {
        self.check_thread("release_texture");
        self.live_textures.fetch_sub(1, Ordering::Relaxed);
        self.record(DeviceEvent::TextureReleased {
            texture: texture.id(),
        });
    }

    fn write_texture(
        &self,
        texture: &SoftwareTexture,
        region: &TextureRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.check_thread("write_texture");
        let info = texture.info();
        if region.mip_level >= info.mip_count {
            return Err(DeviceError::Backend(format!(
                "mip {} out of range",
                region.mip_level
            )));
        }
        let (level_w, level_h) = info.level_size(region.mip_level);
        let row_bytes = region.width as usize * 4;
        let fits = region.x_offset as u64 + region.width as u64 <= level_w as u64
            && region.y_offset as u64 + region.height as u64 <= level_h as u64;
        if !fits || bytes.len() != row_bytes * region.height as usize {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: bytes.len(),
                capacity: level_w as usize * level_h as usize * 4,
            });
        }
        {
            let mut levels = texture.levels();
            let level = &mut levels[region.mip_level as usize];
            for (row, src) in bytes.chunks_exact(row_bytes).enumerate() {
                let start = ((region.y_offset as usize + row) * level_w as usize
                    + region.x_offset as usize)
                    * 4;
                level[start..start + row_bytes].copy_from_slice(src);
            }
        }
        self.record(DeviceEvent::TextureWritten {
            texture: texture.id(),
            region: *region,
        });
        Ok(())
    }

    fn generate_mips(&self, texture: &SoftwareTexture) -> Result<(), DeviceError> {
        self.check_thread("generate_mips");
        texture.regenerate_mips();
        self.record(DeviceEvent::MipsGenerated {
            texture: texture.id(),
        });
        Ok(())
    }

    fn load_blit_program(&self) -> Result<SoftwareBlitProgram, DeviceError> {
        self.check_thread("load_blit_program");
        if !self.compute {
            return Err(DeviceError::Unsupported("compute dispatch"));
        }
        self.record(DeviceEvent::ProgramLoaded);
        Ok(SoftwareBlitProgram)
    }

    fn create_staging_buffer(&self, elements: usize) -> Result<SoftwareBuffer, DeviceError> {
        self.check_thread("create_staging_buffer");
        let mut words = Vec::new();
        words
            .try_reserve_exact(elements)
            .map_err(|e| DeviceError::Allocation(e.to_string()))?;
        words.resize(elements, 0);
        let buffer = SoftwareBuffer {
            id: self.next_id(),
            words: Arc::new(Mutex::new(words)),
        };
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.record(DeviceEvent::BufferCreated {
            buffer: buffer.id,
            elements,
        });
        Ok(buffer)
    }

    fn dispose_buffer(&self, buffer: SoftwareBuffer) {
        self.check_thread("dispose_buffer");
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
        self.record(DeviceEvent::BufferDisposed { buffer: buffer.id });
    }

    fn write_staging(
        &self,
        buffer: &SoftwareBuffer,
        byte_offset: usize,
        byte_len: usize,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError> {
        self.check_thread("write_staging");
        let mut words = buffer.words();
        check_staging_range(byte_offset, byte_len, words.len() * 4)?;
        let range = byte_offset / 4..(byte_offset + byte_len) / 4;
        //begin write: map the sub-range
        let mut mapped: Vec<u8> = words[range.clone()]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        fill(&mut mapped);
        //end write: commit it
        for (word, bytes) in words[range].iter_mut().zip(mapped.chunks_exact(4)) {
            *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        drop(words);
        self.record(DeviceEvent::StagingWrite {
            buffer: buffer.id,
            byte_offset,
            byte_len,
        });
        Ok(())
    }

    fn dispatch_blit(
        &self,
        _program: &SoftwareBlitProgram,
        texture: &SoftwareTexture,
        buffer: &SoftwareBuffer,
        params: &BlitParams,
        grid: DispatchGrid,
    ) -> Result<(), DeviceError> {
        self.check_thread("dispatch_blit");
        let info = texture.info();
        if params.mip_level >= info.mip_count {
            return Err(DeviceError::Backend(format!(
                "mip {} out of range",
                params.mip_level
            )));
        }
        let (level_w, level_h) = info.level_size(params.mip_level);
        if params.x_offset as u64 + params.width as u64 > level_w as u64
            || params.y_offset as u64 + params.height as u64 > level_h as u64
        {
            return Err(DeviceError::Backend("blit region outside texture".to_string()));
        }
        let words = buffer.words();
        if params.words() > words.len() as u64 {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: params.words() as usize * 4,
                capacity: words.len() * 4,
            });
        }
        let (grid_w, grid_h) = grid.invocations();
        let cols = (params.width as u64).min(grid_w) as usize;
        let rows = (params.height as u64).min(grid_h) as usize;
        {
            let mut levels = texture.levels();
            let level = &mut levels[params.mip_level as usize];
            for y in 0..rows {
                for x in 0..cols {
                    let word = words[y * params.width as usize + x];
                    let dst = ((params.y_offset as usize + y) * level_w as usize
                        + params.x_offset as usize
                        + x)
                        * 4;
                    level[dst..dst + 4].copy_from_slice(&word.to_le_bytes());
                }
            }
        }
        drop(words);
        self.record(DeviceEvent::Dispatch {
            texture: texture.id(),
            buffer: buffer.id,
            params: *params,
            grid,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(device: &SoftwareDevice, pixels: &[[u8; 4]]) -> SoftwareBuffer {
        let buffer = device.create_staging_buffer(pixels.len()).unwrap();
        let bytes: Vec<u8> = pixels.iter().flatten().copied().collect();
        device
            .write_staging(&buffer, 0, bytes.len(), &mut |dst: &mut [u8]| {
                dst.copy_from_slice(&bytes)
            })
            .unwrap();
        buffer
    }

    #[test]
    fn blit_writes_only_the_region() {
        let device = SoftwareDevice::new();
        let texture = device
            .create_texture(&TextureDescriptor::new(4, 4, "t"))
            .unwrap();
        let buffer = staged(&device, &[[1, 2, 3, 4], [5, 6, 7, 8]]);
        let params = BlitParams {
            x_offset: 1,
            y_offset: 2,
            width: 2,
            height: 1,
            mip_level: 0,
            texture_height: 4,
        };
        device
            .dispatch_blit(
                &SoftwareBlitProgram,
                &texture,
                &buffer,
                &params,
                DispatchGrid::covering(2, 1),
            )
            .unwrap();
        assert_eq!(texture.texel(1, 2, 0), [1, 2, 3, 4]);
        assert_eq!(texture.texel(2, 2, 0), [5, 6, 7, 8]);
        assert_eq!(texture.texel(0, 2, 0), [0, 0, 0, 0]);
        assert_eq!(texture.texel(3, 2, 0), [0, 0, 0, 0]);
        assert_eq!(texture.texel(1, 1, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn short_grid_leaves_texels_unwritten() {
        let device = SoftwareDevice::new();
        let texture = device
            .create_texture(&TextureDescriptor::new(16, 1, "t"))
            .unwrap();
        let buffer = staged(&device, &[[9, 9, 9, 9]; 16]);
        let params = BlitParams::new(&TextureRegion::full(16, 1), 1);
        device
            .dispatch_blit(
                &SoftwareBlitProgram,
                &texture,
                &buffer,
                &params,
                DispatchGrid { x: 1, y: 1, z: 1 },
            )
            .unwrap();
        assert_eq!(texture.texel(7, 0, 0), [9, 9, 9, 9]);
        assert_eq!(texture.texel(8, 0, 0), [0, 0, 0, 0]);
    }

    #[test]
    fn blit_refuses_to_read_past_the_buffer() {
        let device = SoftwareDevice::new();
        let texture = device
            .create_texture(&TextureDescriptor::new(4, 4, "t"))
            .unwrap();
        let buffer = staged(&device, &[[1, 1, 1, 1]; 4]);
        let params = BlitParams::new(&TextureRegion::full(4, 4), 4);
        let r = device.dispatch_blit(
            &SoftwareBlitProgram,
            &texture,
            &buffer,
            &params,
            DispatchGrid::covering(4, 4),
        );
        assert!(matches!(r, Err(DeviceError::OutOfBounds { .. })));
    }

    #[test]
    fn partial_staging_write_leaves_neighbours() {
        let device = SoftwareDevice::new();
        let buffer = device.create_staging_buffer(3).unwrap();
        device
            .write_staging(&buffer, 4, 4, &mut |dst: &mut [u8]| dst.fill(0xff))
            .unwrap();
        assert_eq!(device.read_buffer(&buffer), vec![0, u32::MAX, 0]);
        assert!(matches!(
            device.write_staging(&buffer, 8, 8, &mut |_: &mut [u8]| {}),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn off_thread_calls_are_counted() {
        let device = Arc::new(SoftwareDevice::new());
        device.set_graphics_thread(std::thread::current().id());
        device.create_staging_buffer(1).unwrap();
        assert_eq!(device.off_thread_calls(), 0);
        let remote = device.clone();
        std::thread::spawn(move || {
            remote.create_staging_buffer(1).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(device.off_thread_calls(), 1);
        assert_eq!(device.live_buffers(), 2);
    }

    #[test]
    fn no_compute_has_no_program() {
        let device = SoftwareDevice::without_compute();
        assert!(!device.supports_compute_dispatch());
        assert!(matches!(
            device.load_blit_program(),
            Err(DeviceError::Unsupported(_))
        ));
    }

    #[test]
    fn mip_chains_cannot_outgrow_the_texture() {
        let device = SoftwareDevice::new();
        let too_deep = TextureDescriptor::new(4, 4, "too deep").with_mip_count(8);
        assert!(matches!(
            device.create_texture(&too_deep),
            Err(DeviceError::Allocation(_))
        ));
        let full = TextureDescriptor::new(4, 4, "full").with_mip_count(3);
        assert_eq!(device.create_texture(&full).unwrap().info().mip_count, 3);
        assert!(matches!(
            device.create_texture(&TextureDescriptor::new(0, 4, "empty")),
            Err(DeviceError::Allocation(_))
        ));
        assert_eq!(device.live_textures(), 1);
    }
}
