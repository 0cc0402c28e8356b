// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
wgpu implementation of [GraphicsDevice].

The staging buffer is a `STORAGE | COPY_DST` buffer.  Each chunk is written straight into a
`QueueWriteBufferView` from `Queue::write_buffer_with`, so no intermediate copy is made.  The blit
is a WGSL compute shader reading the staged words and storing them into an `rgba8unorm` storage
view of the target mip.  Mip regeneration runs a second compute shader once per level.

Resource creation and dispatches run inside a validation error scope; validation failures come back
as [DeviceError::Backend] rather than reaching the device's uncaptured-error handler.

Compute support is taken from the adapter's `COMPUTE_SHADERS` downlevel flag.
*/

mod error;

pub use error::Error;

use crate::device::{
    GraphicsDevice, TextureDescriptor, TextureInfo, TextureRegion, check_staging_range,
    mip_levels_for,
};
use crate::error::DeviceError;
use crate::upload::blit::{BlitParams, DispatchGrid, WORKGROUP_SIZE};
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::num::NonZeroU64;
use std::sync::OnceLock;
use std::task::{Context, Poll, Waker};
use wgpu::util::DeviceExt;
use wgpu::{PollType, Trace};

const BLIT_SHADER: &str = include_str!("wgpu/blit.wgsl");
const DOWNSAMPLE_SHADER: &str = include_str!("wgpu/downsample.wgsl");

const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// A texture and what we know about it.
#[derive(Debug, Clone)]
pub struct WgpuTexture {
    texture: wgpu::Texture,
    info: TextureInfo,
}

impl WgpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }
}

#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    elements: usize,
}

#[derive(Debug, Clone)]
pub struct WgpuBlitProgram {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// A [GraphicsDevice] backed by wgpu.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    compute: bool,
    downsample: OnceLock<WgpuBlitProgram>,
}

impl WgpuDevice {
    /// Opens the default adapter.
    pub async fn new() -> Result<Self, Error> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|_| Error::NoSuchAdapter)?;
        let compute = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        let descriptor = wgpu::DeviceDescriptor {
            label: Some("staged_textures"),
            required_features: Default::default(),
            required_limits: adapter.limits(),
            memory_hints: Default::default(),
            trace: Trace::Off,
        };
        let (device, queue) = adapter.request_device(&descriptor).await?;
        logwise::info_sync!(
            "opened wgpu device; compute {compute}",
            compute = compute
        );
        Ok(Self::from_parts(device, queue, compute))
    }

    /// Wraps a device the application already owns.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue, supports_compute: bool) -> Self {
        WgpuDevice {
            device,
            queue,
            compute: supports_compute,
            downsample: OnceLock::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn compile(&self, label: &'static str, source: &'static str, entry: &'static str) -> WgpuBlitProgram {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            });
        let layout = pipeline.get_bind_group_layout(0);
        WgpuBlitProgram { pipeline, layout }
    }

    fn mip_view(texture: &wgpu::Texture, mip: u32) -> wgpu::TextureView {
        texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("staged_textures mip view"),
            base_mip_level: mip,
            mip_level_count: Some(1),
            ..Default::default()
        })
    }

    /// Runs `f` inside a validation error scope, so invalid calls come back as errors instead of
    /// reaching the uncaptured-error handler.
    fn validated<T>(&self, f: impl FnOnce() -> T) -> Result<T, DeviceError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let scope = std::pin::pin!(self.device.pop_error_scope());
        let mut cx = Context::from_waker(Waker::noop());
        match scope.poll(&mut cx) {
            Poll::Ready(None) => Ok(value),
            Poll::Ready(Some(e)) => Err(DeviceError::Backend(e.to_string())),
            Poll::Pending => {
                //native scopes resolve immediately; anything else we can't wait for here
                logwise::warn_sync!("validation scope did not resolve synchronously");
                Ok(value)
            }
        }
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit([encoder.finish()]);
        //nonblocking; lets callbacks and cleanup run
        let _ = self.device.poll(PollType::Poll);
    }
}

impl Debug for WgpuDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("compute", &self.compute)
            .finish_non_exhaustive()
    }
}

fn blit_uniform(params: &BlitParams) -> Vec<u8> {
    [
        params.x_offset,
        params.y_offset,
        params.width,
        params.height,
        params.mip_level,
        params.texture_height,
        0,
        0,
    ]
    .iter()
    .flat_map(|v| v.to_le_bytes())
    .collect()
}

impl GraphicsDevice for WgpuDevice {
    type Texture = WgpuTexture;
    type Buffer = WgpuBuffer;
    type BlitProgram = WgpuBlitProgram;

    fn supports_compute_dispatch(&self) -> bool {
        self.compute
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<WgpuTexture, DeviceError> {
        let mut usage = wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC;
        if descriptor.random_write {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if descriptor.width == 0 || descriptor.height == 0 {
            return Err(DeviceError::Allocation(format!(
                "texture {} has no texels",
                descriptor.debug_name
            )));
        }
        let mip_count = descriptor.mip_count.max(1);
        let levels = mip_levels_for(descriptor.width, descriptor.height);
        if mip_count > levels {
            return Err(DeviceError::Allocation(format!(
                "texture {} asks for {mip_count} mips but {}x{} has {levels}",
                descriptor.debug_name, descriptor.width, descriptor.height
            )));
        }
        let texture = self.validated(|| {
            self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(descriptor.debug_name.as_str()),
            size: wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage,
            view_formats: &[],
            })
        })?;
        Ok(WgpuTexture {
            texture,
            info: TextureInfo {
                width: descriptor.width,
                height: descriptor.height,
                mip_count,
                random_write: descriptor.random_write,
            },
        })
    }

    fn texture_info(&self, texture: &WgpuTexture) -> TextureInfo {
        texture.info
    }

    fn release_texture(&self, texture: WgpuTexture) {
        texture.texture.destroy();
    }

    fn write_texture(
        &self,
        texture: &WgpuTexture,
        region: &TextureRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: region.mip_level,
                origin: wgpu::Origin3d {
                    x: region.x_offset,
                    y: region.y_offset,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(region.width * 4),
                rows_per_image: Some(region.height),
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn generate_mips(&self, texture: &WgpuTexture) -> Result<(), DeviceError> {
        if !self.compute {
            return Err(DeviceError::Unsupported("mip generation needs compute shaders"));
        }
        if !texture.info.random_write {
            return Err(DeviceError::Unsupported("mip generation needs a storage texture"));
        }
        let program = self
            .downsample
            .get_or_init(|| self.compile("staged_textures downsample", DOWNSAMPLE_SHADER, "downsample"));
        self.validated(|| {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("staged_textures mips"),
                });
            for mip in 1..texture.info.mip_count {
                let source = Self::mip_view(&texture.texture, mip - 1);
                let destination = Self::mip_view(&texture.texture, mip);
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("staged_textures downsample"),
                    layout: &program.layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&source),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&destination),
                        },
                    ],
                });
                let (width, height) = texture.info.level_size(mip);
                let grid = DispatchGrid::covering(width, height);
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("staged_textures downsample"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(grid.x, grid.y, grid.z);
            }
            self.submit(encoder);
        })
    }

    fn load_blit_program(&self) -> Result<WgpuBlitProgram, DeviceError> {
        if !self.compute {
            return Err(DeviceError::Unsupported("compute dispatch"));
        }
        debug_assert_eq!(WORKGROUP_SIZE, 8, "blit.wgsl hardcodes the workgroup size");
        self.validated(|| self.compile("staged_textures blit", BLIT_SHADER, "blit"))
    }

    fn create_staging_buffer(&self, elements: usize) -> Result<WgpuBuffer, DeviceError> {
        let size = elements
            .checked_mul(4)
            .and_then(|b| u64::try_from(b).ok())
            .ok_or_else(|| DeviceError::Allocation(format!("{elements} elements")))?;
        let max = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > max {
            return Err(DeviceError::Allocation(format!(
                "{size} bytes exceeds the storage binding limit of {max}"
            )));
        }
        let buffer = self.validated(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staged_textures staging"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(WgpuBuffer { buffer, elements })
    }

    fn dispose_buffer(&self, buffer: WgpuBuffer) {
        buffer.buffer.destroy();
    }

    fn write_staging(
        &self,
        buffer: &WgpuBuffer,
        byte_offset: usize,
        byte_len: usize,
        fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError> {
        check_staging_range(byte_offset, byte_len, buffer.elements * 4)?;
        let Some(size) = NonZeroU64::new(byte_len as u64) else {
            return Ok(());
        };
        //begin write: the view is the mapped sub-range; dropping it ends the write
        let mut mapped = self
            .queue
            .write_buffer_with(&buffer.buffer, byte_offset as u64, size)
            .ok_or_else(|| DeviceError::Backend("staging write rejected".to_string()))?;
        fill(&mut mapped);
        drop(mapped);
        Ok(())
    }

    fn dispatch_blit(
        &self,
        program: &WgpuBlitProgram,
        texture: &WgpuTexture,
        buffer: &WgpuBuffer,
        params: &BlitParams,
        grid: DispatchGrid,
    ) -> Result<(), DeviceError> {
        if params.words() > buffer.elements as u64 {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: params.words() as usize * 4,
                capacity: buffer.elements * 4,
            });
        }
        self.validated(|| {
            let uniform = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("staged_textures blit params"),
                    contents: &blit_uniform(params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let destination = Self::mip_view(&texture.texture, params.mip_level);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("staged_textures blit"),
                layout: &program.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: buffer.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&destination),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniform.as_entire_binding(),
                    },
                ],
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("staged_textures blit"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("staged_textures blit"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(grid.x, grid.y, grid.z);
            }
            self.submit(encoder);
        })
    }
}
