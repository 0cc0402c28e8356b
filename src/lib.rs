// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! staged_textures loads textures asynchronously, streaming decoded pixels into GPU textures
without blocking the thread that renders.

The usual way to get an image onto the GPU is "decode, then write the whole texture".  For large
images that write is a frame-time spike on whatever thread owns the graphics context.
staged_textures spreads it out:

| Step     | Where                  | How                                                                    |
|----------|------------------------|------------------------------------------------------------------------|
| Decode   | background thread      | [ImageDecoder], PNG out of the box                                     |
| Stage    | graphics thread, sliced | copy into one shared staging buffer in chunks, yielding between slices |
| Blit     | GPU                    | one compute dispatch from the staging buffer into the texture region   |
| Mips     | GPU                    | optional regeneration for mipmapped textures                           |

# The shared staging buffer

Each [TextureLoader] owns exactly one staging buffer behind an [AsyncGate].  Concurrent uploads
queue for it, so one upload's bytes can never interleave with another's.  The buffer grows to the
next power of two as needed and never shrinks.

# Scheduling

The loader is written against [GraphicsScheduler], which knows how to run work on the graphics
context and how to give control back between time slices.  It is runtime-agnostic: the futures
can be polled by any executor.  [InlineScheduler] is for callers already on the graphics thread;
[GraphicsThread] dedicates a thread to the device.

# Cancellation

Every operation takes a [CancellationToken].  Tokens are checked at every chunk and every
suspension point, and the gate permit is released however an upload ends.  Disposing the loader
cancels everything in flight.

# Backends

* [software::SoftwareDevice] runs on the CPU and records every call.  It is what the tests use.
* `WgpuDevice` (feature `backend_wgpu`) runs on [wgpu](https://wgpu.rs).

Devices without compute shaders are supported with a direct, non-staged write.
*/

pub mod bittricks;
pub mod cancellation;
pub mod config;
pub mod device;
pub mod error;
pub mod gate;
pub mod image;
mod imp;
pub mod scheduler;
pub mod software;
pub mod sys;
pub mod upload;
mod wakeup;

pub use cancellation::{CancellationToken, Cancelled};
pub use config::{LoaderConfig, UploadSettings};
pub use device::{
    GraphicsDevice, TextureDescriptor, TextureInfo, TextureLifetime, TextureRegion, mip_levels_for,
};
pub use error::{DecodeError, DeviceError, PreconditionViolation, UploadError};
pub use gate::{AcquireError, AsyncGate, Permit};
pub use image::{DecodedImage, ImageDecoder, PngDecoder};
pub use scheduler::{GraphicsScheduler, GraphicsThread, InlineScheduler};
pub use upload::{TextureLoader, UploadReport, UploadStage};

#[cfg(feature = "backend_wgpu")]
pub use imp::wgpu::{Error as WgpuError, WgpuBlitProgram, WgpuBuffer, WgpuDevice, WgpuTexture};

pub type Priority = async_file::Priority;
