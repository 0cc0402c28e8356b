// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The compute blit from the staging buffer into a texture region.

The staging buffer holds the region's pixels as tightly packed rows of 32-bit words.  The blit
program runs one invocation per destination texel on an 8x8 workgroup tiling; invocation
`(x, y)` reads word `y * width + x` and writes texel `(x_offset + x, y_offset + y)` on the
target mip.  Invocations outside the region do nothing, so the grid may overhang.
*/

use crate::device::GraphicsDevice;
use crate::device::TextureRegion;
use crate::error::DeviceError;
use crate::scheduler::GraphicsScheduler;
use std::sync::Arc;

/// Edge length of the square workgroup the blit program is compiled for.
pub const WORKGROUP_SIZE: u32 = 8;

/// Scalar parameters of one blit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlitParams {
    pub x_offset: u32,
    pub y_offset: u32,
    pub width: u32,
    pub height: u32,
    pub mip_level: u32,
    /// Full height of the target mip level, for backends that address rows from the bottom.
    pub texture_height: u32,
}

impl BlitParams {
    pub fn new(region: &TextureRegion, texture_height: u32) -> Self {
        BlitParams {
            x_offset: region.x_offset,
            y_offset: region.y_offset,
            width: region.width,
            height: region.height,
            mip_level: region.mip_level,
            texture_height,
        }
    }

    /// Number of staging words the blit reads.
    pub fn words(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Workgroup counts for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchGrid {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl DispatchGrid {
    /// The smallest grid of 8x8 workgroups covering `width`x`height`.
    pub fn covering(width: u32, height: u32) -> Self {
        DispatchGrid {
            x: width.div_ceil(WORKGROUP_SIZE),
            y: height.div_ceil(WORKGROUP_SIZE),
            z: 1,
        }
    }

    /// Invocations along each axis.
    pub fn invocations(&self) -> (u64, u64) {
        (
            self.x as u64 * WORKGROUP_SIZE as u64,
            self.y as u64 * WORKGROUP_SIZE as u64,
        )
    }
}

/// Issues exactly one blit for a staged region, on the graphics thread.
pub(crate) async fn dispatch<D: GraphicsDevice, S: GraphicsScheduler>(
    device: &Arc<D>,
    scheduler: &S,
    program: D::BlitProgram,
    texture: D::Texture,
    buffer: D::Buffer,
    params: BlitParams,
) -> Result<DispatchGrid, DeviceError> {
    let grid = DispatchGrid::covering(params.width, params.height);
    logwise::trace_sync!(
        "blit dispatch {params} grid {grid}",
        params = logwise::privacy::LogIt(&params),
        grid = logwise::privacy::LogIt(&grid)
    );
    let device = device.clone();
    scheduler
        .run_on_graphics_thread(move || {
            device.dispatch_blit(&program, &texture, &buffer, &params, grid)
        })
        .await?;
    Ok(grid)
}
