// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Time-sliced copy of pixel bytes into the staging buffer.

The copy is a sequence of *slices*.  Each slice is one job on the graphics thread that writes
chunks of at most `chunk_byte_size` bytes, one begin/end sub-range write per chunk, until the
bytes run out or the slice budget is spent.  A slice always writes at least one chunk, so every
resumption makes progress.  Between slices we yield to the host.

The token is checked before every chunk and after every yield.  After the last chunk there is
one more unconditional yield before the caller dispatches.

Offsets stay multiples of 4 because chunk sizes are.  Only the final chunk can end mid-element;
its tail is padded with zeros.
*/

use crate::bittricks::align_to_element;
use crate::cancellation::CancellationToken;
use crate::config::UploadSettings;
use crate::device::GraphicsDevice;
use crate::error::UploadError;
use crate::scheduler::GraphicsScheduler;
use crate::sys::time::Instant;
use std::sync::Arc;

/// Counters for one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyStats {
    pub bytes_written: usize,
    pub chunks: usize,
    /// Graphics-thread jobs used.
    pub time_slices: usize,
}

struct SliceProgress {
    offset: usize,
    chunks: usize,
}

/// Copies `data` into the front of `buffer`.
pub(crate) async fn copy<D: GraphicsDevice, S: GraphicsScheduler>(
    device: &Arc<D>,
    scheduler: &S,
    settings: &Arc<UploadSettings>,
    buffer: &D::Buffer,
    data: &Arc<[u8]>,
    token: &CancellationToken,
) -> Result<CopyStats, UploadError> {
    let mut stats = CopyStats::default();
    let mut offset = 0;
    while offset < data.len() {
        if stats.time_slices > 0 {
            scheduler.yield_control().await;
        }
        token.check()?;
        let (slice_device, slice_buffer, slice_data, slice_settings, slice_token) = (
            device.clone(),
            buffer.clone(),
            data.clone(),
            settings.clone(),
            token.clone(),
        );
        let progress = scheduler
            .run_on_graphics_thread(move || {
                write_slice(
                    &*slice_device,
                    &slice_buffer,
                    &slice_data,
                    offset,
                    &slice_settings,
                    &slice_token,
                )
            })
            .await?;
        offset = progress.offset;
        stats.chunks += progress.chunks;
        stats.time_slices += 1;
    }
    stats.bytes_written = offset;
    //let the writes flush before anyone dispatches against them
    scheduler.yield_control().await;
    token.check()?;
    Ok(stats)
}

/// One slice.  Runs on the graphics thread.
fn write_slice<D: GraphicsDevice>(
    device: &D,
    buffer: &D::Buffer,
    data: &[u8],
    start: usize,
    settings: &UploadSettings,
    token: &CancellationToken,
) -> Result<SliceProgress, UploadError> {
    let budget = settings.time_slice();
    let started = Instant::now();
    let _slice = logwise::perfwarn_begin!("staging copy time slice");
    let mut offset = start;
    let mut chunks = 0;
    loop {
        token.check()?;
        let len = (data.len() - offset).min(settings.chunk_byte_size());
        let source = &data[offset..offset + len];
        device.write_staging(buffer, offset, align_to_element(len), &mut |dst: &mut [u8]| {
            let (body, pad) = dst.split_at_mut(len);
            body.copy_from_slice(source);
            pad.fill(0);
        })?;
        offset += len;
        chunks += 1;
        if offset == data.len() || started.elapsed() >= budget {
            break;
        }
    }
    Ok(SliceProgress { offset, chunks })
}
