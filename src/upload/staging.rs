// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The loader's one staging buffer.

The pool lives inside the loader's [crate::gate::AsyncGate], so only the permit holder can see
the buffer, resize it or write to it.  The buffer only ever grows: when a request needs more
elements than the current buffer holds, the old buffer is disposed and a larger one is created,
sized to the next power of two at or above the request and never below the configured floor.
*/

use crate::bittricks::{ELEMENT_BYTES, staging_capacity_for};
use crate::device::GraphicsDevice;
use crate::error::{PreconditionViolation, UploadError};
use crate::scheduler::GraphicsScheduler;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

struct StagingBuffer<B> {
    handle: B,
    /// In elements.
    capacity: usize,
}

/// What an upload needs from the pool to copy and dispatch.
pub(crate) struct EnsuredStaging<D: GraphicsDevice> {
    pub buffer: D::Buffer,
    pub program: D::BlitProgram,
    pub capacity: usize,
    pub grew: bool,
}

/// Owns the staging buffer and the blit program.
pub struct StagingBufferPool<D: GraphicsDevice> {
    buffer: Option<StagingBuffer<D::Buffer>>,
    program: Option<D::BlitProgram>,
    growth_count: u64,
}

impl<D: GraphicsDevice> StagingBufferPool<D> {
    pub(crate) fn new() -> Self {
        StagingBufferPool {
            buffer: None,
            program: None,
            growth_count: 0,
        }
    }

    /// Current capacity in elements, or 0 before the first allocation.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map(|b| b.capacity).unwrap_or(0)
    }

    /// How many times a buffer has been (re)allocated.
    pub fn growth_count(&self) -> u64 {
        self.growth_count
    }

    pub fn is_program_loaded(&self) -> bool {
        self.program.is_some()
    }

    /**
    Makes sure the buffer holds at least `required` elements, loading the blit program first if
    needed.

    `initial` is the floor for a new allocation.  Nothing is reallocated when the current buffer
    is already large enough.
    */
    pub(crate) async fn ensure_capacity<S: GraphicsScheduler>(
        &mut self,
        device: &Arc<D>,
        scheduler: &S,
        required: usize,
        initial: usize,
    ) -> Result<EnsuredStaging<D>, UploadError> {
        let program = match &self.program {
            Some(program) => program.clone(),
            None => {
                let load_device = device.clone();
                let program = scheduler
                    .run_on_graphics_thread(move || load_device.load_blit_program())
                    .await?;
                logwise::info_sync!("blit program loaded");
                self.program = Some(program.clone());
                program
            }
        };

        if let Some(existing) = &self.buffer {
            if existing.capacity >= required {
                return Ok(EnsuredStaging {
                    buffer: existing.handle.clone(),
                    program,
                    capacity: existing.capacity,
                    grew: false,
                });
            }
        }

        let too_large = || PreconditionViolation::TooLarge {
            pixels: required as u64,
        };
        let capacity = staging_capacity_for(required, initial).ok_or_else(too_large)?;
        capacity.checked_mul(ELEMENT_BYTES).ok_or_else(too_large)?;

        let old = self.buffer.take();
        let old_capacity = old.as_ref().map(|b| b.capacity).unwrap_or(0);
        let create_device = device.clone();
        //dispose and create in one job; the old buffer is gone even if creation fails
        let handle = scheduler
            .run_on_graphics_thread(move || {
                if let Some(old) = old {
                    create_device.dispose_buffer(old.handle);
                }
                create_device.create_staging_buffer(capacity)
            })
            .await?;
        self.growth_count += 1;
        logwise::info_sync!(
            "staging buffer grew from {old} to {new} elements",
            old = old_capacity,
            new = capacity
        );
        self.buffer = Some(StagingBuffer {
            handle: handle.clone(),
            capacity,
        });
        Ok(EnsuredStaging {
            buffer: handle,
            program,
            capacity,
            grew: true,
        })
    }

    /// Disposes the buffer and forgets the program, on the graphics thread.
    pub(crate) async fn release_resources<S: GraphicsScheduler>(
        &mut self,
        device: &Arc<D>,
        scheduler: &S,
    ) {
        let (buffer, program) = self.take_resources();
        drop(program);
        if let Some(buffer) = buffer {
            let device = device.clone();
            scheduler
                .run_on_graphics_thread(move || device.dispose_buffer(buffer))
                .await;
        }
    }

    /// Empties the pool without touching the device.
    pub(crate) fn take_resources(&mut self) -> (Option<D::Buffer>, Option<D::BlitProgram>) {
        (self.buffer.take().map(|b| b.handle), self.program.take())
    }
}

impl<D: GraphicsDevice> Debug for StagingBufferPool<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBufferPool")
            .field("capacity", &self.capacity())
            .field("growth_count", &self.growth_count)
            .field("program_loaded", &self.program.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::InlineScheduler;
    use crate::software::{DeviceEvent, SoftwareDevice};

    #[test]
    fn grows_to_power_of_two_and_never_shrinks() {
        let device = Arc::new(SoftwareDevice::new());
        let mut pool = StagingBufferPool::<SoftwareDevice>::new();
        let s = InlineScheduler;
        test_executors::spin_on(async {
            let first = pool.ensure_capacity(&device, &s, 100, 16).await.unwrap();
            assert_eq!(first.capacity, 128);
            assert!(first.grew);

            let smaller = pool.ensure_capacity(&device, &s, 10, 16).await.unwrap();
            assert_eq!(smaller.capacity, 128);
            assert!(!smaller.grew);

            let bigger = pool.ensure_capacity(&device, &s, 129, 16).await.unwrap();
            assert_eq!(bigger.capacity, 256);
            assert!(bigger.grew);
        });
        assert_eq!(pool.capacity(), 256);
        assert_eq!(pool.growth_count(), 2);

        let events = device.events();
        let loads = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::ProgramLoaded))
            .count();
        assert_eq!(loads, 1);
        let disposed = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::BufferDisposed { .. }))
            .count();
        assert_eq!(disposed, 1);
        assert_eq!(device.live_buffers(), 1);
    }

    #[test]
    fn floor_applies() {
        let device = Arc::new(SoftwareDevice::new());
        let mut pool = StagingBufferPool::<SoftwareDevice>::new();
        let ensured = test_executors::spin_on(pool.ensure_capacity(
            &device,
            &InlineScheduler,
            3,
            1024,
        ))
        .unwrap();
        assert_eq!(ensured.capacity, 1024);
    }

    #[test]
    fn release_disposes() {
        let device = Arc::new(SoftwareDevice::new());
        let mut pool = StagingBufferPool::<SoftwareDevice>::new();
        test_executors::spin_on(async {
            pool.ensure_capacity(&device, &InlineScheduler, 8, 8)
                .await
                .unwrap();
            pool.release_resources(&device, &InlineScheduler).await;
        });
        assert_eq!(pool.capacity(), 0);
        assert!(!pool.is_program_loaded());
        assert_eq!(device.live_buffers(), 0);
    }
}
