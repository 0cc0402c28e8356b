// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The upload pipeline.

[TextureLoader] streams RGBA8 pixels into textures without stalling the graphics thread.  An
upload of a region goes through these stages:

1. **Queued**: preconditions are checked against the texture.  Nothing on the device is touched
   yet, so a bad request fails here with [UploadError::Precondition].
2. **AcquiringGate**: the loader has exactly one staging buffer, guarded by an
   [AsyncGate].  Concurrent uploads wait here; only the permit holder can see the buffer.
3. **ResizingBuffer**: the staging buffer is grown if it is too small (see [staging]).
4. **CopyingBytes**: the pixels are copied into the staging buffer in time slices (see
   [chunked]), yielding to the host between slices.
5. **Dispatching**: one compute dispatch moves the staged pixels into the texture (see [blit]).
6. **RegeneratingMips**: only for mipmapped textures.
7. **Released**: the permit is dropped and the next waiter proceeds.

Any stage can end in `Cancelled` or `Failed` instead.  The permit is a guard, so it is released
exactly once however the upload ends.

Each call's token is linked with the loader's shutdown token; disposing the loader cancels
every upload in flight.

Devices that can't dispatch compute work skip the staging buffer entirely and write the texture
directly, on the graphics thread.
*/

pub mod blit;
pub mod chunked;
pub mod staging;

pub use blit::{BlitParams, DispatchGrid, WORKGROUP_SIZE};
pub use chunked::CopyStats;
pub use staging::StagingBufferPool;

use crate::Priority;
use crate::cancellation::CancellationToken;
use crate::config::{LoaderConfig, UploadSettings};
use crate::device::{
    GraphicsDevice, TextureDescriptor, TextureLifetime, TextureRegion, mip_levels_for,
};
use crate::error::{DecodeError, PreconditionViolation, UploadError};
use crate::gate::AsyncGate;
use crate::image::{DecodedImage, ImageDecoder, PngDecoder};
use crate::scheduler::{GraphicsScheduler, Reply};
use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Where an upload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStage {
    Queued,
    AcquiringGate,
    ResizingBuffer,
    CopyingBytes,
    Dispatching,
    RegeneratingMips,
    Released,
    Cancelled,
    Failed,
}

impl UploadStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStage::Released | UploadStage::Cancelled | UploadStage::Failed
        )
    }
}

/// What an upload did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes_written: usize,
    pub chunks: usize,
    pub time_slices: usize,
    /// `None` on the direct-write path.
    pub grid: Option<DispatchGrid>,
    /// Staging capacity in elements while the upload ran.
    pub staging_capacity: usize,
    pub staging_grew: bool,
    pub mips_regenerated: bool,
    /// True when the device lacked compute support and the texture was written directly.
    pub direct: bool,
}

type StageObserver = Arc<dyn Fn(u64, UploadStage) + Send + Sync>;

/// Logs stage transitions for one upload and reports them to the observer.
struct StageTracker {
    upload: u64,
    stage: UploadStage,
    observer: Option<StageObserver>,
}

impl StageTracker {
    fn advance(&mut self, stage: UploadStage) {
        logwise::trace_sync!(
            "upload {upload}: {from} -> {to}",
            upload = self.upload,
            from = logwise::privacy::LogIt(&self.stage),
            to = logwise::privacy::LogIt(&stage)
        );
        self.stage = stage;
        if let Some(observer) = &self.observer {
            observer(self.upload, stage);
        }
    }

    fn finish<T>(&mut self, result: &Result<T, UploadError>) {
        match result {
            Ok(_) => self.advance(UploadStage::Released),
            Err(UploadError::Cancelled) => self.advance(UploadStage::Cancelled),
            Err(e) => {
                logwise::warn_sync!(
                    "upload {upload} failed while {stage}: {error}",
                    upload = self.upload,
                    stage = logwise::privacy::LogIt(&self.stage),
                    error = e.to_string()
                );
                self.advance(UploadStage::Failed)
            }
        }
    }
}

/**
Loads and uploads textures through one shared staging buffer.

Construct one per device and share it.  Every method takes `&self`, and concurrent calls are
serialized where they have to be.

```
use std::sync::Arc;
use staged_textures::{CancellationToken, InlineScheduler, LoaderConfig, TextureLoader, TextureRegion};
use staged_textures::software::SoftwareDevice;

let loader = TextureLoader::new(
    Arc::new(SoftwareDevice::new()),
    InlineScheduler,
    LoaderConfig::new().with_initial_staging_capacity_pixels(64),
);
test_executors::spin_on(async {
    let texture = loader.create_texture(2, 2).await.unwrap();
    let report = loader
        .upload_region(&texture, TextureRegion::full(2, 2), vec![255u8; 16], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.bytes_written, 16);
});
```
*/
pub struct TextureLoader<D: GraphicsDevice, S: GraphicsScheduler> {
    device: Arc<D>,
    scheduler: S,
    decoder: Arc<dyn ImageDecoder>,
    settings: Arc<UploadSettings>,
    staging: AsyncGate<StagingBufferPool<D>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    next_upload: AtomicU64,
    observer: Option<StageObserver>,
}

impl<D: GraphicsDevice, S: GraphicsScheduler> TextureLoader<D, S> {
    /// Creates a loader that decodes PNG.  No GPU resources are created until first use.
    pub fn new(device: Arc<D>, scheduler: S, config: LoaderConfig) -> Self {
        TextureLoader {
            device,
            scheduler,
            decoder: Arc::new(PngDecoder::new()),
            settings: Arc::new(UploadSettings::new(&config)),
            staging: AsyncGate::new(StagingBufferPool::new(), "staging buffer"),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            next_upload: AtomicU64::new(1),
            observer: None,
        }
    }

    /// Replaces the image decoder.
    pub fn with_decoder(mut self, decoder: impl ImageDecoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Cancels this loader's work whenever `parent` is cancelled, e.g. at process shutdown.
    pub fn with_shutdown_signal(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = CancellationToken::linked(&self.shutdown, parent);
        self
    }

    /// Calls `observer` with the upload id and each stage an upload enters.
    pub fn with_stage_observer(
        mut self,
        observer: impl Fn(u64, UploadStage) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Live settings.  Changes apply to the next chunk or the next resize.
    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Current staging capacity in elements.  Waits for uploads in flight.
    pub async fn staging_capacity(&self) -> Result<usize, UploadError> {
        let pool = self.staging.acquire(&self.shutdown).await?;
        Ok(pool.capacity())
    }

    fn effective_token(&self, token: &CancellationToken) -> Result<CancellationToken, UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }
        Ok(CancellationToken::linked(token, &self.shutdown))
    }

    /// Loads the blit program and sizes the staging buffer to the configured floor.
    pub async fn prewarm(&self) -> Result<(), UploadError> {
        self.prewarm_pixels(0).await
    }

    /// Like [Self::prewarm], but sized for a `width`x`height` upload.
    pub async fn prewarm_for(&self, width: u32, height: u32) -> Result<(), UploadError> {
        let pixels = width as u64 * height as u64;
        let pixels =
            usize::try_from(pixels).map_err(|_| PreconditionViolation::TooLarge { pixels })?;
        self.prewarm_pixels(pixels).await
    }

    async fn prewarm_pixels(&self, pixels: usize) -> Result<(), UploadError> {
        let token = self.effective_token(&CancellationToken::new())?;
        if !self.device.supports_compute_dispatch() {
            return Ok(());
        }
        let mut pool = self.staging.acquire(&token).await?;
        pool.ensure_capacity(
            &self.device,
            &self.scheduler,
            pixels,
            self.settings.initial_staging_capacity_pixels(),
        )
        .await?;
        Ok(())
    }

    /// Creates a `width`x`height` random-write texture using the loader's texture settings.
    pub async fn create_texture(&self, width: u32, height: u32) -> Result<D::Texture, UploadError> {
        if self.is_disposed() {
            return Err(UploadError::Disposed);
        }
        if width == 0 || height == 0 {
            return Err(PreconditionViolation::EmptyRegion.into());
        }
        let descriptor = self.texture_descriptor(width, height);
        let device = self.device.clone();
        let texture = self
            .scheduler
            .run_on_graphics_thread(move || device.create_texture(&descriptor))
            .await?;
        Ok(texture)
    }

    /// The configured mip count is clamped to the chain the size allows.
    fn texture_descriptor(&self, width: u32, height: u32) -> TextureDescriptor {
        texture_descriptor(
            width,
            height,
            self.settings.texture_mip_count(),
            self.settings.texture_lifetime(),
        )
    }

    /**
    Writes `data` (tightly packed RGBA8 rows) into `region` of `texture`.

    Fails with [UploadError::Precondition] before touching anything if the region doesn't fit the
    target mip, the texture isn't random-write, or `data` is the wrong length.
    */
    pub async fn upload_region(
        &self,
        texture: &D::Texture,
        region: TextureRegion,
        data: impl Into<Arc<[u8]>>,
        token: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let data = data.into();
        let mut tracker = StageTracker {
            upload: self.next_upload.fetch_add(1, Ordering::Relaxed),
            stage: UploadStage::Queued,
            observer: self.observer.clone(),
        };
        if let Some(observer) = &tracker.observer {
            observer(tracker.upload, UploadStage::Queued);
        }
        let result = self
            .upload_region_tracked(texture, region, data, token, &mut tracker)
            .await;
        tracker.finish(&result);
        result
    }

    async fn upload_region_tracked(
        &self,
        texture: &D::Texture,
        region: TextureRegion,
        data: Arc<[u8]>,
        token: &CancellationToken,
        tracker: &mut StageTracker,
    ) -> Result<UploadReport, UploadError> {
        let token = self.effective_token(token)?;
        let info = self.device.texture_info(texture);
        region.validate(&info, data.len())?;
        token.check()?;

        if !self.device.supports_compute_dispatch() {
            return self.upload_direct(texture, region, data, &token, tracker).await;
        }

        tracker.advance(UploadStage::AcquiringGate);
        let mut pool = self.staging.acquire(&token).await?;
        token.check()?;

        tracker.advance(UploadStage::ResizingBuffer);
        //validate() proved the byte length fits in usize
        let pixels = region.pixel_count() as usize;
        let staging = pool
            .ensure_capacity(
                &self.device,
                &self.scheduler,
                pixels,
                self.settings.initial_staging_capacity_pixels(),
            )
            .await?;
        token.check()?;

        tracker.advance(UploadStage::CopyingBytes);
        let stats = chunked::copy(
            &self.device,
            &self.scheduler,
            &self.settings,
            &staging.buffer,
            &data,
            &token,
        )
        .await?;

        tracker.advance(UploadStage::Dispatching);
        let (_, level_height) = info.level_size(region.mip_level);
        let grid = blit::dispatch(
            &self.device,
            &self.scheduler,
            staging.program,
            texture.clone(),
            staging.buffer,
            BlitParams::new(&region, level_height),
        )
        .await?;

        let mips_regenerated = if info.mip_count > 1 && self.settings.regenerate_mips() {
            self.scheduler.yield_control().await;
            token.check()?;
            tracker.advance(UploadStage::RegeneratingMips);
            self.regenerate_mips(texture).await?;
            true
        } else {
            false
        };
        drop(pool);

        Ok(UploadReport {
            bytes_written: stats.bytes_written,
            chunks: stats.chunks,
            time_slices: stats.time_slices,
            grid: Some(grid),
            staging_capacity: staging.capacity,
            staging_grew: staging.grew,
            mips_regenerated,
            direct: false,
        })
    }

    async fn upload_direct(
        &self,
        texture: &D::Texture,
        region: TextureRegion,
        data: Arc<[u8]>,
        token: &CancellationToken,
        tracker: &mut StageTracker,
    ) -> Result<UploadReport, UploadError> {
        tracker.advance(UploadStage::CopyingBytes);
        let bytes_written = data.len();
        let device = self.device.clone();
        let target = texture.clone();
        self.scheduler
            .run_on_graphics_thread(move || device.write_texture(&target, &region, &data))
            .await?;
        let info = self.device.texture_info(texture);
        let mips_regenerated = if info.mip_count > 1 && self.settings.regenerate_mips() {
            self.scheduler.yield_control().await;
            token.check()?;
            tracker.advance(UploadStage::RegeneratingMips);
            self.regenerate_mips(texture).await?;
            true
        } else {
            false
        };
        Ok(UploadReport {
            bytes_written,
            chunks: 1,
            time_slices: 1,
            grid: None,
            staging_capacity: 0,
            staging_grew: false,
            mips_regenerated,
            direct: true,
        })
    }

    async fn regenerate_mips(&self, texture: &D::Texture) -> Result<(), UploadError> {
        let device = self.device.clone();
        let texture = texture.clone();
        self.scheduler
            .run_on_graphics_thread(move || device.generate_mips(&texture))
            .await?;
        Ok(())
    }

    /**
    Decodes `bytes`, creates a texture the size of the image and uploads it.

    Decoding happens on a background thread.  On devices without compute support the whole
    decode-create-write sequence runs as one job on the graphics thread instead.

    If the upload fails, the texture is released before the error is returned.
    */
    pub async fn load_texture(
        &self,
        bytes: impl Into<Arc<[u8]>>,
        token: &CancellationToken,
    ) -> Result<D::Texture, UploadError> {
        self.load_from_source(Box::new(Cursor::new(bytes.into())), token)
            .await
    }

    /// Like [Self::load_texture], reading the compressed image from `reader`.
    ///
    /// The reader is consumed off the calling thread.
    pub async fn load_texture_from_reader(
        &self,
        reader: impl Read + Send + 'static,
        token: &CancellationToken,
    ) -> Result<D::Texture, UploadError> {
        self.load_from_source(Box::new(reader), token).await
    }

    /// Like [Self::load_texture], reading the file at `path`.
    pub async fn load_texture_from_path(
        &self,
        path: &Path,
        priority: Priority,
        token: &CancellationToken,
    ) -> Result<D::Texture, UploadError> {
        let token = self.effective_token(token)?;
        let file = async_file::File::open(path, priority)
            .await
            .map_err(file_error)?;
        token.check()?;
        let data = file.read_all(priority).await.map_err(file_error)?;
        let bytes: Arc<[u8]> = Arc::from(&*data);
        logwise::trace_sync!(
            "read {len} bytes from {path}",
            len = bytes.len(),
            path = path.to_string_lossy().into_owned()
        );
        self.load_texture(bytes, &token).await
    }

    async fn load_from_source(
        &self,
        source: Box<dyn Read + Send>,
        token: &CancellationToken,
    ) -> Result<D::Texture, UploadError> {
        let token = self.effective_token(token)?;
        if !self.device.supports_compute_dispatch() {
            return self.load_blocking(source, token).await;
        }
        let image = self.decode_in_background(source, &token).await?;
        token.check()?;
        let (width, height) = (image.width(), image.height());
        let texture = self.create_texture(width, height).await?;
        let uploaded = self
            .upload_region(
                &texture,
                TextureRegion::full(width, height),
                image.into_pixels(),
                &token,
            )
            .await;
        match uploaded {
            Ok(_) => Ok(texture),
            Err(e) => {
                let device = self.device.clone();
                self.scheduler
                    .run_on_graphics_thread(move || device.release_texture(texture))
                    .await;
                Err(e)
            }
        }
    }

    async fn decode_in_background(
        &self,
        mut source: Box<dyn Read + Send>,
        token: &CancellationToken,
    ) -> Result<DecodedImage, UploadError> {
        let (s, r) = r#continue::continuation();
        let reply = Reply::new(s, decode_thread_lost);
        let decoder = self.decoder.clone();
        let decode_token = token.clone();
        std::thread::Builder::new()
            .name("texture_decode".to_string())
            .spawn(move || {
                let _decode = logwise::perfwarn_begin!("texture_decode");
                let decoded = panic::catch_unwind(AssertUnwindSafe(|| {
                    decoder.decode(&mut source, &decode_token)
                }));
                reply.send(decoded.unwrap_or_else(|_| {
                    logwise::error_sync!("image decoder panicked");
                    Err(DecodeError::Malformed("decoder panicked".to_string()))
                }));
            })
            .map_err(DecodeError::Io)?;
        Ok(r.await?)
    }

    /// Decode, create and write in a single graphics-thread job.
    async fn load_blocking(
        &self,
        mut source: Box<dyn Read + Send>,
        token: CancellationToken,
    ) -> Result<D::Texture, UploadError> {
        logwise::trace_sync!("no compute dispatch; loading synchronously");
        let device = self.device.clone();
        let decoder = self.decoder.clone();
        let mip_count = self.settings.texture_mip_count();
        let lifetime = self.settings.texture_lifetime();
        let regenerate = self.settings.regenerate_mips();
        self.scheduler
            .run_on_graphics_thread(move || -> Result<D::Texture, UploadError> {
                let image = decoder.decode(&mut source, &token)?;
                let descriptor =
                    texture_descriptor(image.width(), image.height(), mip_count, lifetime);
                let texture = device.create_texture(&descriptor)?;
                let region = TextureRegion::full(image.width(), image.height());
                let mut written = device.write_texture(&texture, &region, image.pixels());
                if written.is_ok() && descriptor.mip_count > 1 && regenerate {
                    written = device.generate_mips(&texture);
                }
                match written {
                    Ok(()) => Ok(texture),
                    Err(e) => {
                        device.release_texture(texture);
                        Err(UploadError::from(e))
                    }
                }
            })
            .await
    }

    /**
    Shuts the loader down.

    Cancels every upload in flight, waits for the staging buffer to be handed back, disposes it
    on the graphics thread, and closes the gate so later calls fail with
    [UploadError::Disposed].  Calling it again does nothing.
    */
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        logwise::info_sync!("disposing texture loader");
        self.shutdown.cancel();
        //in-flight uploads unwind promptly now; wait for the permit with a token nobody cancels
        match self.staging.acquire(&CancellationToken::new()).await {
            Ok(mut pool) => {
                pool.release_resources(&self.device, &self.scheduler).await;
            }
            Err(e) => {
                logwise::warn_sync!(
                    "staging gate unavailable during dispose: {e}",
                    e = logwise::privacy::LogIt(&e)
                );
            }
        }
        self.staging.close();
    }
}

fn texture_descriptor(
    width: u32,
    height: u32,
    mip_count: u32,
    lifetime: TextureLifetime,
) -> TextureDescriptor {
    TextureDescriptor::new(width, height, "loaded texture")
        .with_mip_count(mip_count.min(mip_levels_for(width, height)))
        .with_lifetime(lifetime)
}

fn decode_thread_lost() -> Result<DecodedImage, DecodeError> {
    Err(DecodeError::Io(std::io::Error::other("decode thread exited without a result")))
}

fn file_error(e: impl Debug) -> UploadError {
    UploadError::Decode(DecodeError::Io(std::io::Error::other(format!("{e:?}"))))
}

impl<D: GraphicsDevice, S: GraphicsScheduler> Drop for TextureLoader<D, S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let (buffer, program) = self.staging.get_mut().take_resources();
        drop(program);
        if let Some(buffer) = buffer {
            let device = self.device.clone();
            self.scheduler
                .begin(Box::new(move || device.dispose_buffer(buffer)));
        }
    }
}

impl<D: GraphicsDevice, S: GraphicsScheduler> Debug for TextureLoader<D, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureLoader")
            .field("settings", &self.settings)
            .field("staging", &self.staging)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
