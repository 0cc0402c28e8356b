// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Every device call made by the loader lands on the graphics thread.

use staged_textures::software::{SoftwareBlitProgram, SoftwareBuffer, SoftwareDevice, SoftwareTexture};
use staged_textures::upload::{BlitParams, DispatchGrid};
use staged_textures::{
    CancellationToken, DecodeError, DecodedImage, DeviceError, GraphicsDevice, GraphicsThread,
    ImageDecoder, LoaderConfig, TextureDescriptor, TextureInfo, TextureLoader, TextureRegion,
    UploadError,
};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

fn encode_png(width: u32, height: u32, rgba: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(rgba).unwrap();
    }
    out
}

fn threaded_loader(config: LoaderConfig) -> TextureLoader<SoftwareDevice, GraphicsThread> {
    let graphics = GraphicsThread::spawn("graphics").unwrap();
    let device = Arc::new(SoftwareDevice::new());
    device.set_graphics_thread(graphics.thread_id());
    TextureLoader::new(device, graphics, config)
}

#[test]
fn uploads_stay_on_the_graphics_thread() {
    let loader = threaded_loader(
        LoaderConfig::new()
            .with_initial_staging_capacity_pixels(64)
            .with_chunk_byte_size(256)
            .with_texture_mip_count(3),
    );
    test_executors::spin_on(async {
        loader.prewarm().await.unwrap();
        let texture = loader.create_texture(32, 16).await.unwrap();
        let data: Vec<u8> = (0..32 * 16 * 4).map(|i| (i % 251) as u8).collect();
        let report = loader
            .upload_region(
                &texture,
                TextureRegion::full(32, 16),
                data.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(report.mips_regenerated);
        assert!(report.staging_grew);
        assert_eq!(loader.device().read_texture(&texture, 0), data);

        let png = encode_png(8, 8, &[0u8, 128, 255, 255].repeat(64));
        let loaded = loader
            .load_texture(png, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loaded.texel(7, 7, 0), [0, 128, 255, 255]);
        assert_eq!(loaded.texel(0, 0, 2), [0, 128, 255, 255]);

        loader.dispose().await;
    });
    assert_eq!(loader.device().live_buffers(), 0);
    assert_eq!(loader.device().off_thread_calls(), 0);
}

#[test]
fn cancel_from_a_timer() {
    let loader = threaded_loader(
        LoaderConfig::new()
            .with_initial_staging_capacity_pixels(16)
            .with_chunk_byte_size(4)
            .with_upload_time_slice_millis(0.0),
    );
    let token = CancellationToken::new();
    let (r, ()) = test_executors::spin_on(async {
        loader.prewarm_for(256, 256).await.unwrap();
        let texture = loader.create_texture(256, 256).await.unwrap();
        futures::future::join(
            loader.upload_region(
                &texture,
                TextureRegion::full(256, 256),
                vec![5u8; 256 * 256 * 4],
                &token,
            ),
            async {
                portable_async_sleep::async_sleep(Duration::from_millis(1)).await;
                token.cancel();
            },
        )
        .await
    });
    assert!(matches!(r, Err(UploadError::Cancelled)));
    //the gate came back
    let capacity = test_executors::spin_on(loader.staging_capacity()).unwrap();
    assert_eq!(capacity, 65536);
    assert_eq!(loader.device().off_thread_calls(), 0);
}

#[test]
fn dropping_the_loader_frees_the_buffer() {
    let loader = threaded_loader(LoaderConfig::new().with_initial_staging_capacity_pixels(16));
    let device = loader.device().clone();
    test_executors::spin_on(loader.prewarm()).unwrap();
    assert_eq!(device.live_buffers(), 1);
    //joins the graphics thread after the disposal job runs
    drop(loader);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.off_thread_calls(), 0);
}

/// A software device whose staging writes blow up.
struct Fragile(SoftwareDevice);

impl GraphicsDevice for Fragile {
    type Texture = SoftwareTexture;
    type Buffer = SoftwareBuffer;
    type BlitProgram = SoftwareBlitProgram;

    fn supports_compute_dispatch(&self) -> bool {
        self.0.supports_compute_dispatch()
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<SoftwareTexture, DeviceError> {
        self.0.create_texture(descriptor)
    }

    fn texture_info(&self, texture: &SoftwareTexture) -> TextureInfo {
        self.0.texture_info(texture)
    }

    fn release_texture(&self, texture: SoftwareTexture) {
        self.0.release_texture(texture)
    }

    fn write_texture(
        &self,
        texture: &SoftwareTexture,
        region: &TextureRegion,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.0.write_texture(texture, region, bytes)
    }

    fn generate_mips(&self, texture: &SoftwareTexture) -> Result<(), DeviceError> {
        self.0.generate_mips(texture)
    }

    fn load_blit_program(&self) -> Result<SoftwareBlitProgram, DeviceError> {
        self.0.load_blit_program()
    }

    fn create_staging_buffer(&self, elements: usize) -> Result<SoftwareBuffer, DeviceError> {
        self.0.create_staging_buffer(elements)
    }

    fn dispose_buffer(&self, buffer: SoftwareBuffer) {
        self.0.dispose_buffer(buffer)
    }

    fn write_staging(
        &self,
        _buffer: &SoftwareBuffer,
        _byte_offset: usize,
        _byte_len: usize,
        _fill: &mut dyn FnMut(&mut [u8]),
    ) -> Result<(), DeviceError> {
        panic!("staging write failed")
    }

    fn dispatch_blit(
        &self,
        program: &SoftwareBlitProgram,
        texture: &SoftwareTexture,
        buffer: &SoftwareBuffer,
        params: &BlitParams,
        grid: DispatchGrid,
    ) -> Result<(), DeviceError> {
        self.0.dispatch_blit(program, texture, buffer, params, grid)
    }
}

#[test]
fn panicking_device_releases_the_gate() {
    let graphics = GraphicsThread::spawn("graphics").unwrap();
    let inner = SoftwareDevice::new();
    inner.set_graphics_thread(graphics.thread_id());
    let loader = TextureLoader::new(
        Arc::new(Fragile(inner)),
        graphics,
        LoaderConfig::new().with_initial_staging_capacity_pixels(16),
    );
    let texture = test_executors::spin_on(loader.create_texture(4, 4)).unwrap();
    let r = panic::catch_unwind(AssertUnwindSafe(|| {
        test_executors::spin_on(loader.upload_region(
            &texture,
            TextureRegion::full(4, 4),
            vec![1u8; 64],
            &CancellationToken::new(),
        ))
    }));
    assert!(r.is_err());
    //the gate and the graphics thread both survived
    let capacity = test_executors::spin_on(loader.staging_capacity()).unwrap();
    assert_eq!(capacity, 16);
    test_executors::spin_on(loader.dispose());
    assert_eq!(loader.device().0.live_buffers(), 0);
    assert_eq!(loader.device().0.off_thread_calls(), 0);
}

struct PanickingDecoder;

impl ImageDecoder for PanickingDecoder {
    fn decode(
        &self,
        _stream: &mut dyn Read,
        _token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError> {
        panic!("corrupt image")
    }
}

#[test]
fn panicking_decoder_is_a_decode_error() {
    let loader = threaded_loader(LoaderConfig::new()).with_decoder(PanickingDecoder);
    let r = test_executors::spin_on(loader.load_texture(vec![0u8; 16], &CancellationToken::new()));
    assert!(matches!(r, Err(UploadError::Decode(DecodeError::Malformed(_)))));
    assert_eq!(loader.device().live_textures(), 0);
    test_executors::spin_on(loader.dispose());
    assert_eq!(loader.device().live_buffers(), 0);
}
