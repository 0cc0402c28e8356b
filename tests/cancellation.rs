// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Cancellation and disposal never leave the staging gate held.

use staged_textures::scheduler::{GraphicsJob, YieldNow};
use staged_textures::software::{DeviceEvent, SoftwareDevice};
use staged_textures::{
    CancellationToken, GraphicsScheduler, InlineScheduler, LoaderConfig, TextureLoader,
    TextureRegion, UploadError,
};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use test_executors::async_test;

/// Inline scheduler that cancels `token` on the `after`th yield.
struct CancelOnYield {
    yields: AtomicUsize,
    after: usize,
    token: CancellationToken,
}

impl GraphicsScheduler for CancelOnYield {
    fn begin(&self, job: GraphicsJob) {
        job()
    }

    fn is_graphics_thread(&self) -> bool {
        true
    }

    fn yield_control(&self) -> impl Future<Output = ()> + Send {
        async move {
            if self.yields.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.token.cancel();
            }
            YieldNow::new().await;
        }
    }
}

fn count(device: &SoftwareDevice, f: impl Fn(&DeviceEvent) -> bool) -> usize {
    device.events().iter().filter(|e| f(e)).count()
}

fn slow_config() -> LoaderConfig {
    LoaderConfig::new()
        .with_initial_staging_capacity_pixels(16)
        .with_chunk_byte_size(4)
        .with_upload_time_slice_millis(0.0)
}

#[async_test]
async fn cancelled_before_start() {
    let loader = TextureLoader::new(
        Arc::new(SoftwareDevice::new()),
        InlineScheduler,
        LoaderConfig::new().with_initial_staging_capacity_pixels(16),
    );
    let texture = loader.create_texture(4, 4).await.unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let r = loader
        .upload_region(&texture, TextureRegion::full(4, 4), vec![7u8; 64], &token)
        .await;
    assert!(matches!(r, Err(UploadError::Cancelled)));
    assert_eq!(
        count(loader.device(), |e| matches!(e, DeviceEvent::Dispatch { .. })),
        0
    );
    //the gate is free for the next caller
    assert_eq!(loader.staging_capacity().await.unwrap(), 0);
    loader
        .upload_region(
            &texture,
            TextureRegion::full(4, 4),
            vec![7u8; 64],
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

#[test]
fn cancelled_between_slices() {
    let token = CancellationToken::new();
    let scheduler = CancelOnYield {
        yields: AtomicUsize::new(0),
        after: 5,
        token: token.clone(),
    };
    let loader = TextureLoader::new(Arc::new(SoftwareDevice::new()), scheduler, slow_config());
    test_executors::spin_on(async {
        let texture = loader.create_texture(4, 4).await.unwrap();
        let r = loader
            .upload_region(&texture, TextureRegion::full(4, 4), vec![9u8; 64], &token)
            .await;
        assert!(matches!(r, Err(UploadError::Cancelled)));
        //one chunk per slice, one slice before each yield
        assert_eq!(
            count(loader.device(), |e| matches!(e, DeviceEvent::StagingWrite { .. })),
            5
        );
        assert_eq!(
            count(loader.device(), |e| matches!(e, DeviceEvent::Dispatch { .. })),
            0
        );
        assert_eq!(loader.staging_capacity().await.unwrap(), 16);

        let report = loader
            .upload_region(
                &texture,
                TextureRegion::full(4, 4),
                vec![9u8; 64],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.chunks, 16);
        assert!(!report.staging_grew);
    });
}

#[test]
fn cancelled_waiter_leaves_the_gate_alone() {
    let loader = TextureLoader::new(Arc::new(SoftwareDevice::new()), InlineScheduler, slow_config());
    test_executors::spin_on(async {
        let a = loader.create_texture(4, 4).await.unwrap();
        let b = loader.create_texture(4, 4).await.unwrap();
        let a_token = CancellationToken::new();
        let b_token = CancellationToken::new();
        let cancel_b = async {
            YieldNow::new().await;
            b_token.cancel();
        };
        let (ra, rb, ()) = futures::future::join3(
            loader.upload_region(&a, TextureRegion::full(4, 4), vec![1u8; 64], &a_token),
            loader.upload_region(&b, TextureRegion::full(4, 4), vec![2u8; 64], &b_token),
            cancel_b,
        )
        .await;
        assert_eq!(ra.unwrap().chunks, 16);
        assert!(matches!(rb, Err(UploadError::Cancelled)));
        assert_eq!(a.texel(3, 3, 0), [1, 1, 1, 1]);
        assert_eq!(b.texel(0, 0, 0), [0, 0, 0, 0]);
        assert_eq!(
            count(loader.device(), |e| matches!(e, DeviceEvent::Dispatch { .. })),
            1
        );
    });
}

#[test]
fn dispose_unblocks_everyone() {
    let loader = TextureLoader::new(Arc::new(SoftwareDevice::new()), InlineScheduler, slow_config());
    test_executors::spin_on(async {
        let a = loader.create_texture(4, 4).await.unwrap();
        let b = loader.create_texture(4, 4).await.unwrap();
        let token = CancellationToken::new();
        let dispose = async {
            YieldNow::new().await;
            loader.dispose().await;
        };
        let (ra, rb, ()) = futures::future::join3(
            loader.upload_region(&a, TextureRegion::full(4, 4), vec![1u8; 64], &token),
            loader.upload_region(&b, TextureRegion::full(4, 4), vec![2u8; 64], &token),
            dispose,
        )
        .await;
        assert!(matches!(ra, Err(UploadError::Cancelled)));
        assert!(matches!(rb, Err(UploadError::Cancelled | UploadError::Disposed)));
        assert!(!token.is_cancelled());
        assert!(loader.is_disposed());
        assert_eq!(loader.device().live_buffers(), 0);

        let r = loader
            .upload_region(&a, TextureRegion::full(4, 4), vec![1u8; 64], &token)
            .await;
        assert!(matches!(r, Err(UploadError::Disposed)));
        let r = loader.load_texture(vec![0u8; 8], &token).await;
        assert!(matches!(r, Err(UploadError::Disposed)));
        assert!(matches!(
            loader.create_texture(1, 1).await,
            Err(UploadError::Disposed)
        ));
    });
}

#[test]
fn shutdown_signal_reaches_uploads_in_flight() {
    let shutdown = CancellationToken::new();
    let token = CancellationToken::new();
    let scheduler = CancelOnYield {
        yields: AtomicUsize::new(0),
        after: 2,
        token: shutdown.clone(),
    };
    let loader = TextureLoader::new(Arc::new(SoftwareDevice::new()), scheduler, slow_config())
        .with_shutdown_signal(&shutdown);
    test_executors::spin_on(async {
        let texture = loader.create_texture(4, 4).await.unwrap();
        let r = loader
            .upload_region(&texture, TextureRegion::full(4, 4), vec![3u8; 64], &token)
            .await;
        assert!(matches!(r, Err(UploadError::Cancelled)));
        assert!(!token.is_cancelled());
    });
}
