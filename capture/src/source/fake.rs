use async_trait::async_trait;
use frame_verdict_common::frame::Still;
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::still::encode_jpeg;
use super::{FrameSource, LatestImage, SourceError, SourceStatus};

const PALETTE: [[u8; 3]; 4] = [[220, 60, 60], [60, 200, 90], [50, 90, 220], [230, 200, 40]];

/// A source that synthesises solid-colour stills. Used for demos and tests.
pub struct FakeSource {
    size: (u32, u32),
    fail_open: Option<String>,
    open_delay: Duration,
    latest: LatestImage,
    shared: Arc<FakeShared>,
}

#[derive(Default)]
struct FakeShared {
    snapshots: AtomicUsize,
    broken: AtomicBool,
}

/// Remote control for a `FakeSource` that has been moved elsewhere.
#[derive(Clone)]
pub struct FakeHandle {
    latest: LatestImage,
    shared: Arc<FakeShared>,
}

impl FakeSource {
    pub fn new(size: (u32, u32)) -> Self {
        Self {
            size,
            fail_open: None,
            open_delay: Duration::ZERO,
            latest: LatestImage::new(),
            shared: Arc::new(FakeShared::default()),
        }
    }

    /// Make every `open()` fail with `reason`.
    pub fn failing_open(mut self, reason: impl Into<String>) -> Self {
        self.fail_open = Some(reason.into());
        self
    }

    /// Make every `open()` take `delay` before the first image shows up.
    pub fn opening_after(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            latest: self.latest.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl FakeHandle {
    /// Simulate the feed dropping out.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.shared.broken.store(true, Ordering::SeqCst);
        self.latest.set_status(SourceStatus::Unavailable(reason.into()));
    }

    pub fn snapshots_taken(&self) -> usize {
        self.shared.snapshots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for FakeSource {
    async fn open(&mut self) -> Result<(), SourceError> {
        if let Some(reason) = &self.fail_open {
            self.latest.set_status(SourceStatus::Unavailable(reason.clone()));
            return Err(SourceError::Unavailable(reason.clone()));
        }
        if !self.open_delay.is_zero() {
            self.latest.set_status(SourceStatus::Connecting);
            tokio::time::sleep(self.open_delay).await;
        }
        self.shared.broken.store(false, Ordering::SeqCst);
        let (w, h) = self.size;
        let first = encode_jpeg(&RgbImage::from_pixel(w, h, Rgb(PALETTE[0])), 90)?;
        self.latest.publish(first);
        info!(width = w, height = h, "fake source ready");
        Ok(())
    }

    fn snapshot(&mut self) -> Result<Still, SourceError> {
        if self.shared.broken.load(Ordering::SeqCst) || self.latest.current().is_none() {
            return Err(SourceError::NotReady);
        }
        let n = self.shared.snapshots.fetch_add(1, Ordering::SeqCst);
        let (w, h) = self.size;
        let img = RgbImage::from_pixel(w, h, Rgb(PALETTE[n % PALETTE.len()]));
        Ok(Still::jpeg(encode_jpeg(&img, 90)?, w, h))
    }

    async fn close(&mut self) {
        self.latest.set_status(SourceStatus::Closed);
    }

    fn status(&self) -> watch::Receiver<SourceStatus> {
        self.latest.status()
    }

    fn name(&self) -> &str {
        "fake"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_ready_until_opened() {
        let mut source = FakeSource::new((8, 8));
        assert!(matches!(source.snapshot(), Err(SourceError::NotReady)));
        source.open().await.unwrap();
        let still = source.snapshot().unwrap();
        assert_eq!((still.width, still.height), (8, 8));
        assert_eq!(source.handle().snapshots_taken(), 1);
    }

    #[tokio::test]
    async fn disconnect_makes_snapshots_fail() {
        let mut source = FakeSource::new((8, 8));
        let handle = source.handle();
        source.open().await.unwrap();
        handle.disconnect("cable pulled");
        assert!(matches!(source.snapshot(), Err(SourceError::NotReady)));
        assert_eq!(
            *source.status().borrow(),
            SourceStatus::Unavailable("cable pulled".into())
        );
        source.open().await.unwrap();
        assert!(source.snapshot().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_open_connects_first() {
        let mut source = FakeSource::new((8, 8)).opening_after(Duration::from_secs(3));
        let status = source.status();
        let started = tokio::time::Instant::now();
        source.open().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(status.borrow().is_ready());
    }

    #[tokio::test]
    async fn failing_open_reports_reason() {
        let mut source = FakeSource::new((8, 8)).failing_open("permission denied");
        let err = source.open().await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(ref r) if r == "permission denied"));
    }
}
