//! Live visual feeds that can be snapshotted into stills.
//!
//! Every source keeps the most recently received JPEG in a `watch` slot that a
//! background task refreshes. `snapshot()` reads that slot synchronously and
//! never waits for a new image; `open()` resolves once the first image has
//! arrived. Dropping a source releases its device or connection just like
//! `close()` does.

pub mod camera;
pub mod fake;
pub mod mjpeg;
pub mod remote;
pub mod still;

use async_trait::async_trait;
use bytes::Bytes;
use frame_verdict_common::config::{SourceConfig, SourceKind};
use frame_verdict_common::frame::Still;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

pub use camera::LocalCamera;
pub use fake::FakeSource;
pub use remote::RemoteStream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source has no image to snapshot yet")]
    NotReady,
    #[error("no image received within {0:?}")]
    Timeout(Duration),
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("failed to encode still: {0}")]
    Encode(String),
}

/// Connection state of a source, published for renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Connecting,
    Ready,
    Unavailable(String),
    Closed,
}

impl SourceStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, SourceStatus::Ready)
    }
}

#[async_trait]
pub trait FrameSource: Send {
    /// Acquire the device or connection and wait for the first image.
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Encode the currently displayed image. Never waits for a new one.
    fn snapshot(&mut self) -> Result<Still, SourceError>;

    /// Release every underlying resource.
    async fn close(&mut self);

    /// Status updates; the current value is always readable.
    fn status(&self) -> watch::Receiver<SourceStatus>;

    fn name(&self) -> &str;
}

/// Build the source selected by `[source] kind`.
pub fn from_config(config: &SourceConfig) -> Box<dyn FrameSource> {
    debug!(kind = ?config.kind, "building frame source");
    match config.kind {
        SourceKind::Camera => Box::new(LocalCamera::new(config.clone())),
        SourceKind::Remote => Box::new(RemoteStream::new(config.clone())),
        SourceKind::Fake => Box::new(FakeSource::new(config.still_size().unwrap_or((64, 64)))),
    }
}

/// The slot shared between a source's reader task and `snapshot()`.
#[derive(Clone)]
pub(crate) struct LatestImage {
    image: watch::Sender<Option<Bytes>>,
    status: watch::Sender<SourceStatus>,
}

impl LatestImage {
    pub(crate) fn new() -> Self {
        let (image, _) = watch::channel(None);
        let (status, _) = watch::channel(SourceStatus::Closed);
        Self { image, status }
    }

    pub(crate) fn publish(&self, jpeg: Bytes) {
        self.image.send_replace(Some(jpeg));
        self.status.send_if_modified(|status| {
            if status.is_ready() {
                false
            } else {
                *status = SourceStatus::Ready;
                true
            }
        });
    }

    pub(crate) fn set_status(&self, status: SourceStatus) {
        if !status.is_ready() {
            self.image.send_replace(None);
        }
        self.status.send_replace(status);
    }

    pub(crate) fn current(&self) -> Option<Bytes> {
        self.image.borrow().clone()
    }

    pub(crate) fn status(&self) -> watch::Receiver<SourceStatus> {
        self.status.subscribe()
    }

    /// Resolve once the first image arrives, or fail if the source reports
    /// itself unavailable or nothing arrives within `timeout`.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), SourceError> {
        let mut status = self.status.subscribe();
        let wait = async {
            loop {
                let current = status.borrow_and_update().clone();
                match current {
                    SourceStatus::Ready => return Ok(()),
                    SourceStatus::Unavailable(reason) => {
                        return Err(SourceError::Unavailable(reason))
                    }
                    SourceStatus::Connecting | SourceStatus::Closed => {}
                }
                if status.changed().await.is_err() {
                    return Err(SourceError::Unavailable("source task ended".into()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(timeout)),
        }
    }
}
