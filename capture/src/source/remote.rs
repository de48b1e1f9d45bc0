use async_trait::async_trait;
use bytes::Bytes;
use frame_verdict_common::config::SourceConfig;
use frame_verdict_common::frame::Still;
use futures_util::StreamExt;
use reqwest::Url;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::mjpeg::MjpegSplitter;
use super::still::{encode_still, is_displayable};
use super::{FrameSource, LatestImage, SourceError, SourceStatus};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const NO_IMAGE_IN_WINDOW: &str = "no image within the keep-alive window";

/// Why an attached stream was let go without an error.
#[derive(Debug, PartialEq, Eq)]
enum Detach {
    /// Keep-alive window elapsed; re-fetch straight away.
    KeepAlive,
    /// The server closed the response after delivering images.
    Ended,
}

/// A continuously refreshed image endpoint: an MJPEG stream, or a single-JPEG
/// URL that is re-polled.
///
/// The connection is re-fetched every keep-alive window with a `t=<millis>`
/// query so caches never serve a stale image, and a window without any image
/// counts as a disconnect.
pub struct RemoteStream {
    config: SourceConfig,
    latest: LatestImage,
    task: Option<JoinHandle<()>>,
}

impl RemoteStream {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            latest: LatestImage::new(),
            task: None,
        }
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl FrameSource for RemoteStream {
    async fn open(&mut self) -> Result<(), SourceError> {
        self.stop_task();

        let base = Url::parse(&self.config.url)
            .map_err(|e| SourceError::Unavailable(format!("invalid stream url: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        info!(url = %base, "attaching to remote stream");
        self.latest.set_status(SourceStatus::Connecting);
        self.task = Some(tokio::spawn(run_stream(
            client,
            base,
            self.latest.clone(),
            self.config.keepalive(),
            self.config.poll_interval(),
        )));

        match self.latest.wait_ready(self.config.open_timeout()).await {
            Ok(()) => {
                info!(url = %self.config.url, "remote stream ready");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, url = %self.config.url, "remote stream failed to open");
                self.stop_task();
                self.latest.set_status(SourceStatus::Unavailable(e.to_string()));
                Err(e)
            }
        }
    }

    fn snapshot(&mut self) -> Result<Still, SourceError> {
        let jpeg = self.latest.current().ok_or(SourceError::NotReady)?;
        encode_still(&jpeg, self.config.still_size(), self.config.jpeg_quality)
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.latest.set_status(SourceStatus::Closed);
        debug!(url = %self.config.url, "remote stream closed");
    }

    fn status(&self) -> watch::Receiver<SourceStatus> {
        self.latest.status()
    }

    fn name(&self) -> &str {
        "remote"
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.stop_task();
    }
}

/// Keep the latest image fresh, reconnecting with exponential backoff.
async fn run_stream(
    client: reqwest::Client,
    base: Url,
    latest: LatestImage,
    keepalive: Duration,
    poll_interval: Duration,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match attach(&client, &base, &latest, keepalive, poll_interval).await {
            Ok(Detach::KeepAlive) => {
                debug!(url = %base, "keep-alive re-fetch");
                backoff = INITIAL_BACKOFF;
            }
            Ok(Detach::Ended) => {
                info!(url = %base, "stream ended cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(error = %e, url = %base, "stream error, reconnecting in {:?}", backoff);
                latest.set_status(SourceStatus::Unavailable(e.to_string()));
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn attach(
    client: &reqwest::Client,
    base: &Url,
    latest: &LatestImage,
    keepalive: Duration,
    poll_interval: Duration,
) -> Result<Detach, SourceError> {
    let refresh_at = Instant::now() + keepalive;
    let response = fetch(client, base).await?;

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    match MjpegSplitter::from_content_type(&content_type) {
        Some(splitter) => consume_mjpeg(response, splitter, latest, refresh_at).await,
        None => {
            debug!(content_type, "single-image endpoint, polling");
            let body = response
                .bytes()
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            let received = u64::from(publish_if_displayable(latest, body));
            poll_single(client, base, latest, refresh_at, poll_interval, received).await
        }
    }
}

async fn consume_mjpeg(
    response: reqwest::Response,
    mut splitter: MjpegSplitter,
    latest: &LatestImage,
    refresh_at: Instant,
) -> Result<Detach, SourceError> {
    let mut byte_stream = response.bytes_stream();
    let mut received: u64 = 0;

    loop {
        let chunk = match tokio::time::timeout_at(refresh_at, byte_stream.next()).await {
            Err(_) if received > 0 => return Ok(Detach::KeepAlive),
            Err(_) => return Err(SourceError::Unavailable(NO_IMAGE_IN_WINDOW.into())),
            Ok(None) if received > 0 => return Ok(Detach::Ended),
            Ok(None) => {
                return Err(SourceError::Unavailable(
                    "stream closed before any image".into(),
                ))
            }
            Ok(Some(Err(e))) => return Err(SourceError::Unavailable(e.to_string())),
            Ok(Some(Ok(chunk))) => chunk,
        };

        for jpeg in splitter.push(&chunk) {
            if publish_if_displayable(latest, jpeg) {
                received += 1;
            }
        }
    }
}

/// Polling fallback for endpoints that serve one JPEG per request.
/// `received` counts images already published in this window.
async fn poll_single(
    client: &reqwest::Client,
    base: &Url,
    latest: &LatestImage,
    refresh_at: Instant,
    poll_interval: Duration,
    mut received: u64,
) -> Result<Detach, SourceError> {
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(refresh_at) => {
                if received == 0 {
                    return Err(SourceError::Unavailable(NO_IMAGE_IN_WINDOW.into()));
                }
                return Ok(Detach::KeepAlive);
            }
            _ = ticker.tick() => {}
        }

        let response = fetch(client, base).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        if publish_if_displayable(latest, body) {
            received += 1;
        }
    }
}

async fn fetch(client: &reqwest::Client, base: &Url) -> Result<reqwest::Response, SourceError> {
    let url = cache_busted(base, chrono::Utc::now().timestamp_millis());
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(SourceError::Unavailable(format!(
            "HTTP status {}",
            response.status().as_u16()
        )));
    }
    Ok(response)
}

fn publish_if_displayable(latest: &LatestImage, jpeg: Bytes) -> bool {
    if jpeg.is_empty() || !is_displayable(&jpeg) {
        debug!(bytes = jpeg.len(), "dropping undecodable image");
        return false;
    }
    latest.publish(jpeg);
    true
}

/// `base` with a `t=<millis>` query pair so intermediaries never cache the feed.
fn cache_busted(base: &Url, now_ms: i64) -> Url {
    let mut url = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| k != "t")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept);
        pairs.append_pair("t", &now_ms.to_string());
    }
    url
}
