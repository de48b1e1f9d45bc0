//! Sends a captured batch to the classification service and normalizes the
//! reply into exactly one record per frame.

use async_trait::async_trait;
use frame_verdict_common::config::ServiceConfig;
use frame_verdict_common::frame::FrameBatch;
use frame_verdict_common::prediction::PredictionRecord;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("Server returned {status}: {status_text}")]
    Service { status: u16, status_text: String },
    #[error("request to classification service failed: {0}")]
    Transport(String),
    #[error("could not build request: {0}")]
    Request(String),
}

/// Anything that can turn a batch into per-frame records.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(
        &self,
        batch: &FrameBatch,
        model_tag: &str,
    ) -> Result<Vec<PredictionRecord>, SubmitError>;
}

pub struct SubmissionPipeline {
    client: reqwest::Client,
    endpoint: String,
    frame_field: String,
}

impl SubmissionPipeline {
    pub fn new(config: &ServiceConfig) -> Result<Self, SubmitError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SubmitError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            frame_field: config.frame_field.clone(),
        })
    }

    /// One multipart request per batch; never retried.
    pub async fn submit(
        &self,
        batch: &FrameBatch,
        model_tag: &str,
    ) -> Result<Vec<PredictionRecord>, SubmitError> {
        let form = self.build_form(batch, model_tag)?;
        info!(
            session_id = batch.session_id(),
            frames = batch.len(),
            model = model_tag,
            endpoint = %self.endpoint,
            "submitting batch"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(session_id = batch.session_id(), status = status.as_u16(), "service rejected batch");
            return Err(SubmitError::Service {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;
        Ok(normalize(&body, batch.len()))
    }

    fn build_form(&self, batch: &FrameBatch, model_tag: &str) -> Result<Form, SubmitError> {
        let mut form = Form::new().text("modelType", model_tag.to_string());
        for frame in batch.frames() {
            let data = frame.data().clone();
            let len = data.len() as u64;
            let part = Part::stream_with_length(data, len)
                .file_name(frame.file_name())
                .mime_str(frame.encoding().mime_type())
                .map_err(|e| SubmitError::Request(e.to_string()))?;
            form = form.part(self.frame_field.clone(), part);
        }
        Ok(form)
    }
}

#[async_trait]
impl Classify for SubmissionPipeline {
    async fn classify(
        &self,
        batch: &FrameBatch,
        model_tag: &str,
    ) -> Result<Vec<PredictionRecord>, SubmitError> {
        self.submit(batch, model_tag).await
    }
}

/// The two reply shapes the service is known to produce.
#[derive(Deserialize)]
#[serde(untagged)]
enum ResponseBody {
    Wrapped { results: Vec<PredictionRecord> },
    Bare(Vec<PredictionRecord>),
}

impl ResponseBody {
    fn into_records(self) -> Vec<PredictionRecord> {
        match self {
            ResponseBody::Wrapped { results } => results,
            ResponseBody::Bare(records) => records,
        }
    }
}

/// Map a success body onto exactly `expected` records, position by position.
///
/// An unreadable body yields `expected` unknown records. Missing positions
/// are filled with unknown records and surplus records are dropped.
pub fn normalize(body: &[u8], expected: usize) -> Vec<PredictionRecord> {
    let mut records = match serde_json::from_slice::<ResponseBody>(body) {
        Ok(parsed) => parsed.into_records(),
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "malformed classification response");
            Vec::new()
        }
    };

    if records.len() > expected {
        warn!(got = records.len(), expected, "dropping surplus prediction records");
        records.truncate(expected);
    } else if records.len() < expected {
        debug!(got = records.len(), expected, "padding missing prediction records");
        records.resize_with(expected, PredictionRecord::unknown);
    }
    records
}
