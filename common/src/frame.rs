use bytes::Bytes;
use serde::Serialize;

/// Encoding of a still's payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    Jpeg,
}

impl FrameEncoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameEncoding::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FrameEncoding::Jpeg => "jpg",
        }
    }
}

/// A single snapshot of a visual source, as produced by `FrameSource::snapshot`.
#[derive(Debug, Clone)]
pub struct Still {
    pub data: Bytes,
    pub encoding: FrameEncoding,
    pub width: u32,
    pub height: u32,
    pub captured_at_ms: i64,
}

impl Still {
    pub fn jpeg(data: Bytes, width: u32, height: u32) -> Self {
        Self {
            data,
            encoding: FrameEncoding::Jpeg,
            width,
            height,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// A still that a capture session has accepted into its buffer.
///
/// Frames are immutable once created; the payload is reference-counted so
/// handing a batch to the submission pipeline and to renderers never copies
/// image data.
#[derive(Debug, Clone)]
pub struct Frame {
    still: Still,
    session_id: u64,
    index: usize,
}

impl Frame {
    pub fn new(still: Still, session_id: u64, index: usize) -> Self {
        Self {
            still,
            session_id,
            index,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Position within the batch (capture order).
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn data(&self) -> &Bytes {
        &self.still.data
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.still.encoding
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.still.width, self.still.height)
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.still.captured_at_ms
    }

    /// File name used for the multipart part, e.g. `frame_0.jpg`.
    pub fn file_name(&self) -> String {
        format!("frame_{}.{}", self.index, self.still.encoding.extension())
    }
}

/// The ordered frames of one completed capture session.
#[derive(Debug, Clone)]
pub struct FrameBatch {
    session_id: u64,
    frames: Vec<Frame>,
}

impl FrameBatch {
    /// Build a batch, rejecting frames that belong to another session.
    pub fn new(session_id: u64, frames: Vec<Frame>) -> Result<Self, FrameError> {
        if let Some(stray) = frames.iter().find(|f| f.session_id != session_id) {
            return Err(FrameError::ForeignSession {
                expected: session_id,
                got: stray.session_id,
            });
        }
        Ok(Self { session_id, frames })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame from session {got} cannot join batch of session {expected}")]
    ForeignSession { expected: u64, got: u64 },
}
