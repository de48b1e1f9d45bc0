//! Burst-capture state machine.
//!
//! The session owns no timer and no source. Its owner feeds it trigger levels
//! and, while it is capturing, one snapshot result per tick together with the
//! session id the tick was started for. Everything time- or I/O-related stays
//! with the owner so the transitions here are plain synchronous code.

use frame_verdict_common::config::CaptureConfig;
use frame_verdict_common::frame::{Frame, FrameBatch, Still};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::source::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Capturing,
    Aborted,
    Completed,
}

/// Why a session ended without delivering a batch.
#[derive(Debug, Clone)]
pub enum AbortCause {
    /// The configured frame count is zero.
    NothingRequested,
    /// The source could not produce a snapshot.
    Source(SourceError),
    /// A frame was tagged with another session's id.
    ForeignFrame(String),
}

#[derive(Debug, Clone)]
pub struct Abort {
    pub session_id: u64,
    pub captured: usize,
    pub cause: AbortCause,
}

impl Abort {
    /// True when the session ended before a single frame was captured.
    pub fn is_empty_capture(&self) -> bool {
        self.captured == 0
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// Level recorded, nothing started.
    Ignored,
    /// A fresh session is capturing; start ticking for this id.
    Started { session_id: u64 },
    /// The session started and ended immediately.
    Aborted(Abort),
}

#[derive(Debug)]
pub enum TickOutcome {
    /// The tick belongs to an older session or arrived outside `Capturing`.
    Stale,
    Appended { captured: usize, target: usize },
    /// The target was reached; the batch is handed over exactly once.
    Completed(FrameBatch),
    Aborted(Abort),
}

pub struct CaptureSession {
    target: usize,
    interval: Duration,
    state: SessionState,
    session_id: u64,
    buffer: Vec<Frame>,
    trigger_level: bool,
    busy: bool,
}

impl CaptureSession {
    pub fn new(target: usize, interval: Duration) -> Self {
        Self {
            target,
            interval,
            state: SessionState::Idle,
            session_id: 0,
            buffer: Vec::with_capacity(target),
            trigger_level: false,
            busy: false,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.frames, config.interval())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Whether a session is capturing or its batch has not been settled yet.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn trigger_level(&self) -> bool {
        self.trigger_level
    }

    /// `(captured, target)` of the current or last session.
    pub fn progress(&self) -> (usize, usize) {
        let captured = match self.state {
            SessionState::Capturing => self.buffer.len(),
            SessionState::Completed => self.target,
            SessionState::Idle | SessionState::Aborted => 0,
        };
        (captured, self.target)
    }

    /// Record a trigger level; only a rising edge while free starts a session.
    pub fn set_trigger(&mut self, level: bool) -> TriggerOutcome {
        let rising = level && !self.trigger_level;
        self.trigger_level = level;
        if !rising {
            return TriggerOutcome::Ignored;
        }
        if self.busy {
            debug!(session_id = self.session_id, state = ?self.state, "trigger ignored while busy");
            return TriggerOutcome::Ignored;
        }

        self.session_id += 1;
        self.buffer.clear();
        self.busy = true;
        self.state = SessionState::Capturing;

        if self.target == 0 {
            warn!(session_id = self.session_id, "capture target is zero; nothing to capture");
            return TriggerOutcome::Aborted(self.abort(AbortCause::NothingRequested));
        }

        info!(
            session_id = self.session_id,
            target = self.target,
            interval_ms = self.interval.as_millis() as u64,
            "capture started"
        );
        TriggerOutcome::Started {
            session_id: self.session_id,
        }
    }

    /// Feed one snapshot result from the tick started for `session_id`.
    pub fn tick(&mut self, session_id: u64, snapshot: Result<Still, SourceError>) -> TickOutcome {
        if session_id != self.session_id || self.state != SessionState::Capturing {
            debug!(
                tick_session = session_id,
                current = self.session_id,
                state = ?self.state,
                "stale tick"
            );
            return TickOutcome::Stale;
        }

        let still = match snapshot {
            Ok(still) => still,
            Err(e) => {
                warn!(
                    session_id,
                    captured = self.buffer.len(),
                    error = %e,
                    "snapshot failed; aborting capture"
                );
                return TickOutcome::Aborted(self.abort(AbortCause::Source(e)));
            }
        };

        let index = self.buffer.len();
        self.buffer.push(Frame::new(still, session_id, index));
        let captured = self.buffer.len();
        debug!(session_id, captured, target = self.target, "frame captured");
        if captured < self.target {
            return TickOutcome::Appended {
                captured,
                target: self.target,
            };
        }

        let frames = std::mem::take(&mut self.buffer);
        self.trigger_level = false;
        match FrameBatch::new(session_id, frames) {
            Ok(batch) => {
                self.state = SessionState::Completed;
                info!(session_id, frames = batch.len(), "capture completed");
                TickOutcome::Completed(batch)
            }
            Err(e) => TickOutcome::Aborted(self.abort(AbortCause::ForeignFrame(e.to_string()))),
        }
    }

    /// Release the session after the downstream work for `session_id` finished.
    /// Returns false for a stale id.
    pub fn settle(&mut self, session_id: u64) -> bool {
        if session_id != self.session_id || self.state != SessionState::Completed {
            debug!(session_id, current = self.session_id, "ignoring stale settle");
            return false;
        }
        self.busy = false;
        self.state = SessionState::Idle;
        debug!(session_id, "session settled");
        true
    }

    /// End any capture without delivering.
    pub fn cancel(&mut self) {
        if self.state == SessionState::Capturing {
            info!(session_id = self.session_id, captured = self.buffer.len(), "capture cancelled");
        }
        self.buffer.clear();
        self.busy = false;
        self.trigger_level = false;
        self.state = SessionState::Idle;
    }

    fn abort(&mut self, cause: AbortCause) -> Abort {
        let captured = self.buffer.len();
        self.buffer.clear();
        self.busy = false;
        self.trigger_level = false;
        self.state = SessionState::Aborted;
        Abort {
            session_id: self.session_id,
            captured,
            cause,
        }
    }
}
