//! The event loop that owns the source, the capture session and its tick.
//!
//! Everything that mutates capture state runs on this one task. Commands from
//! the control surface, the capture tick, source status changes and finished
//! submissions are handled one at a time, and every change ends up in the
//! published `ViewState`.

use frame_verdict_capture::session::{
    Abort, AbortCause, CaptureSession, SessionState, TickOutcome, TriggerOutcome,
};
use frame_verdict_capture::source::{FrameSource, SourceError, SourceStatus};
use frame_verdict_common::frame::FrameBatch;
use frame_verdict_common::prediction::{aggregate, PredictionRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::render::{grid_view, verdict_view, GridView, VerdictView};
use crate::submit::{Classify, SubmitError};
use crate::ClientError;

const COMMAND_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub enum Command {
    /// Raw trigger level. `model` replaces the model tag when a session starts.
    Trigger {
        level: bool,
        model: Option<String>,
        reply: oneshot::Sender<TriggerReply>,
    },
    /// Momentary press: a high level immediately followed by a low one.
    Capture {
        model: String,
        reply: oneshot::Sender<TriggerReply>,
    },
    RetrySource,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerReply {
    Started { session_id: u64 },
    /// Rising edge dropped because a session is still capturing or submitting.
    Busy,
    /// No rising edge.
    Ignored,
    Aborted { session_id: u64 },
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ViewState>,
}

impl ControllerHandle {
    pub async fn trigger(
        &self,
        level: bool,
        model: Option<String>,
    ) -> Result<TriggerReply, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger { level, model, reply }).await?;
        rx.await.map_err(|_| ClientError::ControllerGone)
    }

    pub async fn capture(&self, model: String) -> Result<TriggerReply, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Capture { model, reply }).await?;
        rx.await.map_err(|_| ClientError::ControllerGone)
    }

    pub async fn retry_source(&self) -> Result<(), ClientError> {
        self.send(Command::RetrySource).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown).await
    }

    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::ControllerGone)
    }
}

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ViewState {
    pub source: SourceView,
    pub session: SessionView,
    pub model: String,
    pub inputs: GridView,
    pub predictions: GridView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
    /// Frames of the last completed session, served by `/frames/:index`.
    #[serde(skip)]
    pub frames: Option<FrameBatch>,
    /// Per-frame records of the last submission, by position.
    pub results: Vec<PredictionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceView {
    pub name: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SourceView {
    fn new(name: &str, status: &SourceStatus) -> Self {
        let (status, reason) = match status {
            SourceStatus::Connecting => ("connecting", None),
            SourceStatus::Ready => ("ready", None),
            SourceStatus::Unavailable(reason) => ("unavailable", Some(reason.clone())),
            SourceStatus::Closed => ("closed", None),
        };
        Self {
            name: name.to_string(),
            status,
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub id: u64,
    pub state: SessionState,
    pub captured: usize,
    pub target: usize,
    pub submitting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Submitting,
    Complete,
    EmptyCapture,
    SourceUnavailable,
    ServiceError,
}

/// One-shot message for the user. `id` increases with every notice so a
/// renderer shows each one once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Submission {
    session_id: u64,
    result: Result<Vec<PredictionRecord>, SubmitError>,
}

/// A source being closed and reopened off the loop; yields the source back.
type Opened = (Box<dyn FrameSource>, Result<(), SourceError>);
type Opening = JoinHandle<Opened>;

pub struct Controller {
    /// `None` while an `Opening` task owns the source.
    source: Option<Box<dyn FrameSource>>,
    source_name: String,
    status: watch::Receiver<SourceStatus>,
    opening: Option<Opening>,
    session: CaptureSession,
    classifier: Arc<dyn Classify>,
    labels: BTreeMap<String, String>,
    model: String,
    commands: mpsc::Receiver<Command>,
    results_tx: mpsc::Sender<Submission>,
    results_rx: mpsc::Receiver<Submission>,
    ticker: Option<(u64, Interval)>,
    in_flight: Option<JoinHandle<()>>,
    view: watch::Sender<ViewState>,
    next_notice: u64,
}

impl Controller {
    /// Build a controller and the handle used to drive it. Nothing runs until
    /// `run()` is awaited.
    pub fn new(
        source: Box<dyn FrameSource>,
        session: CaptureSession,
        classifier: Arc<dyn Classify>,
        labels: BTreeMap<String, String>,
        default_model: String,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (results_tx, results_rx) = mpsc::channel(1);

        let status_rx = source.status();
        let status = status_rx.borrow().clone();
        let (captured, target) = session.progress();
        let initial = ViewState {
            source: SourceView::new(source.name(), &status),
            session: SessionView {
                id: session.session_id(),
                state: session.state(),
                captured,
                target,
                submitting: false,
            },
            model: default_model.clone(),
            inputs: grid_view(None, false, &[], target, &labels),
            predictions: grid_view(None, false, &[], target, &labels),
            verdict: None,
            notice: None,
            frames: None,
            results: Vec::new(),
        };
        let (view, view_rx) = watch::channel(initial);

        let controller = Self {
            source_name: source.name().to_string(),
            source: Some(source),
            status: status_rx,
            opening: None,
            session,
            classifier,
            labels,
            model: default_model,
            commands,
            results_tx,
            results_rx,
            ticker: None,
            in_flight: None,
            view,
            next_notice: 0,
        };
        let handle = ControllerHandle {
            commands: commands_tx,
            view: view_rx,
        };
        (controller, handle)
    }

    pub async fn run(mut self) {
        self.start_open();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(session_id) = next_tick(&mut self.ticker) => self.on_tick(session_id),
                changed = self.status.changed() => {
                    if changed.is_err() {
                        warn!("source status channel closed");
                        break;
                    }
                    let current = self.status.borrow_and_update().clone();
                    self.on_source_status(&current);
                }
                Some(submission) = self.results_rx.recv() => self.on_submission(submission),
                opened = next_open(&mut self.opening) => self.on_opened(opened),
            }
        }

        self.teardown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger { level, model, reply } => {
                let outcome = self.trigger(level, model);
                let _ = reply.send(outcome);
            }
            Command::Capture { model, reply } => {
                let outcome = self.trigger(true, Some(model));
                self.session.set_trigger(false);
                let _ = reply.send(outcome);
            }
            Command::RetrySource => {
                if self.opening.is_some() {
                    debug!(source = %self.source_name, "source is already reopening");
                    return;
                }
                info!(source = %self.source_name, "retrying source");
                if self.session.state() == SessionState::Capturing {
                    self.ticker = None;
                    self.session.cancel();
                    self.publish_session();
                }
                self.start_open();
            }
            Command::Shutdown => {}
        }
    }

    fn trigger(&mut self, level: bool, model: Option<String>) -> TriggerReply {
        let rising = level && !self.session.trigger_level();
        let busy = self.session.is_busy();

        match self.session.set_trigger(level) {
            TriggerOutcome::Ignored if rising && busy => TriggerReply::Busy,
            TriggerOutcome::Ignored => TriggerReply::Ignored,
            TriggerOutcome::Started { session_id } => {
                if let Some(model) = model {
                    self.model = model;
                }
                let period = self.session.interval();
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some((session_id, interval));

                let model = self.model.clone();
                let labels = &self.labels;
                let target = self.session.target();
                self.view.send_modify(|view| {
                    view.model = model;
                    view.frames = None;
                    view.results.clear();
                    view.verdict = None;
                    view.inputs = grid_view(None, true, &[], target, labels);
                    view.predictions = grid_view(None, false, &[], target, labels);
                });
                self.publish_session();
                TriggerReply::Started { session_id }
            }
            TriggerOutcome::Aborted(abort) => {
                let session_id = abort.session_id;
                self.on_abort(abort);
                TriggerReply::Aborted { session_id }
            }
        }
    }

    fn on_tick(&mut self, session_id: u64) {
        let snapshot = match self.source.as_mut() {
            Some(source) => source.snapshot(),
            None => Err(SourceError::NotReady),
        };
        match self.session.tick(session_id, snapshot) {
            TickOutcome::Stale => {}
            TickOutcome::Appended { .. } => self.publish_session(),
            TickOutcome::Completed(batch) => {
                self.ticker = None;
                self.deliver(batch);
            }
            TickOutcome::Aborted(abort) => {
                self.ticker = None;
                self.on_abort(abort);
            }
        }
    }

    /// Show the captured frames right away and hand the batch to the classifier.
    fn deliver(&mut self, batch: FrameBatch) {
        let session_id = batch.session_id();
        let frames = batch.len();
        let target = self.session.target();
        let labels = &self.labels;
        self.view.send_modify(|view| {
            view.inputs = grid_view(Some(&batch), false, &[], target, labels);
            view.predictions = grid_view(Some(&batch), true, &[], target, labels);
            view.frames = Some(batch.clone());
        });
        self.notify(
            NoticeKind::Submitting,
            format!("Sending {frames} frames to the server..."),
        );

        let classifier = Arc::clone(&self.classifier);
        let results = self.results_tx.clone();
        let model = self.model.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let result = classifier.classify(&batch, &model).await;
            if results.send(Submission { session_id, result }).await.is_err() {
                debug!(session_id, "controller gone; dropping submission result");
            }
        }));
        self.publish_session();
    }

    fn on_submission(&mut self, submission: Submission) {
        let Submission { session_id, result } = submission;
        if !self.session.settle(session_id) {
            debug!(session_id, "discarding result for stale session");
            return;
        }
        self.in_flight = None;

        let target = self.session.target();
        match result {
            Ok(records) => {
                let verdict = aggregate(&records);
                info!(
                    session_id,
                    class_label = %verdict.class_label,
                    confidence = %verdict.confidence,
                    "verdict ready"
                );
                let labels = &self.labels;
                self.view.send_modify(|view| {
                    let frames = view.frames.as_ref();
                    view.predictions = grid_view(frames, false, &records, target, labels);
                    view.verdict = Some(verdict_view(&verdict, frames, labels));
                    view.results = records;
                });
                self.notify(
                    NoticeKind::Complete,
                    "Successfully received prediction results.".to_string(),
                );
            }
            Err(e) => {
                error!(session_id, error = %e, "submission failed");
                let labels = &self.labels;
                self.view.send_modify(|view| {
                    view.predictions = grid_view(None, false, &[], target, labels);
                });
                self.notify(NoticeKind::ServiceError, e.to_string());
            }
        }
        self.publish_session();
    }

    fn on_abort(&mut self, abort: Abort) {
        let target = self.session.target();
        let labels = &self.labels;
        self.view.send_modify(|view| {
            view.inputs = grid_view(None, false, &[], target, labels);
        });

        if abort.is_empty_capture() {
            self.notify(NoticeKind::EmptyCapture, "No frames were captured.".to_string());
        } else if let AbortCause::Source(e) = &abort.cause {
            self.notify(
                NoticeKind::SourceUnavailable,
                format!("Capture stopped after {} frames: {e}", abort.captured),
            );
        }
        self.publish_session();
    }

    fn on_source_status(&mut self, status: &SourceStatus) {
        match status {
            SourceStatus::Unavailable(reason) => {
                warn!(source = %self.source_name, reason, "source unavailable");
            }
            other => debug!(source = %self.source_name, status = ?other, "source status"),
        }
        let source = SourceView::new(&self.source_name, status);
        self.view.send_modify(|view| view.source = source);
    }

    /// Close and reopen the source on its own task so the loop keeps serving
    /// commands while `open()` waits for the first image.
    fn start_open(&mut self) {
        let Some(mut source) = self.source.take() else {
            warn!(source = %self.source_name, "no source to open");
            return;
        };
        self.opening = Some(tokio::spawn(async move {
            source.close().await;
            let result = source.open().await;
            (source, result)
        }));
    }

    fn on_opened(&mut self, opened: Result<Opened, JoinError>) {
        self.opening = None;
        match opened {
            Ok((source, result)) => {
                self.source = Some(source);
                if let Err(e) = result {
                    error!(source = %self.source_name, error = %e, "failed to open source");
                    self.notify(NoticeKind::SourceUnavailable, e.to_string());
                }
            }
            Err(e) => {
                error!(source = %self.source_name, error = %e, "source open task failed");
                self.notify(NoticeKind::SourceUnavailable, e.to_string());
            }
        }
        let status = self.status.borrow_and_update().clone();
        self.on_source_status(&status);
    }

    async fn teardown(&mut self) {
        info!("controller shutting down");
        self.ticker = None;
        self.session.cancel();
        // The submission finishes on its own; its result has nowhere to go.
        self.in_flight.take();
        self.results_rx.close();
        if let Some(task) = self.opening.take() {
            task.abort();
            if let Ok((source, _)) = task.await {
                self.source = Some(source);
            }
        }
        if let Some(source) = self.source.as_mut() {
            source.close().await;
        }
        let status = match &self.source {
            Some(source) => source.status().borrow().clone(),
            None => SourceStatus::Closed,
        };
        self.on_source_status(&status);
        self.publish_session();
    }

    fn notify(&mut self, kind: NoticeKind, message: String) {
        self.next_notice += 1;
        let notice = Notice {
            id: self.next_notice,
            kind,
            message,
        };
        self.view.send_modify(|view| view.notice = Some(notice));
    }

    fn publish_session(&self) {
        let (captured, target) = self.session.progress();
        let session = SessionView {
            id: self.session.session_id(),
            state: self.session.state(),
            captured,
            target,
            submitting: self.in_flight.is_some(),
        };
        self.view.send_modify(|view| view.session = session);
    }
}

/// Resolve with the session id on the next tick, or never when idle.
async fn next_tick(ticker: &mut Option<(u64, Interval)>) -> Option<u64> {
    match ticker {
        Some((session_id, interval)) => {
            interval.tick().await;
            Some(*session_id)
        }
        None => std::future::pending().await,
    }
}

/// Resolve with the finished open task, or never when nothing is opening.
async fn next_open(opening: &mut Option<Opening>) -> Result<Opened, JoinError> {
    match opening {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Spawn the controller on the current runtime.
pub fn spawn(controller: Controller) -> JoinHandle<()> {
    tokio::spawn(controller.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use frame_verdict_capture::source::FakeSource;
    use frame_verdict_common::prediction::Confidence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Classifier that answers "A" for every frame once released.
    struct GatedClassifier {
        gate: Notify,
        calls: AtomicUsize,
        finished: AtomicUsize,
        fail: bool,
    }

    impl GatedClassifier {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Classify for GatedClassifier {
        async fn classify(
            &self,
            batch: &FrameBatch,
            _model_tag: &str,
        ) -> Result<Vec<PredictionRecord>, SubmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SubmitError::Service {
                    status: 503,
                    status_text: "Service Unavailable".into(),
                });
            }
            Ok(batch
                .frames()
                .iter()
                .map(|_| PredictionRecord::new(Confidence::Number(0.9), "A"))
                .collect())
        }
    }

    fn start(
        source: FakeSource,
        frames: usize,
        classifier: Arc<GatedClassifier>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let session = CaptureSession::new(frames, Duration::from_millis(200));
        let (controller, handle) = Controller::new(
            Box::new(source),
            session,
            classifier,
            BTreeMap::new(),
            "general".to_string(),
        );
        (handle, spawn(controller))
    }

    async fn wait_for(handle: &ControllerHandle, check: impl Fn(&ViewState) -> bool) -> ViewState {
        let mut rx = handle.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|v| check(v)))
            .await
            .expect("timed out waiting for view")
            .expect("controller dropped view");
        view.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn capture_submit_and_verdict() {
        let classifier = GatedClassifier::new(false);
        let (handle, task) = start(FakeSource::new((8, 8)), 3, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        let reply = handle.capture("glass".into()).await.unwrap();
        assert_eq!(reply, TriggerReply::Started { session_id: 1 });

        let view = wait_for(&handle, |v| v.frames.is_some()).await;
        assert_eq!(view.model, "glass");
        assert_eq!(view.frames.as_ref().unwrap().len(), 3);
        assert!(view.predictions.is_loading);
        assert_eq!(view.inputs.cards.len(), 3);
        assert_eq!(view.notice.as_ref().unwrap().kind, NoticeKind::Submitting);

        classifier.gate.notify_one();
        let view = wait_for(&handle, |v| v.verdict.is_some()).await;
        let verdict = view.verdict.unwrap();
        assert_eq!(verdict.class_label, "A");
        assert_eq!(verdict.confidence, "90.00%");
        assert_eq!(view.session.state, SessionState::Idle);
        assert!(!view.predictions.is_loading);
        assert_eq!(view.notice.unwrap().kind, NoticeKind::Complete);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_ignored_while_submission_in_flight() {
        let classifier = GatedClassifier::new(false);
        let (handle, task) = start(FakeSource::new((8, 8)), 2, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.capture("general".into()).await.unwrap();
        wait_for(&handle, |v| v.session.submitting).await;

        assert_eq!(handle.capture("general".into()).await.unwrap(), TriggerReply::Busy);

        classifier.gate.notify_one();
        wait_for(&handle, |v| v.verdict.is_some()).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

        let reply = handle.capture("general".into()).await.unwrap();
        assert_eq!(reply, TriggerReply::Started { session_id: 2 });

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn held_level_fires_once() {
        let classifier = GatedClassifier::new(false);
        let (handle, task) = start(FakeSource::new((8, 8)), 1, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        let first = handle.trigger(true, None).await.unwrap();
        assert_eq!(first, TriggerReply::Started { session_id: 1 });
        assert_eq!(handle.trigger(true, None).await.unwrap(), TriggerReply::Ignored);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn service_error_keeps_frames_visible() {
        let classifier = GatedClassifier::new(true);
        let (handle, task) = start(FakeSource::new((8, 8)), 2, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.capture("general".into()).await.unwrap();
        wait_for(&handle, |v| v.session.submitting).await;
        classifier.gate.notify_one();

        let view = wait_for(&handle, |v| {
            v.notice.as_ref().map(|n| n.kind) == Some(NoticeKind::ServiceError)
        })
        .await;
        assert_eq!(view.notice.unwrap().message, "Server returned 503: Service Unavailable");
        assert!(view.verdict.is_none());
        assert_eq!(view.frames.unwrap().len(), 2);
        assert_eq!(view.session.state, SessionState::Idle);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn source_loss_aborts_capture() {
        let classifier = GatedClassifier::new(false);
        let source = FakeSource::new((8, 8));
        let fake = source.handle();
        let (handle, task) = start(source, 5, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.capture("general".into()).await.unwrap();
        wait_for(&handle, |v| v.session.captured == 2).await;
        fake.disconnect("stream dropped");

        let view = wait_for(&handle, |v| v.session.state == SessionState::Aborted).await;
        assert_eq!(view.source.status, "unavailable");
        assert_eq!(view.notice.unwrap().kind, NoticeKind::SourceUnavailable);
        assert!(view.frames.is_none());
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_source_gives_empty_capture() {
        let classifier = GatedClassifier::new(false);
        let source = FakeSource::new((8, 8)).failing_open("permission denied");
        let (handle, task) = start(source, 3, classifier.clone());
        wait_for(&handle, |v| v.source.status == "unavailable").await;

        let reply = handle.capture("general".into()).await.unwrap();
        assert_eq!(reply, TriggerReply::Started { session_id: 1 });
        let view = wait_for(&handle, |v| v.session.state == SessionState::Aborted).await;
        assert_eq!(view.notice.unwrap().kind, NoticeKind::EmptyCapture);
        assert_eq!(view.source.reason.as_deref(), Some("permission denied"));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reopens_source() {
        let classifier = GatedClassifier::new(false);
        let source = FakeSource::new((8, 8));
        let fake = source.handle();
        let (handle, task) = start(source, 1, classifier);
        wait_for(&handle, |v| v.source.status == "ready").await;

        fake.disconnect("unplugged");
        wait_for(&handle, |v| v.source.status == "unavailable").await;
        handle.retry_source().await.unwrap();
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_result_is_discarded_after_shutdown() {
        let classifier = GatedClassifier::new(false);
        let (handle, task) = start(FakeSource::new((8, 8)), 1, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.capture("general".into()).await.unwrap();
        wait_for(&handle, |v| v.session.submitting).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        classifier.gate.notify_one();
        let view = handle.view();
        assert!(view.verdict.is_none());
        assert_eq!(view.source.status, "closed");
        assert!(handle.capture("general".into()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn submission_runs_to_completion_after_shutdown() {
        let classifier = GatedClassifier::new(false);
        let (handle, task) = start(FakeSource::new((8, 8)), 2, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.capture("general".into()).await.unwrap();
        wait_for(&handle, |v| v.session.submitting).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(classifier.finished.load(Ordering::SeqCst), 0);

        classifier.gate.notify_one();
        for _ in 0..20 {
            if classifier.finished.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(classifier.finished.load(Ordering::SeqCst), 1);
        let view = handle.view();
        assert!(view.verdict.is_none());
        assert!(!view.session.submitting);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_served_while_source_reopens() {
        let classifier = GatedClassifier::new(false);
        let source = FakeSource::new((8, 8)).opening_after(Duration::from_secs(5));
        let (handle, task) = start(source, 1, classifier);
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.retry_source().await.unwrap();
        wait_for(&handle, |v| v.source.status == "connecting").await;
        let started = Instant::now();
        assert_eq!(handle.trigger(false, None).await.unwrap(), TriggerReply::Ignored);
        handle.retry_source().await.unwrap();
        assert_eq!(handle.trigger(false, None).await.unwrap(), TriggerReply::Ignored);
        assert!(started.elapsed() < Duration::from_secs(5));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.view().source.status, "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn capture_during_reopen_is_empty() {
        let classifier = GatedClassifier::new(false);
        let source = FakeSource::new((8, 8)).opening_after(Duration::from_secs(5));
        let (handle, task) = start(source, 2, classifier.clone());
        wait_for(&handle, |v| v.source.status == "ready").await;

        handle.retry_source().await.unwrap();
        wait_for(&handle, |v| v.source.status == "connecting").await;
        handle.capture("general".into()).await.unwrap();
        let view = wait_for(&handle, |v| v.session.state == SessionState::Aborted).await;
        assert_eq!(view.notice.unwrap().kind, NoticeKind::EmptyCapture);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);

        wait_for(&handle, |v| v.source.status == "ready").await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
