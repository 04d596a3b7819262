//! Session State Machine.
//!
//! `Session` is the sole mutator of one streaming run. It validates control
//! transitions, pulls frames from its [`FrameSource`] on `tick`, and publishes
//! every outbound message through a [`SessionSink`]. It is driven by exactly
//! one pacer task (see `pacer.rs`), so it needs no interior locking.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use framecast_core::messages::now_timestamp;
use framecast_core::{
    RelayError, ServerMessage, SessionId, SessionMode, SessionSnapshot, SessionState, StatusKind,
};

use crate::source::{FrameSource, SourceDescriptor, SourceInfo, SourceResolver};

/// Where a session delivers its messages (fan-out to subscribers).
pub trait SessionSink: Send + Sync {
    fn publish(&self, session_id: &SessionId, message: &ServerMessage);
}

/// Pacing parameters supplied with a start request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pacing {
    pub requested_rate: Option<f64>,
    /// Used when the source does not report a native rate.
    pub default_rate: f64,
}

/// Resolved send rate for a session.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatePlan {
    /// Achieved frames per second.
    pub fps: f64,
    pub native_fps: f64,
    pub requested_fps: Option<f64>,
    /// The request asked for more than the source's native rate.
    pub capped: bool,
    interval: Duration,
}

impl RatePlan {
    /// Tick period, `1 / fps`. Never zero.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn usable_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

/// `achieved = min(requested or native, native)`; falls back to the default
/// rate when the source has no native rate.
pub fn plan_rate(pacing: Pacing, native_rate: f64) -> Result<RatePlan, RelayError> {
    if let Some(requested) = pacing.requested_rate {
        if !usable_rate(requested) {
            return Err(RelayError::InvalidRequest(format!(
                "send rate must be positive, got {requested}"
            )));
        }
    }
    let native = if usable_rate(native_rate) { Some(native_rate) } else { None };

    let (fps, capped) = match (pacing.requested_rate, native) {
        (Some(requested), Some(native)) if requested > native => (native, true),
        (Some(requested), _) => (requested, false),
        (None, Some(native)) => (native, false),
        (None, None) => (pacing.default_rate, false),
    };
    if !usable_rate(fps) {
        return Err(RelayError::InvalidRequest(format!("send rate must be positive, got {fps}")));
    }
    // rates so small or so large that the period cannot be represented
    let interval = Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|period| !period.is_zero())
        .ok_or_else(|| RelayError::InvalidRequest(format!("send rate {fps} is out of range")))?;

    Ok(RatePlan {
        fps,
        native_fps: native.unwrap_or(0.0),
        requested_fps: pacing.requested_rate,
        capped,
        interval,
    })
}

pub struct Session {
    id: SessionId,
    mode: SessionMode,
    state: SessionState,
    sink: Arc<dyn SessionSink>,
    source: Option<Box<dyn FrameSource>>,
    info: Option<SourceInfo>,
    rate: Option<RatePlan>,
    current_frame: u64,
    total_frames: u64,
    started_at: String,
}

impl Session {
    pub fn new(id: SessionId, sink: Arc<dyn SessionSink>) -> Self {
        Self {
            id,
            mode: SessionMode::default(),
            state: SessionState::Idle,
            sink,
            source: None,
            info: None,
            rate: None,
            current_frame: 0,
            total_frames: 0,
            started_at: String::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn rate(&self) -> Option<RatePlan> {
        self.rate
    }

    /// Tick period, once started.
    pub fn interval(&self) -> Option<Duration> {
        self.rate.map(|rate| rate.interval())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            mode: self.mode,
            state: self.state,
            current_frame: self.current_frame,
            total_frames: self.total_frames,
            fps: self.rate.map_or(0.0, |rate| rate.fps),
            started_at: self.started_at.clone(),
        }
    }

    /// Open the source, compute pacing, and go `active`.
    ///
    /// On failure the session stays `idle` and nothing is published.
    pub async fn start(
        &mut self,
        resolver: &dyn SourceResolver,
        descriptor: &SourceDescriptor,
        pacing: Pacing,
    ) -> Result<(), RelayError> {
        if self.state != SessionState::Idle {
            return Err(RelayError::invalid_state("start", self.state));
        }
        if let Some(requested) = pacing.requested_rate {
            if !usable_rate(requested) {
                return Err(RelayError::InvalidRequest(format!(
                    "send rate must be positive, got {requested}"
                )));
            }
        }

        let mut source = resolver.resolve(descriptor.mode);
        let info = source.open(descriptor).await?;
        if info.total_count == 0 {
            return Err(RelayError::InvalidRequest("source has no frames".into()));
        }
        let rate = plan_rate(pacing, info.native_rate)?;

        self.mode = descriptor.mode;
        self.source = Some(source);
        self.info = Some(info);
        self.rate = Some(rate);
        self.total_frames = info.total_count;
        self.current_frame = 0;
        self.started_at = now_timestamp();
        self.state = SessionState::Active;

        info!(
            session_id = %self.id,
            mode = %self.mode,
            total_frames = info.total_count,
            fps = rate.fps,
            rate_capped = rate.capped,
            "session started"
        );
        if rate.capped {
            warn!(
                session_id = %self.id,
                requested = ?rate.requested_fps,
                native = rate.native_fps,
                "requested rate exceeds native rate, using native"
            );
        }

        self.publish(&ServerMessage::VideoInfo {
            session_id: self.id.clone(),
            mode: self.mode,
            width: info.width,
            height: info.height,
            total_frames: info.total_count,
            fps: rate.fps,
            native_fps: rate.native_fps,
            requested_fps: rate.requested_fps,
            rate_capped: rate.capped,
            timestamp: now_timestamp(),
        });
        self.publish(&ServerMessage::status_change(self.id.clone(), StatusKind::Started, 0));
        Ok(())
    }

    /// Emit the next frame. No-op unless `active`.
    ///
    /// A source error, or the source ending before `total_frames`, moves the
    /// session to `error` and is returned.
    pub async fn tick(&mut self) -> Result<(), RelayError> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };

        match source.next().await {
            Ok(Some(payload)) => {
                self.current_frame += 1;
                let message = self.data_message(payload);
                debug!(session_id = %self.id, frame = self.current_frame, "frame");
                self.publish(&message);
                if self.current_frame >= self.total_frames {
                    self.complete();
                }
                Ok(())
            }
            Ok(None) => self.fail(RelayError::SourceFailed(format!(
                "source ended after {} of {} frames",
                self.current_frame, self.total_frames
            ))),
            Err(RelayError::SourceFailed(reason)) => self.fail(RelayError::SourceFailed(reason)),
            Err(other) => self.fail(RelayError::SourceFailed(other.to_string())),
        }
    }

    pub fn pause(&mut self) -> Result<(), RelayError> {
        if self.state != SessionState::Active {
            return Err(RelayError::invalid_state("pause", self.state));
        }
        self.state = SessionState::Paused;
        info!(session_id = %self.id, frame = self.current_frame, "session paused");
        self.publish(&ServerMessage::status_change(
            self.id.clone(),
            StatusKind::Paused,
            self.current_frame,
        ));
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), RelayError> {
        if self.state != SessionState::Paused {
            return Err(RelayError::invalid_state("resume", self.state));
        }
        self.state = SessionState::Active;
        info!(session_id = %self.id, frame = self.current_frame, "session resumed");
        self.publish(&ServerMessage::status_change(
            self.id.clone(),
            StatusKind::Resumed,
            self.current_frame,
        ));
        Ok(())
    }

    /// Stop the session. Already-terminal sessions are left untouched.
    pub fn stop(&mut self) -> Result<(), RelayError> {
        if self.state.is_terminal() {
            debug!(session_id = %self.id, state = %self.state, "stop on terminal session ignored");
            return Ok(());
        }
        self.state = SessionState::Stopped;
        self.source = None;
        info!(session_id = %self.id, frame = self.current_frame, "session stopped");
        self.publish(&ServerMessage::status_change(
            self.id.clone(),
            StatusKind::Stopped,
            self.current_frame,
        ));
        Ok(())
    }

    fn complete(&mut self) {
        self.state = SessionState::Complete;
        self.source = None;
        info!(session_id = %self.id, frames = self.current_frame, "session complete");
        self.publish(&ServerMessage::Complete {
            session_id: self.id.clone(),
            message: format!("streamed {} of {} frames", self.current_frame, self.total_frames),
            timestamp: now_timestamp(),
        });
    }

    fn fail(&mut self, err: RelayError) -> Result<(), RelayError> {
        self.state = SessionState::Error;
        self.source = None;
        warn!(session_id = %self.id, frame = self.current_frame, error = %err, "session failed");
        self.publish(&ServerMessage::error(
            Some(self.id.clone()),
            err.error_kind(),
            err.to_string(),
        ));
        Err(err)
    }

    fn data_message(&self, payload: Value) -> ServerMessage {
        let timestamp = now_timestamp();
        match self.mode {
            SessionMode::Video => {
                let (width, height) = self.info.map_or((0, 0), |info| (info.width, info.height));
                ServerMessage::VideoFrame {
                    session_id: self.id.clone(),
                    image_data: payload,
                    frame_number: self.current_frame,
                    total_frames: self.total_frames,
                    width,
                    height,
                    timestamp,
                }
            }
            SessionMode::FrameTest => ServerMessage::Frame {
                session_id: self.id.clone(),
                frame_number: self.current_frame,
                total_frames: self.total_frames,
                data: payload,
                timestamp,
            },
            SessionMode::SecondTest => ServerMessage::Second {
                session_id: self.id.clone(),
                second_number: self.current_frame,
                total_seconds: self.total_frames,
                data: payload,
                timestamp,
            },
        }
    }

    fn publish(&self, message: &ServerMessage) {
        self.sink.publish(&self.id, message);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    async fn started(resolver: &ScriptedResolver) -> (Session, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let mut session = Session::new(SessionId::new(), sink.clone());
        session.start(resolver, &frame_test(), pacing(None)).await.unwrap();
        (session, sink)
    }

    #[tokio::test]
    async fn ten_ticks_complete_exactly_once() {
        let (mut session, sink) = started(&ScriptedResolver::new(10, 10.0)).await;
        for _ in 0..10 {
            session.tick().await.unwrap();
        }
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(sink.count("complete"), 1);
        assert_eq!(sink.frame_numbers(), (1..=10).collect::<Vec<_>>());

        let before = sink.messages().len();
        session.tick().await.unwrap();
        assert_eq!(sink.messages().len(), before);
        assert_eq!(session.current_frame(), 10);
    }

    #[tokio::test]
    async fn start_announces_descriptor_then_status() {
        let (session, sink) = started(&ScriptedResolver::new(10, 10.0)).await;
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(sink.kinds(), vec!["video_info", "status_change"]);
        match &sink.messages()[0] {
            ServerMessage::VideoInfo { total_frames, fps, width, .. } => {
                assert_eq!(*total_frames, 10);
                assert_eq!(*fps, 10.0);
                assert_eq!(*width, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_twice_is_invalid_state() {
        let resolver = ScriptedResolver::new(3, 10.0);
        let (mut session, _sink) = started(&resolver).await;
        let err = session.start(&resolver, &frame_test(), pacing(None)).await.unwrap_err();
        assert_eq!(err, RelayError::invalid_state("start", SessionState::Active));
    }

    #[tokio::test]
    async fn second_pause_rejected_second_stop_accepted() {
        let (mut session, sink) = started(&ScriptedResolver::new(10, 10.0)).await;
        session.pause().unwrap();
        let err = session.pause().unwrap_err();
        assert_eq!(err, RelayError::invalid_state("pause", SessionState::Paused));

        session.stop().unwrap();
        let stops = sink.count("status_change");
        session.stop().unwrap();
        assert_eq!(sink.count("status_change"), stops);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn pause_resume_keeps_frame_index() {
        let (mut session, sink) = started(&ScriptedResolver::new(10, 10.0)).await;
        for _ in 0..3 {
            session.tick().await.unwrap();
        }
        session.pause().unwrap();
        session.tick().await.unwrap();
        assert_eq!(session.current_frame(), 3);

        session.resume().unwrap();
        session.tick().await.unwrap();
        assert_eq!(sink.frame_numbers(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let (mut session, _sink) = started(&ScriptedResolver::new(10, 10.0)).await;
        let err = session.resume().unwrap_err();
        assert_eq!(err.error_kind(), "invalid_state");
    }

    #[tokio::test]
    async fn requested_rate_above_native_is_capped() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = Session::new(SessionId::new(), sink.clone());
        session
            .start(&ScriptedResolver::new(10, 10.0), &frame_test(), pacing(Some(60.0)))
            .await
            .unwrap();

        let rate = session.rate().unwrap();
        assert_eq!(rate.fps, 10.0);
        assert!(rate.capped);
        assert_eq!(session.interval(), Some(Duration::from_millis(100)));
        match &sink.messages()[0] {
            ServerMessage::VideoInfo { fps, requested_fps, rate_capped, .. } => {
                assert_eq!(*fps, 10.0);
                assert_eq!(*requested_fps, Some(60.0));
                assert!(*rate_capped);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_plan_rules() {
        let slower = plan_rate(pacing(Some(2.0)), 10.0).unwrap();
        assert_eq!(slower.fps, 2.0);
        assert!(!slower.capped);

        let unknown_native = plan_rate(pacing(None), 0.0).unwrap();
        assert_eq!(unknown_native.fps, 5.0);

        assert!(plan_rate(pacing(Some(0.0)), 10.0).is_err());
        assert!(plan_rate(pacing(Some(-1.0)), 10.0).is_err());
        assert!(plan_rate(pacing(Some(f64::NAN)), 10.0).is_err());
    }

    #[test]
    fn unrepresentable_periods_rejected() {
        // period overflows Duration
        let err = plan_rate(pacing(Some(1e-30)), 10.0).unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");
        // no native rate to cap against, period rounds to zero
        let err = plan_rate(pacing(Some(1e12)), 0.0).unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");

        let fastest = plan_rate(pacing(Some(1e6)), 0.0).unwrap();
        assert_eq!(fastest.interval(), Duration::from_micros(1));
    }

    #[tokio::test]
    async fn non_positive_rate_leaves_session_idle() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = Session::new(SessionId::new(), sink.clone());
        let err = session
            .start(&ScriptedResolver::new(10, 10.0), &frame_test(), pacing(Some(0.0)))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");
        assert_eq!(session.state(), SessionState::Idle);
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn early_end_of_source_is_session_error() {
        let resolver = ScriptedResolver {
            total: 5,
            yields: 2,
            native_rate: 10.0,
        };
        let (mut session, sink) = started(&resolver).await;
        session.tick().await.unwrap();
        session.tick().await.unwrap();
        let err = session.tick().await.unwrap_err();

        assert!(matches!(err, RelayError::SourceFailed(_)));
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(sink.count("error"), 1);
        assert_eq!(sink.count("complete"), 0);

        // terminal: further ticks and stops are no-ops
        session.tick().await.unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn data_message_kind_follows_mode() {
        let sink = Arc::new(RecordingSink::default());
        let mut session = Session::new(SessionId::new(), sink.clone());
        let descriptor = SourceDescriptor {
            mode: SessionMode::SecondTest,
            ..frame_test()
        };
        session
            .start(&ScriptedResolver::new(2, 1.0), &descriptor, pacing(None))
            .await
            .unwrap();
        session.tick().await.unwrap();
        assert_eq!(sink.kinds().last(), Some(&"second"));
    }
}
