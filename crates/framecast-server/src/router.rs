//! Message Router: classifies inbound socket text and dispatches it to the
//! session manager, the registry, or the heartbeat monitor.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use framecast_core::messages::now_timestamp;
use framecast_core::{
    ConnectionId, Inbound, RelayError, ServerMessage, SessionId, SessionSnapshot, SessionState,
    StartRequest,
};
use framecast_session::{Control, SessionManager};

use crate::heartbeat;
use crate::registry::ConnectionRegistry;

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    sessions: Arc<SessionManager>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self { registry, sessions }
    }

    /// Handle one inbound text frame. Malformed input is answered with an
    /// `error` and never closes the connection.
    #[instrument(skip_all, fields(conn_id = %connection_id))]
    pub async fn handle_text(&self, connection_id: &ConnectionId, text: &str) {
        match Inbound::parse(text) {
            Ok(inbound) => self.dispatch(connection_id, inbound).await,
            Err(err) => self.malformed(connection_id, &err.to_string()),
        }
    }

    /// Answer unparseable input with an `error` of code `malformed`.
    pub fn malformed(&self, connection_id: &ConnectionId, reason: &str) {
        warn!(conn_id = %connection_id, reason, "malformed message");
        self.reply(connection_id, &ServerMessage::error(None, "malformed", reason));
    }

    pub async fn dispatch(&self, connection_id: &ConnectionId, inbound: Inbound) {
        let reply = match inbound {
            Inbound::Play(request) => self.play(connection_id, request).await,
            Inbound::Pause { session_id } => {
                self.control(connection_id, Control::Pause, "pause_video", session_id).await
            }
            Inbound::Resume { session_id } => {
                self.control(connection_id, Control::Resume, "resume_video", session_id).await
            }
            Inbound::Stop { session_id } => {
                self.control(connection_id, Control::Stop, "stop_video", session_id).await
            }
            Inbound::Subscribe { session_id } => self.subscribe(connection_id, session_id),
            Inbound::Unsubscribe => self.unsubscribe(connection_id),
            Inbound::Status { session_id } => self.status(connection_id, session_id),
            Inbound::Ping => {
                if let Some(connection) = self.registry.get(connection_id) {
                    heartbeat::acknowledge_ping(&connection);
                }
                None
            }
            Inbound::Pong => None,
            Inbound::Unknown { kind, data } => {
                self.relay_unknown(connection_id, kind, data);
                None
            }
        };

        if let Some(message) = reply {
            self.reply(connection_id, &message);
        }
    }

    /// Start a session and subscribe the sender, or resume the sender's
    /// paused session.
    async fn play(&self, connection_id: &ConnectionId, request: StartRequest) -> Option<ServerMessage> {
        if let Some(current) = self.subscription(connection_id) {
            if matches!(self.sessions.status(&current), Ok(s) if s.state == SessionState::Paused) {
                return self
                    .control(connection_id, Control::Resume, "play_video", Some(current))
                    .await;
            }
        }

        let session_id = SessionId::new();
        let previous = match self.registry.subscribe(connection_id, session_id.clone()) {
            Ok(previous) => previous,
            Err(err) => return Some(error_reply(None, &err)),
        };

        match self.sessions.start(session_id.clone(), request).await {
            Ok(snapshot) => Some(ack("play_video", &snapshot)),
            Err(err) => {
                let _ = match previous {
                    Some(previous) => self.registry.subscribe(connection_id, previous),
                    None => self.registry.unsubscribe(connection_id),
                };
                Some(error_reply(Some(session_id), &err))
            }
        }
    }

    async fn control(
        &self,
        connection_id: &ConnectionId,
        control: Control,
        command: &'static str,
        session_id: Option<SessionId>,
    ) -> Option<ServerMessage> {
        let target = match self.target(connection_id, session_id) {
            Ok(target) => target,
            Err(err) => return Some(error_reply(None, &err)),
        };
        let result = match control {
            Control::Pause => self.sessions.pause(&target).await,
            Control::Resume => self.sessions.resume(&target).await,
            Control::Stop => self.sessions.stop(&target).await,
        };
        Some(match result {
            Ok(snapshot) => ack(command, &snapshot),
            Err(err) => error_reply(Some(target), &err),
        })
    }

    fn subscribe(&self, connection_id: &ConnectionId, session_id: SessionId) -> Option<ServerMessage> {
        let result = self
            .sessions
            .status(&session_id)
            .and_then(|snapshot| {
                self.registry.subscribe(connection_id, session_id.clone())?;
                Ok(snapshot)
            });
        Some(match result {
            Ok(snapshot) => {
                info!(
                    session_id = %session_id,
                    viewers = self.registry.subscriber_count(&session_id),
                    "subscribed"
                );
                ack("subscribe", &snapshot)
            }
            Err(err) => error_reply(Some(session_id), &err),
        })
    }

    fn unsubscribe(&self, connection_id: &ConnectionId) -> Option<ServerMessage> {
        match self.registry.unsubscribe(connection_id) {
            Ok(Some(previous)) => match self.sessions.status(&previous) {
                Ok(snapshot) => Some(ack("unsubscribe", &snapshot)),
                Err(_) => None,
            },
            Ok(None) => Some(ServerMessage::error(
                None,
                "invalid_request",
                "connection is not subscribed",
            )),
            Err(err) => Some(error_reply(None, &err)),
        }
    }

    fn status(&self, connection_id: &ConnectionId, session_id: Option<SessionId>) -> Option<ServerMessage> {
        let result = self
            .target(connection_id, session_id)
            .and_then(|target| self.sessions.status(&target));
        Some(match result {
            Ok(session) => ServerMessage::SessionStatus {
                session,
                timestamp: now_timestamp(),
            },
            Err(err) => error_reply(None, &err),
        })
    }

    /// Unknown kinds go to the sender's session subscribers, or back to the
    /// sender when it has none.
    fn relay_unknown(&self, connection_id: &ConnectionId, kind: String, data: serde_json::Value) {
        info!(kind = %kind, "unrecognized message kind");
        let notice = ServerMessage::Notice {
            kind,
            from: connection_id.clone(),
            data,
            timestamp: now_timestamp(),
        };
        match self.subscription(connection_id) {
            Some(session_id) => {
                self.registry.broadcast(&session_id, &notice);
            }
            None => self.reply(connection_id, &notice),
        }
    }

    fn target(&self, connection_id: &ConnectionId, explicit: Option<SessionId>) -> Result<SessionId, RelayError> {
        explicit.or_else(|| self.subscription(connection_id)).ok_or_else(|| {
            RelayError::InvalidRequest("no session_id given and connection is not subscribed".into())
        })
    }

    fn subscription(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.registry.get(connection_id).and_then(|c| c.subscription())
    }

    fn reply(&self, connection_id: &ConnectionId, message: &ServerMessage) {
        match self.registry.unicast(connection_id, message) {
            Ok(true) => {}
            Ok(false) => debug!(kind = message.kind(), "reply dropped, queue full"),
            Err(_) => debug!(kind = message.kind(), "reply to departed connection"),
        }
    }
}

fn ack(command: &str, snapshot: &SessionSnapshot) -> ServerMessage {
    ServerMessage::Ack {
        command: command.to_string(),
        session_id: snapshot.session_id.clone(),
        state: snapshot.state,
        current_frame: snapshot.current_frame,
        timestamp: now_timestamp(),
    }
}

/// Build the `error` reply. Failures the caller cannot fix by retrying log
/// at warn.
fn error_reply(session_id: Option<SessionId>, err: &RelayError) -> ServerMessage {
    if err.is_recoverable() {
        debug!(code = err.error_kind(), error = %err, "request rejected");
    } else {
        warn!(code = err.error_kind(), error = %err, "request failed");
    }
    ServerMessage::error(session_id, err.error_kind(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecast_session::{BuiltinResolver, ManagerConfig};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        router: MessageRouter,
        registry: Arc<ConnectionRegistry>,
        sessions: Arc<SessionManager>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(8, 256, CancellationToken::new()));
        let sessions = Arc::new(SessionManager::new(
            ManagerConfig::default(),
            Arc::new(BuiltinResolver {
                default_test_frames: 10,
                frame_test_rate: 10.0,
            }),
            registry.clone(),
            CancellationToken::new(),
        ));
        Harness {
            router: MessageRouter::new(registry.clone(), sessions.clone()),
            registry,
            sessions,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
        messages.iter().filter(|m| m["type"] == kind).collect()
    }

    const PLAY_FRAME_TEST: &str = r#"{"type":"play_video","data":{"mode":"frame-test"}}"#;

    #[tokio::test(start_paused = true)]
    async fn play_subscribes_sender_and_streams() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();

        h.router.handle_text(&conn.id, PLAY_FRAME_TEST).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let messages = drain(&mut rx);
        assert_eq!(messages[0]["type"], "video_info");
        let ack = of_type(&messages, "ack");
        assert_eq!(ack.len(), 1);
        assert_eq!(ack[0]["command"], "play_video");
        let frames: Vec<u64> = of_type(&messages, "frame")
            .iter()
            .map(|m| m["frame_number"].as_u64().unwrap())
            .collect();
        assert_eq!(frames, (1..=10).collect::<Vec<_>>());
        assert_eq!(of_type(&messages, "complete").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_twice_reports_invalid_state() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, PLAY_FRAME_TEST).await;
        drain(&mut rx);

        h.router.handle_text(&conn.id, r#"{"action":"pause"}"#).await;
        h.router.handle_text(&conn.id, r#"{"type":"pause_video"}"#).await;
        let messages = drain(&mut rx);

        assert_eq!(of_type(&messages, "status_change")[0]["status"], "paused");
        assert_eq!(of_type(&messages, "ack")[0]["state"], "paused");
        let errors = of_type(&messages, "error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], "invalid_state");
    }

    #[tokio::test(start_paused = true)]
    async fn play_on_paused_subscription_resumes() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, PLAY_FRAME_TEST).await;
        let session = conn.subscription().unwrap();
        h.router.handle_text(&conn.id, r#"{"action":"pause"}"#).await;
        drain(&mut rx);

        h.router.handle_text(&conn.id, r#"{"action":"play"}"#).await;
        let messages = drain(&mut rx);
        assert_eq!(of_type(&messages, "status_change")[0]["status"], "resumed");
        assert_eq!(conn.subscription(), Some(session));
        assert_eq!(h.sessions.list().len(), 1);
    }

    #[tokio::test]
    async fn malformed_text_gets_error_and_connection_stays() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, "{not json").await;
        let messages = drain(&mut rx);
        assert_eq!(messages[0]["type"], "error");
        assert_eq!(messages[0]["code"], "malformed");
        assert!(h.registry.get(&conn.id).is_some());
    }

    #[tokio::test]
    async fn control_without_target_is_invalid_request() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, r#"{"type":"stop_video"}"#).await;
        assert_eq!(drain(&mut rx)[0]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn unknown_session_reported() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router
            .handle_text(&conn.id, r#"{"type":"resume_video","data":{"session_id":"sess_nope"}}"#)
            .await;
        let messages = drain(&mut rx);
        assert_eq!(messages[0]["code"], "unknown_session");
        assert_eq!(messages[0]["session_id"], "sess_nope");
    }

    #[tokio::test]
    async fn ping_answered_with_pong() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, r#"{"action":"heartbeat"}"#).await;
        assert_eq!(drain(&mut rx)[0]["type"], "pong");
    }

    #[tokio::test]
    async fn unknown_kind_without_subscription_echoes_notice() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, r#"{"type":"annotate","data":{"x":1}}"#).await;
        let messages = drain(&mut rx);
        assert_eq!(messages[0]["type"], "notice");
        assert_eq!(messages[0]["kind"], "annotate");
        assert_eq!(messages[0]["data"]["x"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kind_reaches_session_subscribers() {
        let h = harness();
        let (a, mut rx_a) = h.registry.register().unwrap();
        let (b, mut rx_b) = h.registry.register().unwrap();
        h.router.handle_text(&a.id, PLAY_FRAME_TEST).await;
        let session = a.subscription().unwrap();
        h.router
            .handle_text(&b.id, &format!(r#"{{"type":"subscribe","data":{{"session_id":"{session}"}}}}"#))
            .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        h.router.handle_text(&b.id, r#"{"type":"marker","data":"here"}"#).await;
        assert_eq!(of_type(&drain(&mut rx_a), "notice").len(), 1);
        assert_eq!(of_type(&drain(&mut rx_b), "notice").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_snapshot() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, PLAY_FRAME_TEST).await;
        drain(&mut rx);

        h.router.handle_text(&conn.id, r#"{"type":"status"}"#).await;
        let messages = drain(&mut rx);
        let status = of_type(&messages, "session_status");
        assert_eq!(status[0]["session"]["mode"], "frame-test");
        assert_eq!(status[0]["session"]["total_frames"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_play_restores_previous_subscription() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, PLAY_FRAME_TEST).await;
        let original = conn.subscription();

        h.router
            .handle_text(&conn.id, r#"{"type":"play_video","data":{"mode":"video"}}"#)
            .await;
        let errors: Vec<Value> = drain(&mut rx).into_iter().filter(|m| m["type"] == "error").collect();
        assert_eq!(errors[0]["code"], "invalid_request");
        assert_eq!(conn.subscription(), original);
    }

    #[tokio::test]
    async fn unreadable_manifest_reports_source_failure() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        let play = serde_json::json!({
            "type": "play_video",
            "data": {"mode": "video", "video_path": missing},
        });

        h.router.handle_text(&conn.id, &play.to_string()).await;
        let messages = drain(&mut rx);
        let errors = of_type(&messages, "error");
        assert_eq!(errors[0]["code"], "source_failed");
        assert_eq!(conn.subscription(), None);
        assert!(h.sessions.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_adds_a_viewer() {
        let h = harness();
        let (a, mut rx_a) = h.registry.register().unwrap();
        let (b, mut rx_b) = h.registry.register().unwrap();
        h.router.handle_text(&a.id, PLAY_FRAME_TEST).await;
        let session = a.subscription().unwrap();
        drain(&mut rx_a);

        h.router
            .handle_text(&b.id, &format!(r#"{{"type":"subscribe","data":{{"session_id":"{session}"}}}}"#))
            .await;
        assert_eq!(of_type(&drain(&mut rx_b), "ack")[0]["command"], "subscribe");
        assert_eq!(h.registry.subscriber_count(&session), 2);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_error() {
        let h = harness();
        let (conn, mut rx) = h.registry.register().unwrap();
        h.router.handle_text(&conn.id, r#"{"type":"unsubscribe"}"#).await;
        assert_eq!(drain(&mut rx)[0]["code"], "invalid_request");
    }
}
