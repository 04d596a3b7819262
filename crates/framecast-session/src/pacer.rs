//! Per-session pacer task.
//!
//! Each started [`Session`] is moved into one task that owns it exclusively.
//! Control commands arrive over an mpsc channel and are applied between
//! ticks, so a command never interleaves with a frame. The task publishes a
//! [`SessionSnapshot`] over a watch channel after every change and exits once
//! the session reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use framecast_core::{RelayError, SessionId, SessionSnapshot, SessionState};

use crate::machine::Session;

const COMMAND_BUFFER: usize = 16;
const FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

/// Control command applied by the pacer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Pause,
    Resume,
    Stop,
}

impl Control {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

struct Command {
    control: Control,
    reply: oneshot::Sender<Result<SessionSnapshot, RelayError>>,
}

/// Handle to a running pacer. Cheap to share behind an `Arc`.
pub struct SessionHandle {
    id: SessionId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Spawn the pacer for an already started session.
    pub fn spawn(session: Session, cancel: CancellationToken) -> Arc<Self> {
        let id = session.id().clone();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

        let span = tracing::info_span!("pacer", session_id = %id);
        let task = tokio::spawn(run_pacer(session, commands_rx, snapshot_tx, cancel).instrument(span));

        Arc::new(Self {
            id,
            commands: commands_tx,
            snapshot: snapshot_rx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Apply a control command and wait for the resulting state.
    ///
    /// Once the pacer has exited (terminal session) `stop` still succeeds and
    /// everything else is rejected against the final state.
    pub async fn send(&self, control: Control) -> Result<SessionSnapshot, RelayError> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command { control, reply }).await.is_err() {
            return self.after_exit(control);
        }
        match response.await {
            Ok(result) => result,
            Err(_) => self.after_exit(control),
        }
    }

    fn after_exit(&self, control: Control) -> Result<SessionSnapshot, RelayError> {
        let snapshot = self.snapshot();
        match control {
            Control::Stop => Ok(snapshot),
            other => Err(RelayError::invalid_state(other.as_str(), snapshot.state)),
        }
    }

    /// Wait for the pacer task to finish.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(session_id = %self.id, error = %err, "pacer task panicked");
            }
        }
    }
}

async fn run_pacer(
    mut session: Session,
    mut commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
) {
    let period = session.interval().unwrap_or(FALLBACK_INTERVAL);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(period_ms = period.as_millis() as u64, "pacer running");

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let _ = session.stop();
                snapshot.send_replace(session.snapshot());
                break;
            }

            command = commands.recv() => {
                let Some(Command { control, reply }) = command else {
                    let _ = session.stop();
                    snapshot.send_replace(session.snapshot());
                    break;
                };
                let result = match control {
                    Control::Pause => session.pause(),
                    Control::Resume => session.resume().map(|()| ticker.reset_immediately()),
                    Control::Stop => session.stop(),
                };
                let current = session.snapshot();
                snapshot.send_replace(current.clone());
                let _ = reply.send(result.map(|()| current));
            }

            _ = ticker.tick(), if session.state() == SessionState::Active => {
                if let Err(err) = session.tick().await {
                    warn!(error = %err, "tick failed");
                }
                snapshot.send_replace(session.snapshot());
            }
        }

        if session.state().is_terminal() {
            break;
        }
    }

    debug!(state = %session.state(), frame = session.current_frame(), "pacer exited");
}
