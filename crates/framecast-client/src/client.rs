//! The reconnecting client and its link task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use framecast_core::config::ClientSettings;
use framecast_core::messages::now_timestamp;

use crate::connector::{Connector, Transport, WsConnector};
use crate::error::ClientError;
use crate::policy::{LinkState, ReconnectPolicy};

/// Called with the full decoded message, on the link task.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

const SEND_QUEUE_CAPACITY: usize = 256;

/// Collects configuration and handlers. The handler table is frozen when
/// [`start`](Self::start) is called.
pub struct ClientBuilder {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    handlers: HashMap<String, Handler>,
}

impl ClientBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            connector: Arc::new(WsConnector),
            handlers: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.url.clone()).policy(ReconnectPolicy::from(settings))
    }

    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Register a handler for messages whose `type` is `kind`. A later
    /// registration for the same kind replaces the earlier one.
    pub fn on<F>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    /// Spawn the link task. The first connection attempt happens immediately.
    pub fn start(self) -> Result<ReconnectingClient, ClientError> {
        self.policy.validate()?;
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let outbound = Arc::new(Mutex::new(None));
        let stats = Arc::new(Counters::default());
        let cancel = CancellationToken::new();
        let handlers = Arc::new(self.handlers);

        let link = Link {
            url: self.url,
            policy: self.policy,
            connector: self.connector,
            handlers: Arc::clone(&handlers),
            state: state_tx,
            outbound: Arc::clone(&outbound),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(link.run());

        Ok(ReconnectingClient {
            state: state_rx,
            outbound,
            handlers,
            stats,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU32,
    connects: AtomicU32,
}

/// Lifetime totals for one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkStats {
    pub attempts: u32,
    pub connects: u32,
}

/// Handle to a running link task.
pub struct ReconnectingClient {
    state: watch::Receiver<LinkState>,
    outbound: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    handlers: Arc<HashMap<String, Handler>>,
    stats: Arc<Counters>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl ReconnectingClient {
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Resolves once the link reaches `Connected`, or fails if the client
    /// reaches a state it cannot leave first.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| matches!(s, LinkState::Connected | LinkState::Failed))
            .await
            .map_err(|_| ClientError::Closed)?;
        match *state {
            LinkState::Connected => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            attempts: self.stats.attempts.load(Ordering::Relaxed),
            connects: self.stats.connects.load(Ordering::Relaxed),
        }
    }

    /// Registered message kinds, sorted.
    pub fn handler_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Queue a `{type, data, timestamp}` envelope on the current link.
    ///
    /// Only valid while connected. Queued messages are discarded if the link
    /// drops before they are written.
    pub fn send(&self, kind: &str, data: Value) -> Result<(), ClientError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(ClientError::NotConnected)?;
        let envelope = json!({ "type": kind, "data": data, "timestamp": now_timestamp() });
        tx.try_send(envelope.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::NotConnected,
        })
    }

    /// Close the link and stop reconnecting. Leaves the state `Disconnected`
    /// unless the client had already failed.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the link task to finish. Returns
    /// [`ClientError::ReconnectExhausted`] if the client gave up.
    pub async fn wait(&self) -> Result<(), ClientError> {
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.map_err(|_| ClientError::Closed)?,
            None => Ok(()),
        }
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum LinkEnd {
    Cancelled,
    Lost(String),
}

struct Link {
    url: String,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    handlers: Arc<HashMap<String, Handler>>,
    state: watch::Sender<LinkState>,
    outbound: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    stats: Arc<Counters>,
    cancel: CancellationToken,
}

impl Link {
    #[instrument(skip_all, fields(url = %self.url))]
    async fn run(self) -> Result<(), ClientError> {
        let mut attempt = 0u32;
        let mut first = true;

        loop {
            if attempt >= self.policy.max_attempts {
                warn!(attempts = attempt, "giving up on relay");
                self.state.send_replace(LinkState::Failed);
                return Err(ClientError::ReconnectExhausted { attempts: attempt });
            }

            self.state.send_replace(LinkState::Connecting);
            if !first {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return self.disconnected(),
                    () = sleep(self.policy.reconnect_interval) => {}
                }
            }
            first = false;
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            info!(attempt, max = self.policy.max_attempts, "connecting");

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.disconnected(),
                result = self.connector.connect(&self.url) => result,
            };
            let transport = match result {
                Ok(transport) => transport,
                Err(err) => {
                    warn!(attempt, error = %err, "connection attempt failed");
                    continue;
                }
            };

            attempt = 0;
            self.stats.connects.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
            *self.outbound.lock() = Some(tx);
            self.state.send_replace(LinkState::Connected);
            info!("connected");

            let end = self.drive(transport, rx).await;
            // anything still queued belongs to the dead link
            *self.outbound.lock() = None;
            match end {
                LinkEnd::Cancelled => return self.disconnected(),
                LinkEnd::Lost(reason) => warn!(%reason, "link lost, reconnecting"),
            }
        }
    }

    fn disconnected(&self) -> Result<(), ClientError> {
        self.state.send_replace(LinkState::Disconnected);
        info!("client stopped");
        Ok(())
    }

    async fn drive(&self, mut transport: Transport, mut outbound: mpsc::Receiver<String>) -> LinkEnd {
        let period = self.policy.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let _ = transport.sink.close().await;
                    return LinkEnd::Cancelled;
                }
                frame = transport.stream.next() => match frame {
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        if let Some(reply) = self.dispatch(&text) {
                            if let Err(err) = transport.sink.send(reply).await {
                                return LinkEnd::Lost(err.to_string());
                            }
                        }
                    }
                    Some(Err(err)) => return LinkEnd::Lost(err.to_string()),
                    None => return LinkEnd::Lost("stream ended".into()),
                },
                Some(text) = outbound.recv() => {
                    if let Err(err) = transport.sink.send(text).await {
                        return LinkEnd::Lost(err.to_string());
                    }
                }
                _ = ticker.tick() => {
                    if last_seen.elapsed() >= self.policy.ping_timeout {
                        return LinkEnd::Lost("heartbeat timeout".into());
                    }
                    let ping = json!({ "type": "ping", "timestamp": now_timestamp() });
                    if let Err(err) = transport.sink.send(ping.to_string()).await {
                        return LinkEnd::Lost(err.to_string());
                    }
                }
            }
        }
    }

    /// Run the handler for one inbound message. Returns a reply to write, if any.
    fn dispatch(&self, text: &str) -> Option<String> {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "ignoring undecodable message");
                return None;
            }
        };
        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();

        match self.handlers.get(kind) {
            Some(handler) => handler(&message),
            None => debug!(kind, "no handler registered"),
        }

        (kind == "ping").then(|| json!({ "type": "pong", "timestamp": now_timestamp() }).to_string())
    }
}
