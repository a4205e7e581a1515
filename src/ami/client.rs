// src/ami/client.rs
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::AmiConfig;
use crate::error::{AmiError, AmiResult};

use super::action::AmiAction;
use super::connection::{AmiConnection, ConnectionState};
use super::correlator::ActionResult;
use super::message::Message;
use super::router::EventRouter;

/// Point-in-time view of the client for operators and health endpoints.
#[derive(Debug, Clone)]
pub struct ClientHealth {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub permanently_failed: bool,
    pub last_error: Option<String>,
    /// Actions awaiting resolution on the live connection.
    pub pending_actions: usize,
}

/// The manager-interface client: owns the connection lifecycle and exposes
/// the send/subscribe API.
///
/// Explicitly constructed and explicitly owned: callers hold the `Arc`,
/// call [`Self::start`] once and [`Self::stop`] when done; there is no
/// process-wide current connection. While started, a lost connection is
/// re-established with exponential backoff up to the configured attempt
/// bound, after which the client reports itself permanently failed instead
/// of retrying forever. Rejected credentials are fatal immediately.
pub struct AmiClient {
    config: AmiConfig,
    router: Arc<EventRouter>,
    current: RwLock<Option<Arc<AmiConnection>>>,
    state_tx: watch::Sender<ConnectionState>,
    stopped: AtomicBool,
    consecutive_failures: AtomicU32,
    permanently_failed: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
}

impl AmiClient {
    pub fn new(config: AmiConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            router: Arc::new(EventRouter::new()),
            current: RwLock::new(None),
            state_tx,
            stopped: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            permanently_failed: AtomicBool::new(false),
            last_error: std::sync::Mutex::new(None),
        })
    }

    /// Connect and authenticate, then keep the session alive in the
    /// background. Returns once the first connection is Ready; fails fast on
    /// rejected credentials or an exhausted attempt bound.
    pub async fn start(self: &Arc<Self>) -> AmiResult<()> {
        let conn = self.connect_with_retry().await?;
        let client = Arc::clone(self);
        tokio::spawn(async move { client.supervise(conn).await });
        Ok(())
    }

    /// Terminal: closes the session and suppresses further reconnection.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing);
        if let Some(conn) = self.current.write().await.take() {
            conn.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!("AMI client stopped");
    }

    /// Send an action on the live connection.
    pub async fn send(&self, action: AmiAction) -> AmiResult<ActionResult> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AmiError::Stopped);
        }
        let conn = {
            let guard = self.current.read().await;
            guard.clone()
        };
        match conn {
            Some(conn) if !conn.is_closed() => conn.send(action).await,
            _ => Err(AmiError::Connection("not connected".to_string())),
        }
    }

    /// Query one extension's device state.
    pub async fn extension_state(&self, exten: &str, context: &str) -> AmiResult<ActionResult> {
        self.send(AmiAction::extension_state(exten, context)).await
    }

    /// Bulk device-state query for every extension the switch knows.
    pub async fn extension_state_list(&self) -> AmiResult<ActionResult> {
        self.send(AmiAction::extension_state_list()).await
    }

    /// Subscribe to unsolicited events by event name.
    pub fn subscribe(&self, event_name: &str) -> broadcast::Receiver<Arc<Message>> {
        self.router.subscribe(event_name)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn health(&self) -> ClientHealth {
        let pending_actions = self
            .current
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|conn| conn.pending_actions()))
            .unwrap_or(0);
        ClientHealth {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            permanently_failed: self.permanently_failed.load(Ordering::SeqCst),
            last_error: self.last_error.lock().unwrap().clone(),
            pending_actions,
        }
    }

    async fn supervise(self: Arc<Self>, mut conn: Arc<AmiConnection>) {
        loop {
            conn.wait_closed().await;
            self.current.write().await.take();
            self.set_state(ConnectionState::Disconnected);

            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            warn!("AMI connection lost; reconnecting");
            match self.connect_with_retry().await {
                Ok(next) => conn = next,
                Err(e) => {
                    error!("AMI client giving up: {}", e);
                    return;
                }
            }
        }
    }

    async fn connect_with_retry(&self) -> AmiResult<Arc<AmiConnection>> {
        let reconnect = &self.config.reconnect;
        let mut delay = reconnect.initial_delay;

        for attempt in 1..=reconnect.max_attempts {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(AmiError::Stopped);
            }
            match self.establish().await {
                Ok(conn) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    return Ok(conn);
                }
                Err(e @ AmiError::Authentication(_)) => {
                    // Bad credentials will not get better by retrying.
                    self.record_failure(&e);
                    self.permanently_failed.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    self.consecutive_failures.store(attempt, Ordering::SeqCst);
                    self.record_failure(&e);
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt, reconnect.max_attempts, e
                    );
                    if attempt < reconnect.max_attempts {
                        sleep(delay).await;
                        delay = (delay * 2).min(reconnect.max_delay);
                    }
                }
            }
        }

        self.permanently_failed.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Err(AmiError::ReconnectExhausted {
            attempts: reconnect.max_attempts,
        })
    }

    async fn establish(&self) -> AmiResult<Arc<AmiConnection>> {
        self.set_state(ConnectionState::Connecting);
        let conn = AmiConnection::open(&self.config, Arc::clone(&self.router)).await?;

        self.set_state(ConnectionState::Authenticating);
        if let Err(e) = conn.login().await {
            conn.close().await;
            return Err(e);
        }

        conn.start_keepalive();
        *self.current.write().await = Some(Arc::clone(&conn));
        self.set_state(ConnectionState::Ready);
        Ok(conn)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn record_failure(&self, err: &AmiError) {
        *self.last_error.lock().unwrap() = Some(err.to_string());
    }
}
