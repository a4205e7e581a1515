// src/ami/connection.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::config::AmiConfig;
use crate::error::{AmiError, AmiResult};

use super::action::{ActionIdGenerator, AmiAction};
use super::codec::FrameCodec;
use super::correlator::{ActionResult, Correlator};
use super::message::{Message, MessageKind};
use super::router::EventRouter;

/// Connection lifecycle. The socket is opened and closed only through these
/// transitions, owned by [`super::client::AmiClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

/// One live TCP session to the manager interface.
///
/// Owns the write half (serialized behind a mutex so concurrent actions never
/// interleave partial commands) and a read-loop task that feeds the frame
/// codec, the correlator, and the event router in strict arrival order.
pub struct AmiConnection {
    peer: String,
    config: AmiConfig,
    writer: Mutex<OwnedWriteHalf>,
    correlator: Arc<Correlator>,
    router: Arc<EventRouter>,
    ids: ActionIdGenerator,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl AmiConnection {
    /// Dial the switch and read its protocol banner. The returned connection
    /// is not authenticated yet; call [`Self::login`].
    pub async fn open(config: &AmiConfig, router: Arc<EventRouter>) -> AmiResult<Arc<Self>> {
        let peer = format!("{}:{}", config.host, config.port);
        debug!("Connecting to AMI: {}", peer);

        let mut stream = timeout(config.auth_timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| AmiError::Connection(format!("connect to {} timed out", peer)))??;

        let banner = timeout(config.auth_timeout, Self::read_banner(&mut stream))
            .await
            .map_err(|_| AmiError::Connection("timed out waiting for protocol banner".into()))??;
        info!(peer = %peer, banner = %banner, "AMI banner received");

        let (read_half, write_half) = stream.into_split();
        let correlator = Arc::new(Correlator::new(config.grace_period));
        let (closed_tx, _) = watch::channel(false);

        let conn = Arc::new(Self {
            peer,
            config: config.clone(),
            writer: Mutex::new(write_half),
            correlator,
            router,
            ids: ActionIdGenerator::new(),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(Self::read_loop(Arc::clone(&conn), read_half));
        Ok(conn)
    }

    /// Authenticate under the dedicated auth timeout. Credential rejection
    /// is fatal and is not retried by the reconnect loop.
    pub async fn login(&self) -> AmiResult<()> {
        let action =
            AmiAction::login(&self.config.username, &self.config.secret).timeout(self.config.auth_timeout);
        let result = self.send(action).await.map_err(|e| match e {
            AmiError::QueryTimeout { .. } => {
                AmiError::Connection("login timed out".to_string())
            }
            other => other,
        })?;

        match result.response {
            Some(resp) if resp.is_success() => {
                info!(peer = %self.peer, "Authenticated to AMI");
                Ok(())
            }
            Some(resp) => Err(AmiError::Authentication(
                resp.message_text().unwrap_or("credentials rejected").to_string(),
            )),
            None => Err(AmiError::Authentication(
                "login completed without a response".to_string(),
            )),
        }
    }

    /// Periodic no-op ping keeping the socket verified writable; the first
    /// failed ping closes the connection so the supervisor can reconnect.
    pub fn start_keepalive(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.config.keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = conn.send(AmiAction::ping()).await {
                            warn!(peer = %conn.peer, "Keepalive ping failed: {}", e);
                            conn.mark_closed("keepalive failed").await;
                            break;
                        }
                    }
                    _ = closed_rx.changed() => break,
                }
            }
        });
    }

    /// Send an action and await its completion per its policy.
    pub async fn send(&self, action: AmiAction) -> AmiResult<ActionResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmiError::Connection("connection closed".to_string()));
        }

        let action_id = self.ids.next_id();
        let rx = self.correlator.register(&action_id, action.policy.clone())?;
        let wire = action.to_wire(&action_id);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(wire.as_bytes()).await {
                drop(writer);
                self.correlator.expire(&action_id);
                self.mark_closed("write failed").await;
                return Err(AmiError::Connection(format!("write failed: {}", e)));
            }
            if let Err(e) = writer.flush().await {
                drop(writer);
                self.correlator.expire(&action_id);
                self.mark_closed("flush failed").await;
                return Err(AmiError::Connection(format!("flush failed: {}", e)));
            }
        }

        let deadline = action.timeout.unwrap_or(self.config.query_timeout);
        match timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AmiError::Connection(
                "connection lost while awaiting response".to_string(),
            )),
            Err(_) => {
                let events = self.correlator.expire(&action_id);
                Err(AmiError::QueryTimeout { action_id, events })
            }
        }
    }

    /// Orderly shutdown: logoff, close the socket, cancel pending actions.
    pub async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let logoff = AmiAction::logoff().timeout(std::time::Duration::from_secs(2));
        if let Err(e) = self.send(logoff).await {
            debug!(peer = %self.peer, "Logoff before close failed: {}", e);
        }
        self.mark_closed("stopped").await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is gone, however it went.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn pending_actions(&self) -> usize {
        self.correlator.pending_count()
    }

    async fn mark_closed(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(peer = %self.peer, "Connection closing: {}", reason);
        self.correlator.fail_all(reason);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        // send_replace stores the value even with no receiver subscribed
        // yet, so a supervisor that calls wait_closed after the read loop
        // already died still observes the loss.
        self.closed_tx.send_replace(true);
    }

    async fn read_loop(conn: Arc<Self>, read_half: OwnedReadHalf) {
        let mut framed = FramedRead::new(read_half, FrameCodec::new());
        let reason;
        loop {
            match framed.next().await {
                Some(Ok(frame)) => {
                    let msg = Message::parse(&frame);
                    if msg.kind == MessageKind::Unknown {
                        // Already logged by the classifier; the stream goes on.
                        continue;
                    }
                    if let Some(unclaimed) = conn.correlator.on_message(msg) {
                        conn.router.dispatch(unclaimed);
                    }
                }
                Some(Err(AmiError::Protocol(e))) => {
                    // Truncated trailing frame at EOF.
                    error!(peer = %conn.peer, "Protocol error: {}", e);
                    reason = "protocol error";
                    break;
                }
                Some(Err(e)) => {
                    error!(peer = %conn.peer, "Read error: {}", e);
                    reason = "read error";
                    break;
                }
                None => {
                    reason = "connection closed by peer";
                    break;
                }
            }
        }
        conn.mark_closed(reason).await;
    }

    /// The switch greets with a single non-frame line
    /// (`Asterisk Call Manager/<version>`) before the first frame.
    async fn read_banner(stream: &mut TcpStream) -> AmiResult<String> {
        let mut banner = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(AmiError::Connection(
                    "connection closed before banner".to_string(),
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                banner.push(byte[0]);
            }
            if banner.len() > 256 {
                return Err(AmiError::Protocol("banner line too long".to_string()));
            }
        }
        Ok(String::from_utf8_lossy(&banner).into_owned())
    }
}
