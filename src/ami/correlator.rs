// src/ami/correlator.rs
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{AmiError, AmiResult};

use super::action::CompletionPolicy;
use super::message::{Message, MessageKind};

/// What an awaited action resolves to.
#[derive(Debug)]
pub struct ActionResult {
    /// The terminal response, when one arrived before completion.
    pub response: Option<Message>,
    /// Every event that carried this action's ActionID, in arrival order.
    pub events: Vec<Message>,
}

struct PendingAction {
    policy: CompletionPolicy,
    issued_at: Instant,
    response: Option<Message>,
    events: Vec<Message>,
    grace_armed: bool,
    tx: oneshot::Sender<AmiResult<ActionResult>>,
}

/// Maps in-flight ActionIDs to their eventual resolution.
///
/// At most one entry exists per ActionID; resolving removes the entry under
/// the same lock that matches messages, so no later message can match a
/// resolved action and cancellation racing a late resolution cannot
/// double-fire the caller's channel.
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingAction>>,
    grace: Duration,
}

impl Correlator {
    pub fn new(grace: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            grace,
        }
    }

    pub fn register(
        &self,
        action_id: &str,
        policy: CompletionPolicy,
    ) -> AmiResult<oneshot::Receiver<AmiResult<ActionResult>>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(action_id) {
            return Err(AmiError::Protocol(format!(
                "duplicate ActionID registered: {}",
                action_id
            )));
        }
        pending.insert(
            action_id.to_string(),
            PendingAction {
                policy,
                issued_at: Instant::now(),
                response: None,
                events: Vec::new(),
                grace_armed: false,
                tx,
            },
        );
        Ok(rx)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Offer an inbound message. Returns the message back when no pending
    /// action claims it, so the caller can route it to subscribers.
    pub fn on_message(self: &Arc<Self>, msg: Message) -> Option<Message> {
        let Some(action_id) = msg.action_id().map(str::to_owned) else {
            return Some(msg);
        };

        let mut pending = self.pending.lock().unwrap();
        if !pending.contains_key(&action_id) {
            return Some(msg);
        }

        match msg.kind {
            MessageKind::Event => {
                let entry = pending.get_mut(&action_id).unwrap();
                let completes = entry
                    .policy
                    .completion_event()
                    .is_some_and(|name| msg.event_name() == Some(name));
                entry.events.push(msg);
                if completes {
                    // Highest-priority completion signal: resolve right away.
                    let entry = pending.remove(&action_id).unwrap();
                    drop(pending);
                    Self::deliver(&action_id, entry);
                }
                None
            }
            MessageKind::Response => {
                let entry = pending.get_mut(&action_id).unwrap();
                if !msg.is_terminal_response() {
                    warn!(action_id = %action_id, response = ?msg.response_value(),
                        "Non-terminal response value; holding action open");
                    entry.response = Some(msg);
                    return None;
                }
                let is_error = msg.is_error_response();
                entry.response = Some(msg);
                if is_error || !entry.policy.wants_grace() {
                    // Errors end the exchange; so do single-response actions.
                    let entry = pending.remove(&action_id).unwrap();
                    drop(pending);
                    Self::deliver(&action_id, entry);
                } else if !entry.grace_armed {
                    // Terminal success without the completion event yet:
                    // leave a grace window for trailing tagged events, which
                    // also resolves servers that answer list queries with a
                    // single aggregated response.
                    entry.grace_armed = true;
                    let this = Arc::clone(self);
                    let grace = self.grace;
                    let id = action_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        this.finish_grace(&id);
                    });
                }
                None
            }
            MessageKind::Unknown => Some(msg),
        }
    }

    fn finish_grace(&self, action_id: &str) {
        let mut pending = self.pending.lock().unwrap();
        // The completion event may have resolved it during the window.
        if let Some(entry) = pending.remove(action_id) {
            drop(pending);
            Self::deliver(action_id, entry);
        }
    }

    /// Give up on an action past its deadline, recovering whatever events
    /// it accumulated.
    pub fn expire(&self, action_id: &str) -> Vec<Message> {
        let mut pending = self.pending.lock().unwrap();
        match pending.remove(action_id) {
            Some(entry) => entry.events,
            None => Vec::new(),
        }
    }

    /// Fail every in-flight action, e.g. on connection loss. Idempotent:
    /// already-resolved actions are simply no longer present.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, PendingAction)> =
            self.pending.lock().unwrap().drain().collect();
        for (action_id, entry) in drained {
            debug!(action_id = %action_id, "Cancelling pending action: {}", reason);
            let _ = entry.tx.send(Err(AmiError::Connection(reason.to_string())));
        }
    }

    fn deliver(action_id: &str, entry: PendingAction) {
        debug!(
            action_id = %action_id,
            events = entry.events.len(),
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "Action resolved"
        );
        let result = ActionResult {
            response: entry.response,
            events: entry.events,
        };
        // Receiver may have timed out and gone away.
        let _ = entry.tx.send(Ok(result));
    }
}
