// src/ami/action.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// An outgoing manager action.
///
/// Serialized as newline-delimited `Key: Value` pairs terminated by a blank
/// line, with `Action` first and the `ActionID` attached by the correlator.
#[derive(Debug, Clone)]
pub struct AmiAction {
    pub name: String,
    pub fields: Vec<(String, String)>,
    pub policy: CompletionPolicy,
    /// Per-action deadline; `None` falls back to the configured default.
    pub timeout: Option<Duration>,
}

impl AmiAction {
    pub fn new(name: impl Into<String>, policy: CompletionPolicy) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            policy,
            timeout: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn login(username: &str, secret: &str) -> Self {
        Self::new("Login", CompletionPolicy::OnResponse)
            .field("Username", username)
            .field("Secret", secret)
            .field("Events", "on")
    }

    pub fn logoff() -> Self {
        Self::new("Logoff", CompletionPolicy::OnResponse)
    }

    pub fn ping() -> Self {
        Self::new("Ping", CompletionPolicy::OnResponse)
    }

    /// Query one extension's device state in a dialplan context. No
    /// completion event exists for this action, so the grace window catches
    /// any status events the switch tags with the same ActionID.
    pub fn extension_state(exten: &str, context: &str) -> Self {
        Self::new("ExtensionState", CompletionPolicy::OnResponseWithGrace)
            .field("Exten", exten)
            .field("Context", context)
    }

    /// Bulk state query. Servers answer either with one `ExtensionStatus`
    /// event per extension plus a trailing list-complete event, or with a
    /// single aggregated response; the policy resolves both shapes.
    pub fn extension_state_list() -> Self {
        Self::new(
            "ExtensionStateList",
            CompletionPolicy::AwaitEvent("ExtensionStateListComplete".to_string()),
        )
    }

    pub fn to_wire(&self, action_id: &str) -> String {
        let mut out = format!("Action: {}\r\nActionID: {}\r\n", self.name, action_id);
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// When a pending action is considered done.
///
/// One prioritized rule set replaces the ad hoc heuristics that tend to
/// accrete around this protocol: an explicit completion event always wins;
/// a terminal response alone resolves after a grace window so trailing
/// events tagged with the same ActionID are still folded in; a deadline
/// with neither signal fails the action but keeps the accumulated events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Expect a named completion event (list queries). A terminal response
    /// without that event still resolves after the grace window, which is
    /// what auto-detects aggregated-response servers.
    AwaitEvent(String),
    /// No completion event exists for this action type; the terminal
    /// response plus the grace window resolves it.
    OnResponseWithGrace,
    /// The terminal response alone resolves it immediately (login, ping).
    OnResponse,
}

impl CompletionPolicy {
    /// Whether a terminal success response should arm the grace window
    /// instead of resolving on the spot.
    pub fn wants_grace(&self) -> bool {
        !matches!(self, CompletionPolicy::OnResponse)
    }

    pub fn completion_event(&self) -> Option<&str> {
        match self {
            CompletionPolicy::AwaitEvent(name) => Some(name),
            _ => None,
        }
    }
}

/// ActionID source: a per-connection random nonce plus a monotonically
/// increasing counter, so identifiers never collide across connection
/// restarts.
#[derive(Debug)]
pub struct ActionIdGenerator {
    nonce: u32,
    seq: AtomicU64,
}

impl ActionIdGenerator {
    pub fn new() -> Self {
        Self {
            nonce: rand::random(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:08x}", seq, self.nonce)
    }
}

impl Default for ActionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let action = AmiAction::extension_state("100", "from-internal");
        let wire = action.to_wire("7-cafe01");
        assert_eq!(
            wire,
            "Action: ExtensionState\r\nActionID: 7-cafe01\r\nExten: 100\r\nContext: from-internal\r\n\r\n"
        );
    }

    #[test]
    fn test_login_fields() {
        let wire = AmiAction::login("monitor", "s3cret").to_wire("1-0");
        assert!(wire.starts_with("Action: Login\r\n"));
        assert!(wire.contains("Username: monitor\r\n"));
        assert!(wire.contains("Secret: s3cret\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_policy_grace() {
        assert!(!CompletionPolicy::OnResponse.wants_grace());
        assert!(CompletionPolicy::OnResponseWithGrace.wants_grace());
        assert!(CompletionPolicy::AwaitEvent("XComplete".into()).wants_grace());
        assert_eq!(
            CompletionPolicy::AwaitEvent("XComplete".into()).completion_event(),
            Some("XComplete")
        );
    }

    #[test]
    fn test_action_ids_unique_and_increasing() {
        let gen = ActionIdGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("1-"));
        assert!(b.starts_with("2-"));
        // Same nonce within one generator.
        assert_eq!(a.split('-').nth(1), b.split('-').nth(1));
    }

    #[test]
    fn test_generators_differ_across_restarts() {
        // Nonce collision chance is 2^-32; two fresh generators should not
        // produce the same first id.
        let a = ActionIdGenerator::new().next_id();
        let b = ActionIdGenerator::new().next_id();
        assert_ne!(a, b);
    }
}
