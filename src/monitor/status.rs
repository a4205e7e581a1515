// src/monitor/status.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mapped device state of a monitored extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Online,
    Offline,
    Unknown,
}

/// Map a raw extension-state code to a device state.
///
/// Pure function over the fixed table: 0 not-in-use, 1 in-use, 2 busy,
/// 8 ringing and 9 ringing-while-in-use all count as Online; 4 means the
/// device is unavailable or unregistered; anything else is Unknown.
pub fn map_status_code(raw: &str) -> DeviceState {
    match raw.trim() {
        "0" | "1" | "2" | "8" | "9" => DeviceState::Online,
        "4" => DeviceState::Offline,
        _ => DeviceState::Unknown,
    }
}

/// Last known status of one monitored extension. Written only by the
/// synchronizer, and only when something actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStatus {
    pub extension: String,
    pub raw_code: String,
    pub state: DeviceState,
    pub context: String,
    pub last_seen: DateTime<Utc>,
    pub last_changed: DateTime<Utc>,
}

impl ExtensionStatus {
    pub fn observed(extension: &str, raw_code: &str, context: &str) -> Self {
        let now = Utc::now();
        Self {
            extension: extension.to_string(),
            raw_code: raw_code.to_string(),
            state: map_status_code(raw_code),
            context: context.to_string(),
            last_seen: now,
            last_changed: now,
        }
    }

    /// Whether a fresh observation differs from this stored record in any
    /// field that warrants a write.
    pub fn differs_from(&self, raw_code: &str, state: DeviceState, context: &str) -> bool {
        self.state != state || self.raw_code != raw_code || self.context != context
    }
}

/// Notification emitted for each actually-changed extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub extension: String,
    pub previous: Option<DeviceState>,
    pub current: DeviceState,
    pub raw_code: String,
    pub context: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_table() {
        for code in ["0", "1", "2", "8", "9"] {
            assert_eq!(map_status_code(code), DeviceState::Online, "code {}", code);
        }
        assert_eq!(map_status_code("4"), DeviceState::Offline);
        for code in ["-1", "16", "32", "banana", ""] {
            assert_eq!(map_status_code(code), DeviceState::Unknown, "code {}", code);
        }
    }

    #[test]
    fn test_mapping_is_stable() {
        // Same input, same output, every time.
        assert_eq!(map_status_code("8"), map_status_code("8"));
        assert_eq!(map_status_code(" 0 "), DeviceState::Online);
    }

    #[test]
    fn test_differs_from() {
        let status = ExtensionStatus::observed("100", "0", "from-internal");
        assert!(!status.differs_from("0", DeviceState::Online, "from-internal"));
        assert!(status.differs_from("1", DeviceState::Online, "from-internal"));
        assert!(status.differs_from("0", DeviceState::Online, "other-context"));
        assert!(status.differs_from("4", DeviceState::Offline, "from-internal"));
    }
}
