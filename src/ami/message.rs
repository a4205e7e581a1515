// src/ami/message.rs
use tracing::warn;

use super::codec::RawFrame;

/// What kind of protocol message a frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Frame carried a `Response` field (answer to an action).
    Response,
    /// Frame carried an `Event` field (asynchronous notification).
    Event,
    /// Neither. Logged and skipped, never dropped silently.
    Unknown,
}

/// A classified protocol message.
///
/// Fields keep their wire order and case; a duplicate key keeps the last
/// value. One `Message` is built per frame and handed to exactly one
/// consumer (the correlator or the router).
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    fields: Vec<(String, String)>,
    raw_body: String,
}

impl Message {
    /// Parse and classify one frame.
    ///
    /// Each line splits on the first `": "` (colon-space); values may
    /// themselves contain colons (`Channel: SIP/100-0000: odd` keeps
    /// everything after the first `": "`). A line with a colon but no
    /// colon-space is tolerated and split on the bare colon, since some
    /// switch builds omit the space. Lines without a colon are ignored.
    pub fn parse(frame: &RawFrame) -> Self {
        let raw_body = frame.to_text();
        let mut fields = Vec::new();

        for line in raw_body.lines() {
            if line.is_empty() {
                continue;
            }
            let split = line
                .split_once(": ")
                .or_else(|| line.split_once(':'));
            if let Some((key, value)) = split {
                let key = key.trim().to_string();
                let value = value.trim().to_string();
                // Last occurrence wins for duplicate keys.
                if let Some(idx) = fields.iter().position(|(k, _)| k == &key) {
                    fields[idx].1 = value;
                } else {
                    fields.push((key, value));
                }
            }
        }

        let kind = if fields.iter().any(|(k, _)| k == "Response") {
            MessageKind::Response
        } else if fields.iter().any(|(k, _)| k == "Event") {
            MessageKind::Event
        } else {
            warn!(body = %raw_body, "Unclassifiable frame (no Response or Event field)");
            MessageKind::Unknown
        };

        Self {
            kind,
            fields,
            raw_body,
        }
    }

    /// Build a message from parts (tests and the simulator use this).
    pub fn from_fields(kind: MessageKind, fields: Vec<(String, String)>) -> Self {
        let raw_body = fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\r\n");
        Self {
            kind,
            fields,
            raw_body,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn raw_body(&self) -> &str {
        &self.raw_body
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    pub fn event_name(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn response_value(&self) -> Option<&str> {
        self.get("Response")
    }

    /// Terminal response values that end an action's response phase.
    pub fn is_terminal_response(&self) -> bool {
        matches!(
            self.response_value(),
            Some("Success") | Some("Error") | Some("Follows") | Some("Goodbye")
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.response_value(), Some("Success") | Some("Follows"))
    }

    pub fn is_error_response(&self) -> bool {
        self.response_value() == Some("Error")
    }

    pub fn message_text(&self) -> Option<&str> {
        self.get("Message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(text: &str) -> RawFrame {
        RawFrame::new(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn test_classify_response() {
        let msg = Message::parse(&frame("Response: Success\r\nActionID: 3-9f"));
        assert_eq!(msg.kind, MessageKind::Response);
        assert_eq!(msg.action_id(), Some("3-9f"));
        assert!(msg.is_success());
        assert!(msg.is_terminal_response());
    }

    #[test]
    fn test_classify_event() {
        let msg = Message::parse(&frame("Event: ExtensionStatus\r\nExten: 100\r\nStatus: 0"));
        assert_eq!(msg.kind, MessageKind::Event);
        assert_eq!(msg.event_name(), Some("ExtensionStatus"));
        assert_eq!(msg.get("Status"), Some("0"));
    }

    #[test]
    fn test_classify_unknown() {
        let msg = Message::parse(&frame("Whatever: nothing useful"));
        assert_eq!(msg.kind, MessageKind::Unknown);
        assert_eq!(msg.get("Whatever"), Some("nothing useful"));
    }

    #[test]
    fn test_value_with_colons() {
        let msg = Message::parse(&frame("Event: Status\r\nChannel: SIP/100-0000:extra:colons"));
        assert_eq!(msg.get("Channel"), Some("SIP/100-0000:extra:colons"));
    }

    #[test]
    fn test_splits_on_first_colon_space() {
        // The first bare colon is part of the key when the colon-space
        // separator comes later.
        let msg = Message::parse(&frame("Event: Status\r\nX:Y: value"));
        assert_eq!(msg.get("X:Y"), Some("value"));
        assert_eq!(msg.get("X"), None);
    }

    #[test]
    fn test_bare_colon_without_space_tolerated() {
        let msg = Message::parse(&frame("Event: Status\r\nExten:100"));
        assert_eq!(msg.get("Exten"), Some("100"));
    }

    #[test]
    fn test_duplicate_key_keeps_last() {
        let msg = Message::parse(&frame("Event: Status\r\nExten: 100\r\nExten: 200"));
        assert_eq!(msg.get("Exten"), Some("200"));
        // Key order is preserved, the duplicate did not append.
        assert_eq!(msg.fields().len(), 2);
    }

    #[test]
    fn test_error_response() {
        let msg = Message::parse(&frame("Response: Error\r\nMessage: No such extension"));
        assert!(msg.is_error_response());
        assert!(msg.is_terminal_response());
        assert!(!msg.is_success());
        assert_eq!(msg.message_text(), Some("No such extension"));
    }
}
