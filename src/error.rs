// src/error.rs
use crate::ami::message::Message;
use thiserror::Error;

pub type AmiResult<T> = Result<T, AmiError>;

#[derive(Error, Debug)]
pub enum AmiError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Query timed out: action {action_id}")]
    QueryTimeout {
        action_id: String,
        /// Events collected before the deadline. Partial data is still
        /// useful to monitoring callers.
        events: Vec<Message>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Synchronization cycle already in progress")]
    Busy,

    #[error("Client stopped")]
    Stopped,

    #[error("Reconnection failed permanently after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for AmiError {
    fn from(err: std::io::Error) -> Self {
        AmiError::Connection(err.to_string())
    }
}

impl AmiError {
    /// Connection-level failures trigger reconnection; everything else is
    /// surfaced to the caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Connection(_) | AmiError::ReconnectExhausted { .. }
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AmiError::Connection(_) => "connection_error",
            AmiError::Authentication(_) => "authentication_error",
            AmiError::QueryTimeout { .. } => "query_timeout",
            AmiError::Protocol(_) => "protocol_error",
            AmiError::Busy => "busy",
            AmiError::Stopped => "stopped",
            AmiError::ReconnectExhausted { .. } => "reconnect_exhausted",
            AmiError::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AmiError::Busy.error_code(), "busy");
        assert_eq!(
            AmiError::Authentication("bad secret".into()).error_code(),
            "authentication_error"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(AmiError::Connection("reset".into()).is_connection_error());
        assert!(!AmiError::Busy.is_connection_error());
        assert!(!AmiError::QueryTimeout {
            action_id: "1-abc".into(),
            events: Vec::new()
        }
        .is_connection_error());
    }
}
