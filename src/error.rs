// MIT License - Copyright (c) 2021 TJForc
// Error taxonomy for the ATS Advanced bridge

use crate::constants::ControlSessionState;

/// All errors that can occur in the ats-advanced-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum AtsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Request timeout: {request}")]
    Timeout { request: String },

    /// Error text carried by a `return.error` response or a `msg.error` push.
    #[error("Panel error: {0}")]
    Panel(String),

    #[error("Unexpected response to {request}: {response}")]
    UnexpectedResponse { request: String, response: String },

    #[error("Missing property '{property}' in {message}")]
    MissingProperty { message: String, property: String },

    #[error("Property '{property}' is {found}, expected {expected}")]
    PropertyType {
        property: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Control session {session_id} in state {actual}, expected {expected}")]
    SessionState {
        session_id: i64,
        expected: ControlSessionState,
        actual: ControlSessionState,
    },

    #[error("Control session {session_id} gave up waiting in state {state} after {attempts} polls")]
    SessionTimeout {
        session_id: i64,
        state: ControlSessionState,
        attempts: u32,
    },

    #[error("Bridge is offline")]
    Offline,

    #[error("Invalid device ID: {id} (max: {max})")]
    InvalidDeviceId { id: u32, max: u32 },

    #[error("Gateway process error: {0}")]
    Gateway(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl AtsError {
    /// Transport faults always tear the session down and force a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AtsError::Io(_)
                | AtsError::Disconnected
                | AtsError::ChannelClosed
                | AtsError::Timeout { .. }
        )
    }

    /// Text the error policy matches fatal markers against.
    pub fn panel_text(&self) -> String {
        match self {
            AtsError::Panel(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for AtsError {
    fn from(e: serde_json::Error) -> Self {
        AtsError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(AtsError::Disconnected.is_transport());
        assert!(AtsError::ChannelClosed.is_transport());
        assert!(AtsError::Timeout { request: "is.Alive".into() }.is_transport());
        assert!(!AtsError::Panel("FAULT_NO_ACCESS".into()).is_transport());
        assert!(!AtsError::Offline.is_transport());
    }

    #[test]
    fn test_panel_text() {
        let err = AtsError::Panel("Connection refused at host X".into());
        assert_eq!(err.panel_text(), "Connection refused at host X");
        let io = AtsError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused",
        ));
        assert!(io.panel_text().contains("Connection refused"));
    }
}
