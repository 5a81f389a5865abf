use crate::audio::StreamHandle;
use std::time::Duration;

/// Failures of the audio device or its streams. The session degrades to idle on these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio stream {0:?} is not open")]
    UnknownStream(StreamHandle),
    #[error("audio i/o failed: {0}")]
    Io(String),
}

/// Failures talking to the conversational backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send: {0}")]
    Send(String),
    #[error("transport disconnected")]
    Disconnected,
}

/// Failures of a tool call. Always converted into an `{"error": ...}` payload.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found")]
    NotFound { name: String },
    #[error("{0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("tool panicked")]
    Panicked,
}

/// Inbound data the transport could not map onto a session event.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed arguments for call {call_id}: {source}")]
    MalformedArguments {
        call_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("arguments for call {call_id} are not a JSON object")]
    ArgumentsNotObject { call_id: String },
    #[error("malformed audio payload: {0}")]
    MalformedAudio(String),
}

/// Failures of the physical trigger.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("trigger i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("trigger unavailable: {0}")]
    Unavailable(String),
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}
