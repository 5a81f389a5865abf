use crate::audio::AudioFrame;
use crate::error::TransportError;
use crate::ToolCallRequest;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Events a conversational backend pushes into the session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Assistant text (text modality).
    TextDelta(String),
    /// Assistant audio to render.
    AudioDelta(AudioFrame),
    /// Transcription of what the user said.
    InputTranscript { text: String, is_final: bool },
    /// Transcription of what the assistant is saying.
    OutputTranscript { text: String, is_final: bool },
    ToolCallRequest(ToolCallRequest),
    /// The backend wants the assistant to stop talking now.
    Interrupt,
    /// The backend finished one response.
    ResponseDone,
    /// A backend-side error that does not end the session.
    Error(String),
}

/// A streaming session with a conversational backend.
///
/// The receiver returned by [`Transport::connect`] closing means the connection was lost.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    /// Sends one complete user turn and asks for a response.
    async fn send_audio(&self, audio: AudioFrame) -> Result<(), TransportError>;

    /// Sends a typed user message and asks for a response.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Hands a tool result back to the backend. With `respond` set, the backend
    /// is asked to answer it; otherwise the result only joins the conversation.
    async fn send_tool_result(
        &self,
        id: &str,
        payload: serde_json::Value,
        respond: bool,
    ) -> Result<(), TransportError>;

    /// Asks the backend to abandon the response in progress. Best effort.
    async fn cancel_response(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError>;
}
